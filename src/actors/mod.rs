//! Device controller actors
//!
//! Each physical device is owned by one kameo actor. The actor's mailbox is
//! the device's single worker: state-mutating operations are messages, handled
//! one at a time, so a second request queues behind the one in flight and
//! never interleaves with it.
//!
//! Two paths bypass the mailbox on purpose:
//! - the FSM state is published through a `watch` channel, so snapshots can be
//!   taken while a long operation is running
//! - lamp warm-up abort cancels a shared token instead of sending a message

use crate::error::{DcbError, DcbResult};
use crate::fsm::{transition, DeviceKind, DeviceState, Event};
use kameo::error::SendError;
use tokio::sync::watch;
use tracing::{error, info};

pub mod filterwheel;
pub mod sources;

pub use filterwheel::{
    FilterWheel, FilterWheelHandle, FilterWheelSnapshot, FilterWheelStatus, MoveTarget,
};
pub use sources::{Sources, SourcesHandle, SourcesSnapshot};

/// Owner side of a device's published FSM state.
#[derive(Debug)]
pub(crate) struct StateCell {
    kind: DeviceKind,
    tx: watch::Sender<DeviceState>,
}

impl StateCell {
    pub(crate) fn new(kind: DeviceKind) -> Self {
        let (tx, _rx) = watch::channel(DeviceState::default());
        Self { kind, tx }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.tx.subscribe()
    }

    pub(crate) fn current(&self) -> DeviceState {
        self.tx.borrow().clone()
    }

    /// Apply an event and publish the resulting state.
    pub(crate) fn apply(&self, event: Event) -> DcbResult<DeviceState> {
        let next = transition(self.kind, &self.current(), event)?;
        info!(
            "{} -> {},{}",
            self.kind,
            next.lifecycle.as_str(),
            next.substate.as_str()
        );
        self.tx.send_replace(next.clone());
        Ok(next)
    }

    /// Close a busy period with the outcome of the operation.
    ///
    /// A user abort ends the activity normally; any other error leaves the
    /// device `FAILED`. The outcome is passed through unchanged.
    pub(crate) fn settle<T>(&self, result: DcbResult<T>) -> DcbResult<T> {
        let event = match &result {
            Ok(_) | Err(DcbError::UserAborted(_)) => Event::Succeed,
            Err(e) => {
                error!("{} failed: {}", self.kind, e);
                Event::fail_with(e)
            }
        };
        if let Err(e) = self.apply(event) {
            error!("{}: {}", self.kind, e);
        }
        result
    }
}

/// Unwrap a handler error, or report the actor as gone.
pub(crate) fn reply_error<M>(kind: DeviceKind, err: SendError<M, DcbError>) -> DcbError {
    match err {
        SendError::HandlerError(e) => e,
        _ => DcbError::ActorUnavailable(kind.name().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{Activity, Substate};
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_state_cell_publishes_and_logs_transitions() {
        let cell = StateCell::new(DeviceKind::Sources);
        let rx = cell.subscribe();

        cell.apply(Event::Connect).unwrap();
        cell.apply(Event::Start(Activity::Warming)).unwrap();
        assert_eq!(rx.borrow().substate, Substate::Busy(Activity::Warming));
        assert!(logs_contain("sources -> ONLINE,WARMING"));
    }

    #[traced_test]
    #[test]
    fn test_settle_classifies_outcome() {
        let cell = StateCell::new(DeviceKind::FilterWheel);
        cell.apply(Event::Connect).unwrap();

        cell.apply(Event::Start(Activity::Moving)).unwrap();
        let aborted: DcbResult<()> = Err(DcbError::UserAborted("move".into()));
        assert!(cell.settle(aborted).is_err());
        assert_eq!(cell.current().substate, Substate::Idle);

        cell.apply(Event::Start(Activity::Moving)).unwrap();
        let unsaved: DcbResult<()> = Err(DcbError::Persistence("state.json: read-only".into()));
        assert!(cell.settle(unsaved).is_err());
        assert_eq!(cell.current().substate.as_str(), "FAILED");
        assert!(cell.current().hard_fault().is_none());

        cell.apply(Event::Start(Activity::Moving)).unwrap();
        let closed: DcbResult<()> = Err(DcbError::ConnectionClosed);
        assert!(cell.settle(closed).is_err());
        assert!(cell.current().hard_fault().is_some());
        assert!(logs_contain("filterwheel failed: Connection closed by peer"));
    }

    #[test]
    fn test_reply_error_unwraps_handler_error() {
        let err: SendError<(), DcbError> = SendError::HandlerError(DcbError::NotConnected);
        assert!(matches!(
            reply_error(DeviceKind::Sources, err),
            DcbError::NotConnected
        ));

        let gone: SendError<(), DcbError> = SendError::ActorNotRunning(());
        assert!(matches!(
            reply_error(DeviceKind::Sources, gone),
            DcbError::ActorUnavailable(name) if name == "sources"
        ));
    }
}
