//! Device state machines.
//!
//! Each controller owns one [`DeviceState`]: a top-level lifecycle
//! (`LOADED -> ONLINE -> OFFLINE`) plus a substate that is `IDLE`, busy with
//! one activity, or `FAILED`. [`transition`] is a pure function; controllers
//! apply it and publish the result, they never mutate the state in place.
//!
//! A failure is either soft (timeout, rollback) and the next operation may
//! retry from `FAILED`, or hard (broken transport, closed connection) and
//! every operation is refused until the device is reconnected.

use crate::error::{DcbError, DcbResult};
use std::fmt;

/// Which controller a state machine belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Filter-wheel controller
    FilterWheel,
    /// Lamp bank behind the PDU
    Sources,
}

impl DeviceKind {
    /// Name used in keywords and logs.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::FilterWheel => "filterwheel",
            DeviceKind::Sources => "sources",
        }
    }

    /// Activities this kind of device can be busy with.
    pub fn allows(&self, activity: Activity) -> bool {
        match self {
            DeviceKind::FilterWheel => matches!(activity, Activity::Moving | Activity::Zeroing),
            DeviceKind::Sources => matches!(activity, Activity::Warming | Activity::Switching),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Top-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created, never connected
    Loaded,
    /// Connected and accepting commands
    Online,
    /// Disconnected on request
    Offline,
}

impl Lifecycle {
    /// Upper-case name, as reported in the FSM keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Loaded => "LOADED",
            Lifecycle::Online => "ONLINE",
            Lifecycle::Offline => "OFFLINE",
        }
    }
}

/// What a busy device is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Wheel move or calibration
    Moving,
    /// ADC offset zeroing
    Zeroing,
    /// Lamps switching on, warming up, or running a timed sequence
    Warming,
    /// Lamps switching off
    Switching,
}

impl Activity {
    /// Upper-case name, as reported in the FSM keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            Activity::Moving => "MOVING",
            Activity::Zeroing => "ZEROING",
            Activity::Warming => "WARMING",
            Activity::Switching => "SWITCHING",
        }
    }
}

/// Why a device is `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Error text of the failed operation
    pub reason: String,
    /// Hard faults refuse every operation until reconnected
    pub hard: bool,
}

/// Substate within a lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Substate {
    /// Ready for the next operation
    Idle,
    /// An operation is running
    Busy(Activity),
    /// The last operation failed
    Failed(Fault),
}

impl Substate {
    /// Upper-case name, as reported in the FSM keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            Substate::Idle => "IDLE",
            Substate::Busy(activity) => activity.as_str(),
            Substate::Failed(_) => "FAILED",
        }
    }
}

/// Published state of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    /// Connection state
    pub lifecycle: Lifecycle,
    /// Activity state
    pub substate: Substate,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            lifecycle: Lifecycle::Loaded,
            substate: Substate::Idle,
        }
    }
}

impl DeviceState {
    /// Whether an operation is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self.substate, Substate::Busy(_))
    }

    /// The fault, if the device is hard-failed.
    pub fn hard_fault(&self) -> Option<&Fault> {
        match &self.substate {
            Substate::Failed(fault) if fault.hard => Some(fault),
            _ => None,
        }
    }

    /// `<device>FSM=<STATE>,<SUBSTATE>`
    pub fn keyword(&self, kind: DeviceKind) -> String {
        format!(
            "{}FSM={},{}",
            kind.name(),
            self.lifecycle.as_str(),
            self.substate.as_str()
        )
    }
}

/// Input to [`transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Transport opened
    Connect,
    /// Transport closed on request
    Disconnect,
    /// Operation started
    Start(Activity),
    /// Operation finished or was aborted
    Succeed,
    /// Operation failed
    Fail(Fault),
}

impl Event {
    fn describe(&self) -> String {
        match self {
            Event::Connect => "connect".to_string(),
            Event::Disconnect => "disconnect".to_string(),
            Event::Start(activity) => format!("start {}", activity.as_str()),
            Event::Succeed => "complete".to_string(),
            Event::Fail(_) => "fail".to_string(),
        }
    }

    /// Failure event for an error raised while busy.
    pub fn fail_with(error: &DcbError) -> Self {
        Event::Fail(Fault {
            reason: error.to_string(),
            hard: error.is_hard_fault(),
        })
    }
}

/// Apply `event` to `state`.
///
/// Returns the next state, or the reason the event is not allowed.
pub fn transition(kind: DeviceKind, state: &DeviceState, event: Event) -> DcbResult<DeviceState> {
    let invalid = |event: &Event| DcbError::InvalidTransition {
        device: kind.name().to_string(),
        state: format!("{},{}", state.lifecycle.as_str(), state.substate.as_str()),
        operation: event.describe(),
    };

    match (&state.lifecycle, &state.substate, event) {
        // Reconnecting is the way out of a hard fault.
        (_, Substate::Busy(_), event @ (Event::Connect | Event::Disconnect)) => Err(invalid(&event)),
        (_, _, Event::Connect) => Ok(DeviceState {
            lifecycle: Lifecycle::Online,
            substate: Substate::Idle,
        }),
        (_, _, Event::Disconnect) => Ok(DeviceState {
            lifecycle: Lifecycle::Offline,
            substate: Substate::Idle,
        }),

        (Lifecycle::Online, Substate::Failed(fault), Event::Start(_)) if fault.hard => {
            Err(DcbError::DeviceFailed {
                device: kind.name().to_string(),
                reason: fault.reason.clone(),
            })
        }
        (Lifecycle::Online, Substate::Idle | Substate::Failed(_), Event::Start(activity))
            if kind.allows(activity) =>
        {
            Ok(DeviceState {
                lifecycle: Lifecycle::Online,
                substate: Substate::Busy(activity),
            })
        }

        (Lifecycle::Online, Substate::Busy(_), Event::Succeed) => Ok(DeviceState {
            lifecycle: Lifecycle::Online,
            substate: Substate::Idle,
        }),
        (Lifecycle::Online, Substate::Busy(_), Event::Fail(fault)) => Ok(DeviceState {
            lifecycle: Lifecycle::Online,
            substate: Substate::Failed(fault),
        }),

        (_, _, event) => Err(invalid(&event)),
    }
}
