//! Filter-wheel controller actor
//!
//! Kameo actor driving the DCB filter-wheel controller: two wheels
//! (`linewheel`, `qthwheel`) on one TCP line interface, plus two photodiode
//! ADC channels.
//!
//! ## Protocol
//!
//! - `<wheel> -1` calibrates a wheel. The controller first names the wheel
//!   port it selected (`Calibrating FW <port>`), then announces the cycle
//!   (`Calibrating`) and finally prints `Done`.
//! - `<wheel> <n>` moves a wheel and ends with `Moved to position <n>`.
//! - `adc <channel>` prints one reading.
//! - `adccalib` then `continue` zero the ADC offsets.
//!
//! A wheel position is only persisted once the controller has confirmed it.
//!
//! ## Example Usage
//!
//! ```no_run
//! use dcb_actor::actors::{FilterWheelHandle, MoveTarget};
//! use dcb_actor::adapters::filterwheel_transport;
//! use dcb_actor::config::DcbConfig;
//! use dcb_actor::sink::TracingSink;
//! use dcb_actor::status::Wheel;
//! use dcb_actor::store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> dcb_actor::error::DcbResult<()> {
//! let config = DcbConfig::default().filterwheel;
//! let transport = filterwheel_transport(&config);
//! let wheel = FilterWheelHandle::spawn(config, transport, Arc::new(MemoryStore::new()));
//!
//! let sink = Arc::new(TracingSink);
//! wheel.connect(sink.clone()).await?;
//! wheel.initialize(Wheel::Linewheel, sink.clone()).await?;
//! wheel.move_to(Wheel::Linewheel, MoveTarget::Hole("2.0".into()), sink).await?;
//! # Ok(())
//! # }
//! ```

use super::{reply_error, StateCell};
use crate::adapters::LineTransport;
use crate::config::FilterWheelConfig;
use crate::error::{DcbError, DcbResult};
use crate::fsm::{Activity, DeviceKind, DeviceState, Event, Lifecycle};
use crate::hardware::{Limits, LineDriver};
use crate::sink::{text_keyword, CommandSink};
use crate::status::{
    load_wheel_status, persist_wheel_position, Wheel, WheelStatus, WheelTable, HOME_POSITION,
};
use crate::store::KeyValueStore;
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const MOVED_MARKER: &str = "Moved to position";
const CALIBRATION_START_MARKER: &str = "Calibrating";
const CALIBRATION_DONE_MARKER: &str = "Done";
const ADC_ZERO_PROMPT_MARKER: &str = "type continue";
const ADC_ZERO_DONE_MARKER: &str = "Offsets calibrated";
const ADC_CHANNELS: [u8; 2] = [1, 2];

/// Requested wheel position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveTarget {
    /// 1-based slot
    Slot(i32),
    /// Hole label from the wheel table
    Hole(String),
}

impl FromStr for MoveTarget {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<i32>() {
            Ok(slot) => MoveTarget::Slot(slot),
            Err(_) => MoveTarget::Hole(s.to_string()),
        })
    }
}

impl fmt::Display for MoveTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoveTarget::Slot(slot) => write!(f, "{slot}"),
            MoveTarget::Hole(hole) => f.write_str(hole),
        }
    }
}

/// Result of a full status request.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterWheelStatus {
    /// FSM state when the status was taken
    pub state: DeviceState,
    /// Readings of both ADC channels, when the device answered
    pub adc: Option<(String, String)>,
    /// Reconciled position of each wheel
    pub wheels: Vec<WheelStatus>,
}

/// State readable without going through the mailbox.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterWheelSnapshot {
    /// FSM state when the status was taken
    pub state: DeviceState,
    /// Reconciled position of each wheel
    pub wheels: Vec<WheelStatus>,
}

/// Filter-wheel controller actor
pub struct FilterWheel {
    config: FilterWheelConfig,
    driver: LineDriver,
    store: Arc<dyn KeyValueStore>,
    state: StateCell,
}

impl FilterWheel {
    /// Actor state; nothing is opened until [`Connect`].
    pub fn new(
        config: FilterWheelConfig,
        transport: Box<dyn LineTransport>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            config,
            driver: LineDriver::new(transport),
            store,
            state: StateCell::new(DeviceKind::FilterWheel),
        }
    }

    fn table(&self, wheel: Wheel) -> WheelTable {
        WheelTable::new(self.config.wheel(wheel).holes.clone())
    }

    fn limits(&self, total_secs: u64) -> Limits {
        Limits::new(
            self.config.read_timeout(),
            Duration::from_secs(total_secs),
            self.config.max_iterations,
        )
    }

    /// One reply to a short query.
    fn query_limits(&self) -> Limits {
        let window = self.config.read_timeout();
        Limits::new(window, window * 3, self.config.max_iterations)
    }

    async fn connect(&mut self, sink: &dyn CommandSink) -> DcbResult<()> {
        self.driver.close().await?;
        self.driver.connect().await?;

        // Same ADC query the status uses; a silent controller is not online.
        let limits = self.query_limits();
        if let Err(e) = self.driver.query("adc 1", limits).await {
            let _ = self.driver.close().await;
            return Err(e);
        }

        self.state.apply(Event::Connect)?;
        sink.inform(&text_keyword(&format!(
            "filterwheel connected to {}",
            self.driver.describe()
        )));
        Ok(())
    }

    async fn disconnect(&mut self, sink: &dyn CommandSink) -> DcbResult<()> {
        self.state.apply(Event::Disconnect)?;
        self.driver.close().await?;
        sink.inform(&text_keyword("filterwheel disconnected"));
        Ok(())
    }

    async fn move_wheel(
        &mut self,
        wheel: Wheel,
        target: MoveTarget,
        sink: &dyn CommandSink,
    ) -> DcbResult<WheelStatus> {
        let table = self.table(wheel);
        let position = check_move(&self.config, self.store.as_ref(), wheel, &target).await?;

        self.state.apply(Event::Start(Activity::Moving))?;
        let result = self.drive_move(wheel, position, &table, sink).await;
        self.state.settle(result)
    }

    async fn drive_move(
        &mut self,
        wheel: Wheel,
        position: i32,
        table: &WheelTable,
        sink: &dyn CommandSink,
    ) -> DcbResult<WheelStatus> {
        info!("moving {} to position {}", wheel, position);
        let limits = self.limits(self.config.move_time_limit_secs);
        let line = self
            .driver
            .run_until_accepted(
                &format!("{wheel} {position}"),
                MOVED_MARKER,
                limits,
                sink,
                |line| confirms_position(wheel, line, position),
            )
            .await?;

        let reached = parse_moved(&line)?;
        persist_wheel_position(self.store.as_ref(), wheel, reached).await?;

        let status = load_wheel_status(self.store.as_ref(), wheel, table).await;
        sink.inform(&status.keyword());
        Ok(status)
    }

    async fn initialize(&mut self, wheel: Wheel, sink: &dyn CommandSink) -> DcbResult<WheelStatus> {
        self.state.apply(Event::Start(Activity::Moving))?;
        let result = self.drive_calibration(wheel, sink).await;
        self.state.settle(result)
    }

    async fn drive_calibration(
        &mut self,
        wheel: Wheel,
        sink: &dyn CommandSink,
    ) -> DcbResult<WheelStatus> {
        let fw_port = self.config.wheel(wheel).fw_port;
        info!("calibrating {} (FW {})", wheel, fw_port);

        // The controller confirms which wheel port it selected.
        let select = self.limits(self.config.calibration_select_secs);
        self.driver
            .run_until(
                &format!("{wheel} -1"),
                &format!("Calibrating FW {fw_port}"),
                select,
                sink,
            )
            .await?;

        let start = self.limits(self.config.calibration_start_secs);
        self.driver
            .read_until(CALIBRATION_START_MARKER, start, sink)
            .await?;

        let done = self.limits(self.config.calibration_done_secs);
        match self
            .driver
            .read_until(CALIBRATION_DONE_MARKER, done, sink)
            .await
        {
            Ok(_) => {}
            Err(e @ DcbError::Timeout { .. }) => {
                return Err(DcbError::CalibrationFailed {
                    wheel: wheel.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(e) => return Err(e),
        }

        persist_wheel_position(self.store.as_ref(), wheel, HOME_POSITION).await?;
        let status = load_wheel_status(self.store.as_ref(), wheel, &self.table(wheel)).await;
        sink.inform(&status.keyword());
        Ok(status)
    }

    async fn zero_adc(&mut self, sink: &dyn CommandSink) -> DcbResult<()> {
        self.state.apply(Event::Start(Activity::Zeroing))?;
        let result = self.drive_adc_zero(sink).await;
        self.state.settle(result)
    }

    async fn drive_adc_zero(&mut self, sink: &dyn CommandSink) -> DcbResult<()> {
        let limits = self.limits(self.config.adc_zero_secs);
        self.driver
            .run_until("adccalib", ADC_ZERO_PROMPT_MARKER, limits, sink)
            .await?;
        self.driver
            .run_until("continue", ADC_ZERO_DONE_MARKER, limits, sink)
            .await?;
        info!("ADC offsets zeroed");
        Ok(())
    }

    async fn read_adc(&mut self) -> DcbResult<(String, String)> {
        let limits = self.query_limits();
        let mut readings = Vec::with_capacity(ADC_CHANNELS.len());
        for channel in ADC_CHANNELS {
            readings.push(self.driver.query(&format!("adc {channel}"), limits).await?);
        }
        let second = readings.pop().unwrap_or_default();
        let first = readings.pop().unwrap_or_default();
        Ok((first, second))
    }

    async fn status(&mut self, sink: &dyn CommandSink) -> DcbResult<FilterWheelStatus> {
        let state = self.state.current();
        sink.inform(&state.keyword(DeviceKind::FilterWheel));
        sink.inform(&format!("filterwheelMode={}", self.config.mode.as_str()));

        let adc = if state.lifecycle == Lifecycle::Online && state.hard_fault().is_none() {
            match self.read_adc().await {
                Ok(readings) => Some(readings),
                Err(e) => {
                    warn!("filterwheel ADC read failed: {}", e);
                    sink.warn(&text_keyword(&format!("adc read failed: {e}")));
                    None
                }
            }
        } else {
            None
        };
        if let Some((adc1, adc2)) = &adc {
            sink.inform(&format!("adc={adc1},{adc2}"));
        }

        let wheels = reconcile_all(&self.config, self.store.as_ref()).await;
        for wheel in &wheels {
            sink.inform(&wheel.keyword());
        }

        Ok(FilterWheelStatus { state, adc, wheels })
    }
}

/// Move preconditions, checked without touching the device.
async fn check_move(
    config: &FilterWheelConfig,
    store: &dyn KeyValueStore,
    wheel: Wheel,
    target: &MoveTarget,
) -> DcbResult<i32> {
    let table = WheelTable::new(config.wheel(wheel).holes.clone());
    let position = match target {
        MoveTarget::Slot(slot) if table.contains(*slot) => *slot,
        MoveTarget::Slot(slot) => {
            return Err(DcbError::precondition(format!(
                "{wheel}: position {slot} outside 1..={}",
                table.slots()
            )))
        }
        MoveTarget::Hole(hole) => table.position_of(hole).ok_or_else(|| {
            DcbError::precondition(format!(
                "{wheel}: unknown hole '{hole}', valid: {}",
                table.holes().join(",")
            ))
        })?,
    };

    let current = load_wheel_status(store, wheel, &table).await;
    if !current.is_initialized() {
        return Err(DcbError::precondition(format!(
            "{wheel} is not initialized, run init first"
        )));
    }
    Ok(position)
}

async fn reconcile_all(config: &FilterWheelConfig, store: &dyn KeyValueStore) -> Vec<WheelStatus> {
    let mut wheels = Vec::with_capacity(Wheel::ALL.len());
    for wheel in Wheel::ALL {
        let table = WheelTable::new(config.wheel(wheel).holes.clone());
        wheels.push(load_wheel_status(store, wheel, &table).await);
    }
    wheels
}

fn parse_moved(line: &str) -> DcbResult<i32> {
    line.split_once(MOVED_MARKER)
        .and_then(|(_, rest)| rest.trim().parse().ok())
        .ok_or_else(|| DcbError::Parse(format!("no position in '{line}'")))
}

/// Whether `line` confirms that `wheel` reached `position`.
fn confirms_position(wheel: Wheel, line: &str, position: i32) -> bool {
    match parse_moved(line) {
        Ok(reached) if reached == position => true,
        Ok(reached) => {
            warn!("{}: ignoring confirmation for position {}", wheel, reached);
            false
        }
        Err(_) => false,
    }
}

impl Actor for FilterWheel {
    type Args = Self;
    type Error = DcbError;

    async fn on_start(args: Self::Args, _actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(
            "filterwheel actor starting ({} mode, {})",
            args.config.mode.as_str(),
            args.driver.describe()
        );
        Ok(args)
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!("filterwheel actor stopping");
        if let Err(e) = self.driver.close().await {
            warn!("filterwheel close failed: {}", e);
        }
        Ok(())
    }
}

// ============================================================================
// Kameo Message Types
// ============================================================================

/// Open the connection and query the controller once
pub struct Connect {
    /// Receives progress lines
    pub sink: Arc<dyn CommandSink>,
}

impl Message<Connect> for FilterWheel {
    type Reply = DcbResult<()>;

    async fn handle(&mut self, msg: Connect, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.connect(msg.sink.as_ref()).await
    }
}

/// Close the connection
pub struct Disconnect {
    /// Receives progress lines
    pub sink: Arc<dyn CommandSink>,
}

impl Message<Disconnect> for FilterWheel {
    type Reply = DcbResult<()>;

    async fn handle(
        &mut self,
        msg: Disconnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.disconnect(msg.sink.as_ref()).await
    }
}

/// Calibrate a wheel; it rests on slot 1 afterwards
pub struct Initialize {
    /// Target wheel
    pub wheel: Wheel,
    /// Receives progress lines
    pub sink: Arc<dyn CommandSink>,
}

impl Message<Initialize> for FilterWheel {
    type Reply = DcbResult<WheelStatus>;

    async fn handle(
        &mut self,
        msg: Initialize,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.initialize(msg.wheel, msg.sink.as_ref()).await
    }
}

/// Move a calibrated wheel
pub struct Move {
    /// Target wheel
    pub wheel: Wheel,
    /// Slot or hole label
    pub target: MoveTarget,
    /// Receives progress lines
    pub sink: Arc<dyn CommandSink>,
}

impl Message<Move> for FilterWheel {
    type Reply = DcbResult<WheelStatus>;

    async fn handle(&mut self, msg: Move, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.move_wheel(msg.wheel, msg.target, msg.sink.as_ref()).await
    }
}

/// Zero the ADC offsets
pub struct ZeroAdc {
    /// Receives progress lines
    pub sink: Arc<dyn CommandSink>,
}

impl Message<ZeroAdc> for FilterWheel {
    type Reply = DcbResult<()>;

    async fn handle(&mut self, msg: ZeroAdc, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.zero_adc(msg.sink.as_ref()).await
    }
}

/// Full status, including a live ADC reading
pub struct Status {
    /// Receives progress lines
    pub sink: Arc<dyn CommandSink>,
}

impl Message<Status> for FilterWheel {
    type Reply = DcbResult<FilterWheelStatus>;

    async fn handle(&mut self, msg: Status, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.status(msg.sink.as_ref()).await
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Client side of a running filter-wheel actor.
#[derive(Clone)]
pub struct FilterWheelHandle {
    actor: ActorRef<FilterWheel>,
    state: watch::Receiver<DeviceState>,
    config: FilterWheelConfig,
    store: Arc<dyn KeyValueStore>,
}

impl FilterWheelHandle {
    /// Spawn the actor. The device is not contacted until [`connect`](Self::connect).
    pub fn spawn(
        config: FilterWheelConfig,
        transport: Box<dyn LineTransport>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let actor = FilterWheel::new(config.clone(), transport, Arc::clone(&store));
        let state = actor.state.subscribe();
        Self {
            actor: FilterWheel::spawn(actor),
            state,
            config,
            store,
        }
    }

    /// Open the connection; see [`Connect`].
    pub async fn connect(&self, sink: Arc<dyn CommandSink>) -> DcbResult<()> {
        self.actor
            .ask(Connect { sink })
            .await
            .map_err(|e| reply_error(DeviceKind::FilterWheel, e))
    }

    /// Close the connection.
    pub async fn disconnect(&self, sink: Arc<dyn CommandSink>) -> DcbResult<()> {
        self.actor
            .ask(Disconnect { sink })
            .await
            .map_err(|e| reply_error(DeviceKind::FilterWheel, e))
    }

    /// Calibrate `wheel`; see [`Initialize`].
    pub async fn initialize(&self, wheel: Wheel, sink: Arc<dyn CommandSink>) -> DcbResult<WheelStatus> {
        self.actor
            .ask(Initialize { wheel, sink })
            .await
            .map_err(|e| reply_error(DeviceKind::FilterWheel, e))
    }

    /// Move `wheel` and return its confirmed position.
    pub async fn move_to(
        &self,
        wheel: Wheel,
        target: MoveTarget,
        sink: Arc<dyn CommandSink>,
    ) -> DcbResult<WheelStatus> {
        self.actor
            .ask(Move {
                wheel,
                target,
                sink,
            })
            .await
            .map_err(|e| reply_error(DeviceKind::FilterWheel, e))
    }

    /// Run the ADC zeroing dialogue.
    pub async fn zero_adc(&self, sink: Arc<dyn CommandSink>) -> DcbResult<()> {
        self.actor
            .ask(ZeroAdc { sink })
            .await
            .map_err(|e| reply_error(DeviceKind::FilterWheel, e))
    }

    /// Full status through the mailbox.
    pub async fn status(&self, sink: Arc<dyn CommandSink>) -> DcbResult<FilterWheelStatus> {
        self.actor
            .ask(Status { sink })
            .await
            .map_err(|e| reply_error(DeviceKind::FilterWheel, e))
    }

    /// Current FSM state.
    pub fn state(&self) -> DeviceState {
        self.state.borrow().clone()
    }

    /// FSM state plus persisted wheel positions, without waiting on the mailbox.
    pub async fn snapshot(&self) -> FilterWheelSnapshot {
        FilterWheelSnapshot {
            state: self.state(),
            wheels: reconcile_all(&self.config, self.store.as_ref()).await,
        }
    }

    /// Underlying actor reference.
    pub fn actor_ref(&self) -> &ActorRef<FilterWheel> {
        &self.actor
    }

    /// Stop the actor and wait for it to release the transport.
    pub async fn stop(&self) {
        self.actor.kill();
        self.actor.wait_for_shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_target_parsing() {
        assert_eq!("3".parse::<MoveTarget>().unwrap(), MoveTarget::Slot(3));
        assert_eq!(
            "2.0".parse::<MoveTarget>().unwrap(),
            MoveTarget::Hole("2.0".into())
        );
        assert_eq!(
            "none".parse::<MoveTarget>().unwrap(),
            MoveTarget::Hole("none".into())
        );
    }

    #[test]
    fn test_parse_moved() {
        assert_eq!(parse_moved("Moved to position 4").unwrap(), 4);
        assert_eq!(parse_moved("  Moved to position 2 ").unwrap(), 2);
        assert!(matches!(
            parse_moved("Moved to position ?"),
            Err(DcbError::Parse(_))
        ));
    }

    #[test]
    fn test_only_requested_position_confirms_move() {
        assert!(confirms_position(Wheel::Linewheel, "Moved to position 4", 4));
        assert!(!confirms_position(Wheel::Linewheel, "Moved to position 2", 4));
        assert!(!confirms_position(Wheel::Qthwheel, "Moved to position ?", 4));
    }
}
