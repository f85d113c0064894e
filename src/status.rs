//! Logical state reconciliation.
//!
//! Status answers are built from what was last persisted, mapped through the
//! configured wheel tables, rather than from a fresh device poll. Anything
//! that cannot be resolved degrades to `-1,unknown` instead of failing the
//! status request.

use crate::error::{DcbError, DcbResult};
use crate::store::KeyValueStore;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Position reported for a wheel that was never calibrated.
pub const UNKNOWN_POSITION: i32 = -1;
/// Hole label reported when the position cannot be resolved.
pub const UNKNOWN_HOLE: &str = "unknown";
/// Slot a wheel rests on after calibration.
pub const HOME_POSITION: i32 = 1;

/// The two wheels carried by the filter-wheel controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Wheel {
    /// Arc-line filter wheel
    Linewheel,
    /// Quartz-halogen filter wheel
    Qthwheel,
}

impl Wheel {
    /// Both wheels, in initialization order.
    pub const ALL: [Wheel; 2] = [Wheel::Linewheel, Wheel::Qthwheel];

    /// Wire name, also used as the persistence key and status keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            Wheel::Linewheel => "linewheel",
            Wheel::Qthwheel => "qthwheel",
        }
    }
}

impl fmt::Display for Wheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Wheel {
    type Err = DcbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linewheel" => Ok(Wheel::Linewheel),
            "qthwheel" => Ok(Wheel::Qthwheel),
            other => Err(DcbError::precondition(format!("unknown wheel: {other}"))),
        }
    }
}

/// Ordered slot → hole label table for one wheel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelTable {
    holes: Vec<String>,
}

impl WheelTable {
    /// Table from hole labels, slot 1 first.
    pub fn new(holes: Vec<String>) -> Self {
        Self { holes }
    }

    /// Number of slots.
    pub fn slots(&self) -> i32 {
        i32::try_from(self.holes.len()).unwrap_or(i32::MAX)
    }

    /// Hole label for a 1-based slot.
    pub fn hole(&self, position: i32) -> Option<&str> {
        let index = usize::try_from(position).ok()?.checked_sub(1)?;
        self.holes.get(index).map(String::as_str)
    }

    /// Slot carrying the given hole label.
    pub fn position_of(&self, hole: &str) -> Option<i32> {
        self.holes
            .iter()
            .position(|h| h == hole)
            .and_then(|i| i32::try_from(i + 1).ok())
    }

    /// Whether `position` is a valid slot.
    pub fn contains(&self, position: i32) -> bool {
        self.hole(position).is_some()
    }

    /// Hole labels, slot 1 first.
    pub fn holes(&self) -> &[String] {
        &self.holes
    }
}

/// Reconciled wheel position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelStatus {
    /// Which wheel
    pub wheel: Wheel,
    /// 1-based slot, or -1 before calibration
    pub position: i32,
    /// Hole label of the slot
    pub hole: String,
}

impl WheelStatus {
    /// Status of a wheel that was never calibrated.
    pub fn unknown(wheel: Wheel) -> Self {
        Self {
            wheel,
            position: UNKNOWN_POSITION,
            hole: UNKNOWN_HOLE.to_string(),
        }
    }

    /// Whether the wheel has been calibrated.
    pub fn is_initialized(&self) -> bool {
        self.position != UNKNOWN_POSITION
    }

    /// `<wheel>=<position>,<hole>`
    pub fn keyword(&self) -> String {
        format!("{}={},{}", self.wheel, self.position, self.hole)
    }
}

/// Map a persisted wheel record through its table.
///
/// A missing record, a non-integer value or a position the table does not
/// know all yield [`WheelStatus::unknown`].
pub fn reconcile_wheel(wheel: Wheel, persisted: Option<&[Value]>, table: &WheelTable) -> WheelStatus {
    let position = persisted
        .and_then(|values| values.first())
        .and_then(Value::as_i64)
        .and_then(|p| i32::try_from(p).ok());

    match position.and_then(|p| table.hole(p).map(|hole| (p, hole))) {
        Some((position, hole)) => WheelStatus {
            wheel,
            position,
            hole: hole.to_string(),
        },
        None => WheelStatus::unknown(wheel),
    }
}

/// Read the persisted wheel record and reconcile it.
pub async fn load_wheel_status(
    store: &dyn KeyValueStore,
    wheel: Wheel,
    table: &WheelTable,
) -> WheelStatus {
    match store.load_key(wheel.as_str()).await {
        Ok(values) => reconcile_wheel(wheel, Some(&values), table),
        Err(DcbError::NotFound(_)) => WheelStatus::unknown(wheel),
        Err(e) => {
            tracing::warn!("could not load {wheel} position: {e}");
            WheelStatus::unknown(wheel)
        }
    }
}

/// Persist a confirmed wheel position.
pub async fn persist_wheel_position(
    store: &dyn KeyValueStore,
    wheel: Wheel,
    position: i32,
) -> DcbResult<()> {
    store
        .persist_key(wheel.as_str(), vec![Value::from(position)])
        .await
}

/// Electrical state of a lamp outlet as last reported by the PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LampPower {
    /// Outlet powered
    On,
    /// Outlet unpowered
    Off,
    /// Not polled yet
    Unknown,
}

impl LampPower {
    /// Keyword spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            LampPower::On => "on",
            LampPower::Off => "off",
            LampPower::Unknown => "unknown",
        }
    }

    /// Parse a PDU `read status ... simple` reply.
    pub fn parse(reply: &str) -> Option<Self> {
        match reply.trim().to_ascii_lowercase().as_str() {
            "on" => Some(LampPower::On),
            "off" => Some(LampPower::Off),
            _ => None,
        }
    }
}

impl fmt::Display for LampPower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory record for one lamp.
///
/// The on-timestamp is never persisted: after a restart a lamp that is
/// still on reports zero elapsed seconds.
#[derive(Debug, Clone, Copy)]
pub struct LampRecord {
    /// Last known outlet state
    pub power: LampPower,
    /// When the lamp was switched on by this process
    pub on_since: Option<Instant>,
}

impl Default for LampRecord {
    fn default() -> Self {
        Self {
            power: LampPower::Unknown,
            on_since: None,
        }
    }
}

impl LampRecord {
    /// Record of a lamp switched on at `now`.
    pub fn switched_on(now: Instant) -> Self {
        Self {
            power: LampPower::On,
            on_since: Some(now),
        }
    }

    /// Record of a lamp switched off.
    pub fn switched_off() -> Self {
        Self {
            power: LampPower::Off,
            on_since: None,
        }
    }

    /// Update from a polled outlet state, keeping the timestamp while on.
    pub fn observe(&mut self, power: LampPower) {
        if power != LampPower::On {
            self.on_since = None;
        }
        self.power = power;
    }

    /// Whether the outlet is powered.
    pub fn is_on(&self) -> bool {
        self.power == LampPower::On
    }

    /// Time on since the switch, zero when off or unknown.
    pub fn elapsed(&self, now: Instant) -> Duration {
        match (self.power, self.on_since) {
            (LampPower::On, Some(since)) => now.saturating_duration_since(since),
            _ => Duration::ZERO,
        }
    }
}

/// Reconciled lamp state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LampStatus {
    /// Lamp name
    pub name: String,
    /// Last known outlet state
    pub power: LampPower,
    /// Whole seconds on, rounded
    pub elapsed_secs: u64,
}

impl LampStatus {
    /// Status of `name` as of `now`.
    pub fn from_record(name: &str, record: &LampRecord, now: Instant) -> Self {
        let elapsed = record.elapsed(now);
        // Round to the nearest second.
        let elapsed_secs = (elapsed + Duration::from_millis(500)).as_secs();
        Self {
            name: name.to_string(),
            power: record.power,
            elapsed_secs,
        }
    }

    /// `<lamp>=<on|off>,<elapsedSeconds>`
    pub fn keyword(&self) -> String {
        format!("{}={},{}", self.name, self.power, self.elapsed_secs)
    }
}
