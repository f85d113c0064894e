//! Power distribution unit simulator
//!
//! Answers the two PDU commands the lamp controller uses:
//! `sw o<NN> on|off imme` and `read status o<NN> simple`. A switched outlet
//! reports `pending` for a short settling period before it reports its new
//! state. Outlets can be made stuck to exercise rollback paths.

use super::LineTransport;
use crate::config::SourcesConfig;
use crate::error::{DcbError, DcbResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_LATENCY_MS: u64 = 5;
const DEFAULT_SETTLE_MS: u64 = 100;

#[derive(Debug, Clone)]
struct Outlet {
    on: bool,
    settled_at: Option<Instant>,
    stuck: bool,
}

impl Outlet {
    fn status(&self, now: Instant) -> &'static str {
        match self.settled_at {
            Some(at) if now < at => "pending",
            _ if self.on => "on",
            _ => "off",
        }
    }
}

#[derive(Debug)]
struct PduState {
    connected: bool,
    outlets: BTreeMap<String, Outlet>,
    buffer: VecDeque<String>,
    call_log: Vec<String>,
}

/// Simulated PDU
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct PduSimulator {
    state: Arc<Mutex<PduState>>,
    latency: Duration,
    settle: Duration,
}

impl PduSimulator {
    /// Create a PDU with the given outlets, all off.
    pub fn new<I, S>(outlets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let outlets = outlets
            .into_iter()
            .map(|o| {
                (
                    o.into(),
                    Outlet {
                        on: false,
                        settled_at: None,
                        stuck: false,
                    },
                )
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(PduState {
                connected: false,
                outlets,
                buffer: VecDeque::new(),
                call_log: Vec::new(),
            })),
            latency: Duration::from_millis(DEFAULT_LATENCY_MS),
            settle: Duration::from_millis(DEFAULT_SETTLE_MS),
        }
    }

    /// Simulator with one outlet per configured lamp, all off.
    pub fn from_config(config: &SourcesConfig) -> Self {
        Self::new(config.lamps.values().map(|lamp| lamp.outlet.clone()))
    }

    /// Set the delay before each reply line is handed back
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set how long a switched outlet reports `pending`
    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn lock(&self) -> MutexGuard<'_, PduState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Outlet ignores switch commands from now on.
    pub fn stick_outlet(&self, outlet: &str) {
        if let Some(o) = self.lock().outlets.get_mut(outlet) {
            o.stuck = true;
        }
    }

    /// Undo [`stick_outlet`](Self::stick_outlet).
    pub fn release_outlet(&self, outlet: &str) {
        if let Some(o) = self.lock().outlets.get_mut(outlet) {
            o.stuck = false;
        }
    }

    /// Force an outlet on or off without going through the protocol.
    pub fn set_outlet(&self, outlet: &str, on: bool) {
        if let Some(o) = self.lock().outlets.get_mut(outlet) {
            o.on = on;
            o.settled_at = None;
        }
    }

    /// Electrical state, ignoring any settling period
    pub fn is_on(&self, outlet: &str) -> bool {
        self.lock().outlets.get(outlet).is_some_and(|o| o.on)
    }

    /// Every command sent, in order
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.clone()
    }

    /// Forget the commands sent so far.
    pub fn clear_log(&self) {
        self.lock().call_log.clear();
    }

    fn respond(&self, state: &mut PduState, command: &str) -> String {
        let words: Vec<&str> = command.split_whitespace().collect();
        let now = Instant::now();

        match words.as_slice() {
            ["sw", outlet, action, "imme"] => {
                let Some(id) = outlet.strip_prefix('o') else {
                    return format!("Invalid outlet: {outlet}");
                };
                let on = match *action {
                    "on" => true,
                    "off" => false,
                    other => return format!("Invalid action: {other}"),
                };
                let Some(o) = state.outlets.get_mut(id) else {
                    return format!("Invalid outlet: {outlet}");
                };
                if !o.stuck {
                    o.on = on;
                    o.settled_at = Some(now + self.settle);
                }
                format!("Outlet {id} {action}")
            }
            ["read", "status", outlet, "simple"] => {
                let Some(id) = outlet.strip_prefix('o') else {
                    return format!("Invalid outlet: {outlet}");
                };
                match state.outlets.get(id) {
                    Some(o) => o.status(now).to_string(),
                    None => format!("Invalid outlet: {outlet}"),
                }
            }
            _ => format!("Invalid command: {command}"),
        }
    }
}

#[async_trait]
impl LineTransport for PduSimulator {
    async fn connect(&mut self) -> DcbResult<()> {
        tokio::time::sleep(self.latency).await;
        let mut state = self.lock();
        state.connected = true;
        state.buffer.clear();
        Ok(())
    }

    async fn send_line(&mut self, command: &str) -> DcbResult<()> {
        let mut state = self.lock();
        if !state.connected {
            return Err(DcbError::NotConnected);
        }
        state.call_log.push(command.to_string());
        let reply = self.respond(&mut state, command);
        state.buffer.push_back(reply);
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> DcbResult<String> {
        let has_line = {
            let state = self.lock();
            if !state.connected {
                return Err(DcbError::NotConnected);
            }
            !state.buffer.is_empty()
        };

        if !has_line {
            tokio::time::sleep(timeout).await;
            return Err(DcbError::ReadTimeout(timeout));
        }

        tokio::time::sleep(self.latency.min(timeout)).await;
        self.lock()
            .buffer
            .pop_front()
            .ok_or(DcbError::ReadTimeout(timeout))
    }

    async fn discard_pending(&mut self) -> DcbResult<usize> {
        let mut state = self.lock();
        let stale = state.buffer.len();
        state.buffer.clear();
        Ok(stale)
    }

    async fn close(&mut self) -> DcbResult<()> {
        let mut state = self.lock();
        state.connected = false;
        state.buffer.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn describe(&self) -> String {
        "pdu simulator".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(pdu: &mut PduSimulator, command: &str) -> String {
        pdu.send_line(command).await.unwrap();
        pdu.read_line(Duration::from_millis(100)).await.unwrap()
    }

    #[tokio::test]
    async fn test_outlet_settles_after_pending() {
        let mut pdu = PduSimulator::new(["01", "02"])
            .with_latency(Duration::ZERO)
            .with_settle_time(Duration::from_millis(30));
        pdu.connect().await.unwrap();

        assert_eq!(exchange(&mut pdu, "read status o01 simple").await, "off");
        assert_eq!(exchange(&mut pdu, "sw o01 on imme").await, "Outlet 01 on");
        assert_eq!(exchange(&mut pdu, "read status o01 simple").await, "pending");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(exchange(&mut pdu, "read status o01 simple").await, "on");
        assert!(pdu.is_on("01"));
        assert!(!pdu.is_on("02"));
    }

    #[tokio::test]
    async fn test_unread_reply_is_discarded() {
        let mut pdu = PduSimulator::new(["01"])
            .with_latency(Duration::ZERO)
            .with_settle_time(Duration::ZERO);
        pdu.connect().await.unwrap();

        pdu.send_line("sw o01 on imme").await.unwrap();
        assert_eq!(pdu.discard_pending().await.unwrap(), 1);
        assert_eq!(pdu.discard_pending().await.unwrap(), 0);
        assert_eq!(exchange(&mut pdu, "read status o01 simple").await, "on");
    }

    #[tokio::test]
    async fn test_stuck_outlet_never_changes() {
        let mut pdu = PduSimulator::new(["03"])
            .with_latency(Duration::ZERO)
            .with_settle_time(Duration::ZERO);
        pdu.connect().await.unwrap();
        pdu.stick_outlet("03");

        exchange(&mut pdu, "sw o03 on imme").await;
        assert_eq!(exchange(&mut pdu, "read status o03 simple").await, "off");
        assert_eq!(pdu.call_log().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_outlet() {
        let mut pdu = PduSimulator::new(["01"]).with_latency(Duration::ZERO);
        pdu.connect().await.unwrap();
        assert!(exchange(&mut pdu, "sw o09 on imme")
            .await
            .starts_with("Invalid outlet"));
    }
}
