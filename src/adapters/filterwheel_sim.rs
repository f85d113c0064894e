//! Filter-wheel controller simulator
//!
//! In-process stand-in for the filter-wheel TCP controller. Every command
//! queues the transcript the real controller prints for it, and reads hand
//! the transcript back one line at a time after a small latency. It provides:
//! - Calibration, move, ADC and ADC-zeroing dialogues
//! - Fault injection (silence, stalls, dropped lines, empty reads)
//! - Call logging for test verification

use super::LineTransport;
use crate::config::FilterWheelConfig;
use crate::error::{DcbError, DcbResult};
use crate::status::Wheel;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DEFAULT_LATENCY_MS: u64 = 20;
const DEFAULT_ADC_READING: &str = "-.0014";
const SLOTS: i32 = 5;

/// Misbehaviour the simulator can be told to exhibit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimFault {
    /// Commands are accepted but nothing is ever printed back.
    Silent,
    /// Output stops right after the first line containing this text.
    StallAfter(String),
    /// Lines containing this text are never printed.
    DropLine(String),
    /// Every read returns an empty line immediately.
    EmptyLines,
    /// The controller hangs up on the next read.
    HangUp,
}

#[derive(Debug)]
struct SimState {
    connected: bool,
    buffer: VecDeque<String>,
    positions: [i32; 2],
    adc_reading: String,
    fault: Option<SimFault>,
    fail_next_connect: bool,
    call_log: Vec<String>,
    latency: Duration,
}

/// Simulated filter-wheel controller
///
/// Clones share state, so a test can keep a handle to inspect the call log
/// or inject faults while a controller owns the transport.
///
/// # Example
///
/// ```
/// use dcb_actor::adapters::FilterWheelSimulator;
///
/// let sim = FilterWheelSimulator::new(0, 1).with_latency(std::time::Duration::ZERO);
/// assert!(sim.call_log().is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct FilterWheelSimulator {
    state: Arc<Mutex<SimState>>,
    fw_ports: [u8; 2],
}

fn wheel_index(wheel: Wheel) -> usize {
    match wheel {
        Wheel::Linewheel => 0,
        Wheel::Qthwheel => 1,
    }
}

impl FilterWheelSimulator {
    /// Create a simulator whose wheels answer on the given controller ports.
    pub fn new(linewheel_port: u8, qthwheel_port: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                connected: false,
                buffer: VecDeque::new(),
                positions: [1, 1],
                adc_reading: DEFAULT_ADC_READING.to_string(),
                fault: None,
                fail_next_connect: false,
                call_log: Vec::new(),
                latency: Duration::from_millis(DEFAULT_LATENCY_MS),
            })),
            fw_ports: [linewheel_port, qthwheel_port],
        }
    }

    /// Simulator reporting the configured wheel ports.
    pub fn from_config(config: &FilterWheelConfig) -> Self {
        Self::new(config.linewheel.fw_port, config.qthwheel.fw_port)
    }

    /// Set the delay before each line is handed back
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Change the line delay of a running simulator; shared by all clones.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the simulator misbehave until [`clear_fault`](Self::clear_fault).
    pub fn inject_fault(&self, fault: SimFault) {
        self.lock().fault = Some(fault);
    }

    /// Back to normal behaviour.
    pub fn clear_fault(&self) {
        self.lock().fault = None;
    }

    /// Refuse the next connection attempt.
    pub fn fail_next_connect(&self) {
        self.lock().fail_next_connect = true;
    }

    /// Value printed in answer to `adc <n>`.
    pub fn set_adc_reading(&self, reading: &str) {
        self.lock().adc_reading = reading.to_string();
    }

    /// Physical slot the simulated wheel is resting on.
    pub fn position(&self, wheel: Wheel) -> i32 {
        self.lock().positions[wheel_index(wheel)]
    }

    /// Every command sent, in order
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.clone()
    }

    /// Forget the commands sent so far.
    pub fn clear_log(&self) {
        self.lock().call_log.clear();
    }

    /// Whether a client is connected.
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn calibration_transcript(&self, wheel: Wheel) -> Vec<String> {
        let port = self.fw_ports[wheel_index(wheel)];
        vec![
            "port0 = |UL|  port1 = |LL| ".to_string(),
            format!("Calibrating FW {port} "),
            "attached 2 filter wheel(s): ".to_string(),
            "index 0: ID 0 Name EFW ".to_string(),
            "index 1: ID 1 Name EFW ".to_string(),
            format!("selecting {port}"),
            "Calibrating ".to_string(),
            "Done".to_string(),
        ]
    }

    fn move_transcript(&self, wheel: Wheel, current: i32, target: i32) -> Vec<String> {
        let port = self.fw_ports[wheel_index(wheel)];
        let slots = (1..=SLOTS)
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        vec![
            "port0 = UL  port1 = LL".to_string(),
            format!("Setting FW {port} to position {target}"),
            "attached 2 filter wheel(s):".to_string(),
            "index 0: ID 0 Name EFW ".to_string(),
            "index 1: ID 1 Name EFW ".to_string(),
            format!("selecting {port} "),
            format!("{SLOTS} slots: {slots} "),
            format!("current position: {current}"),
            "Moving...".to_string(),
            format!("Moved to position {target}"),
        ]
    }

    /// Build the reply for one command and update the simulated wheels.
    fn respond(&self, state: &mut SimState, command: &str) -> Vec<String> {
        let mut words = command.split_whitespace();
        let verb = words.next().unwrap_or_default();
        let arg = words.next();

        match (verb, arg) {
            ("adc", Some(_)) => vec![state.adc_reading.clone()],
            ("adccalib", None) => vec![
                "Calibrating ADC offsets".to_string(),
                "Disconnect the photodiodes then type continue".to_string(),
            ],
            ("continue", None) => vec![
                "Measuring offsets...".to_string(),
                "Offsets calibrated".to_string(),
            ],
            (name, Some(arg)) => {
                let Ok(wheel) = name.parse::<Wheel>() else {
                    return vec![format!("unknown command: {command}")];
                };
                let Ok(target) = arg.parse::<i32>() else {
                    return vec![format!("invalid position: {arg}")];
                };
                let index = wheel_index(wheel);
                if target == -1 {
                    state.positions[index] = 1;
                    self.calibration_transcript(wheel)
                } else if (1..=SLOTS).contains(&target) {
                    let current = state.positions[index];
                    state.positions[index] = target;
                    self.move_transcript(wheel, current, target)
                } else {
                    vec![format!("invalid position: {target}")]
                }
            }
            _ => vec![format!("unknown command: {command}")],
        }
    }
}

#[async_trait]
impl LineTransport for FilterWheelSimulator {
    async fn connect(&mut self) -> DcbResult<()> {
        let latency = self.lock().latency;
        tokio::time::sleep(latency).await;
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_connect) {
            return Err(DcbError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "simulated connection refusal",
            )));
        }
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

        let mut lines = self.respond(&mut state, command);
        match &state.fault {
            Some(SimFault::Silent) => lines.clear(),
            Some(SimFault::StallAfter(marker)) => {
                if let Some(i) = lines.iter().position(|l| l.contains(marker.as_str())) {
                    lines.truncate(i + 1);
                }
            }
            Some(SimFault::DropLine(marker)) => lines.retain(|l| !l.contains(marker.as_str())),
            _ => {}
        }
        state.buffer.extend(lines);
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> DcbResult<String> {
        let (has_line, fault, latency) = {
            let state = self.lock();
            if !state.connected {
                return Err(DcbError::NotConnected);
            }
            (!state.buffer.is_empty(), state.fault.clone(), state.latency)
        };

        match fault {
            Some(SimFault::EmptyLines) => return Ok(String::new()),
            Some(SimFault::HangUp) => {
                self.lock().connected = false;
                return Err(DcbError::ConnectionClosed);
            }
            _ => {}
        }

        if !has_line {
            tokio::time::sleep(timeout).await;
            return Err(DcbError::ReadTimeout(timeout));
        }

        tokio::time::sleep(latency.min(timeout)).await;
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
        FilterWheelSimulator::is_connected(self)
    }

    fn describe(&self) -> String {
        "filterwheel simulator".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(sim: &mut FilterWheelSimulator) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = sim.read_line(Duration::from_millis(5)).await {
            lines.push(line);
        }
        lines
    }

    fn sim() -> FilterWheelSimulator {
        FilterWheelSimulator::new(0, 1).with_latency(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let mut sim = sim();
        assert!(matches!(
            sim.send_line("adc 1").await,
            Err(DcbError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_calibration_transcript_uses_wheel_port() {
        let mut sim = sim();
        sim.connect().await.unwrap();
        sim.send_line("qthwheel -1").await.unwrap();

        let lines = drain(&mut sim).await;
        assert!(lines[1].contains("Calibrating FW 1"));
        assert!(lines.iter().any(|l| l == "selecting 1"));
        assert_eq!(lines.last().map(String::as_str), Some("Done"));
        assert_eq!(sim.position(Wheel::Qthwheel), 1);
    }

    #[tokio::test]
    async fn test_move_transcript_ends_with_position() {
        let mut sim = sim();
        sim.connect().await.unwrap();
        sim.send_line("linewheel 4").await.unwrap();

        let lines = drain(&mut sim).await;
        assert_eq!(lines.last().map(String::as_str), Some("Moved to position 4"));
        assert!(lines.iter().any(|l| l == "current position: 1"));
        assert_eq!(sim.position(Wheel::Linewheel), 4);
        assert_eq!(sim.call_log(), vec!["linewheel 4".to_string()]);
    }

    #[tokio::test]
    async fn test_drop_line_fault() {
        let mut sim = sim();
        sim.connect().await.unwrap();
        sim.inject_fault(SimFault::DropLine("Done".into()));
        sim.send_line("linewheel -1").await.unwrap();

        let lines = drain(&mut sim).await;
        assert!(lines.iter().any(|l| l.starts_with("Calibrating ")));
        assert!(!lines.iter().any(|l| l.contains("Done")));
    }

    #[tokio::test]
    async fn test_empty_reads_do_not_wait() {
        let mut sim = sim();
        sim.connect().await.unwrap();
        sim.inject_fault(SimFault::EmptyLines);

        let start = std::time::Instant::now();
        let line = sim.read_line(Duration::from_secs(5)).await.unwrap();
        assert!(line.is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_empty_buffer_times_out() {
        let mut sim = sim();
        sim.connect().await.unwrap();
        let result = sim.read_line(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(DcbError::ReadTimeout(_))));
    }

    #[tokio::test]
    async fn test_discard_pending_empties_transcript() {
        let mut sim = sim();
        sim.connect().await.unwrap();
        sim.send_line("linewheel 3").await.unwrap();
        sim.read_line(Duration::from_millis(5)).await.unwrap();

        assert_eq!(sim.discard_pending().await.unwrap(), 9);
        assert!(drain(&mut sim).await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_injection() {
        let mut sim = sim();
        sim.fail_next_connect();
        assert!(sim.connect().await.is_err());
        // Failure should be consumed
        assert!(sim.connect().await.is_ok());
    }
}
