//! Blocking protocol driver
//!
//! Devices answer a command with a free-form transcript and signal the end
//! of a phase by printing a known marker somewhere in a line. [`LineDriver`]
//! sends a command and consumes lines until the marker shows up, bounded by
//! three independent limits:
//!
//! - a per-read window, after which an empty read simply counts as one
//!   iteration
//! - a total wall-clock budget measured from the start of the exchange,
//!   exhausted as [`DcbError::Timeout`]
//! - an iteration cap, exhausted as [`DcbError::BrokenTransport`], which
//!   catches transports that return empty reads forever without blocking

use crate::adapters::LineTransport;
use crate::error::{DcbError, DcbResult};
use crate::sink::CommandSink;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bounds for one protocol exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Longest single wait for one line.
    pub read_timeout: Duration,
    /// Budget for the whole exchange, from the first read.
    pub total: Duration,
    /// Reads allowed before the transport is declared broken.
    pub max_iterations: u32,
}

impl Limits {
    /// Bundle the three bounds of an exchange.
    pub fn new(read_timeout: Duration, total: Duration, max_iterations: u32) -> Self {
        Self {
            read_timeout,
            total,
            max_iterations,
        }
    }
}

/// Drives multi-line exchanges over a [`LineTransport`].
pub struct LineDriver {
    transport: Box<dyn LineTransport>,
}

impl LineDriver {
    /// Wrap a transport; nothing is opened until [`LineDriver::connect`].
    pub fn new(transport: Box<dyn LineTransport>) -> Self {
        Self { transport }
    }

    /// Open the underlying transport.
    pub async fn connect(&mut self) -> DcbResult<()> {
        self.transport.connect().await
    }

    /// Close the underlying transport.
    pub async fn close(&mut self) -> DcbResult<()> {
        self.transport.close().await
    }

    /// Whether the transport is open.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Peer description, for logs.
    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Send `command`, then wait for a line containing `marker`.
    ///
    /// Every non-empty line read along the way is reported to `sink`. The
    /// matching line is returned.
    pub async fn run_until(
        &mut self,
        command: &str,
        marker: &str,
        limits: Limits,
        sink: &dyn CommandSink,
    ) -> DcbResult<String> {
        self.run_until_accepted(command, marker, limits, sink, |_| true)
            .await
    }

    /// Like [`LineDriver::run_until`], but a line containing `marker` only
    /// ends the exchange when `accept` also holds for it.
    ///
    /// Marker lines that `accept` rejects are reported to `sink` and skipped.
    pub async fn run_until_accepted<F>(
        &mut self,
        command: &str,
        marker: &str,
        limits: Limits,
        sink: &dyn CommandSink,
        accept: F,
    ) -> DcbResult<String>
    where
        F: Fn(&str) -> bool,
    {
        self.discard_stale().await?;
        self.transport.send_line(command).await?;
        self.read_matching(marker, limits, Some(sink), |line| {
            line.contains(marker) && accept(line)
        })
        .await
    }

    /// Wait for a line containing `marker` without sending anything first.
    ///
    /// Used to chain phases of one dialogue.
    pub async fn read_until(
        &mut self,
        marker: &str,
        limits: Limits,
        sink: &dyn CommandSink,
    ) -> DcbResult<String> {
        self.read_matching(marker, limits, Some(sink), |line| line.contains(marker))
            .await
    }

    /// Send `command` and return the first non-empty line of the reply.
    pub async fn query(&mut self, command: &str, limits: Limits) -> DcbResult<String> {
        self.discard_stale().await?;
        self.transport.send_line(command).await?;
        let line = self
            .read_matching(&format!("reply to '{command}'"), limits, None, |_| true)
            .await?;
        Ok(line.trim().to_string())
    }

    /// Drop output left over from an earlier exchange that ended early.
    async fn discard_stale(&mut self) -> DcbResult<()> {
        let stale = self.transport.discard_pending().await?;
        if stale > 0 {
            warn!(
                "{}: discarded {} stale line(s) before sending",
                self.transport.describe(),
                stale
            );
        }
        Ok(())
    }

    async fn read_matching<F>(
        &mut self,
        marker: &str,
        limits: Limits,
        sink: Option<&dyn CommandSink>,
        accept: F,
    ) -> DcbResult<String>
    where
        F: Fn(&str) -> bool,
    {
        let start = Instant::now();
        let mut iterations = 0u32;

        loop {
            let elapsed = start.elapsed();
            if elapsed >= limits.total {
                return Err(DcbError::Timeout {
                    marker: marker.to_string(),
                    elapsed,
                    limit: limits.total,
                });
            }
            if iterations >= limits.max_iterations {
                return Err(DcbError::BrokenTransport {
                    marker: marker.to_string(),
                    iterations,
                });
            }

            let window = limits.read_timeout.min(limits.total - elapsed);
            iterations += 1;

            let line = match self.transport.read_line(window).await {
                Ok(line) => line,
                Err(DcbError::ReadTimeout(_)) => continue,
                Err(e) => return Err(e),
            };
            if line.trim().is_empty() {
                // Give other tasks a chance when the transport never blocks.
                tokio::task::yield_now().await;
                continue;
            }

            debug!("{}: {}", self.transport.describe(), line);
            if let Some(sink) = sink {
                sink.text(&line);
            }
            if accept(&line) {
                return Ok(line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FilterWheelSimulator, SimFault};
    use crate::sink::{drain, ChannelSink, TracingSink};

    fn limits() -> Limits {
        Limits::new(Duration::from_millis(50), Duration::from_secs(2), 100)
    }

    async fn driver(sim: &FilterWheelSimulator) -> LineDriver {
        let mut driver = LineDriver::new(Box::new(sim.clone()));
        driver.connect().await.unwrap();
        driver
    }

    #[tokio::test]
    async fn test_run_until_returns_marker_line() {
        let sim = FilterWheelSimulator::new(0, 1).with_latency(Duration::from_millis(1));
        let mut driver = driver(&sim).await;
        let (sink, mut rx) = ChannelSink::new();

        let line = driver
            .run_until("linewheel 3", "Moved to position", limits(), &sink)
            .await
            .unwrap();
        assert_eq!(line, "Moved to position 3");

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 10);
        assert!(replies.iter().all(|r| r.text.starts_with("text=")));
    }

    #[tokio::test]
    async fn test_chained_phases_observe_markers_in_order() {
        let sim = FilterWheelSimulator::new(0, 1).with_latency(Duration::ZERO);
        let mut driver = driver(&sim).await;

        let first = driver
            .run_until("linewheel -1", "Calibrating FW 0", limits(), &TracingSink)
            .await
            .unwrap();
        assert!(first.contains("Calibrating FW 0"));
        let second = driver
            .read_until("Calibrating", limits(), &TracingSink)
            .await
            .unwrap();
        assert_eq!(second.trim(), "Calibrating");
        let third = driver
            .read_until("Done", limits(), &TracingSink)
            .await
            .unwrap();
        assert_eq!(third, "Done");
    }

    #[tokio::test]
    async fn test_empty_reads_exhaust_iterations() {
        let sim = FilterWheelSimulator::new(0, 1).with_latency(Duration::ZERO);
        let mut driver = driver(&sim).await;
        sim.inject_fault(SimFault::EmptyLines);

        let limits = Limits::new(Duration::from_millis(50), Duration::from_secs(60), 25);
        let result = driver
            .run_until("linewheel 2", "Moved to position", limits, &TracingSink)
            .await;
        match result {
            Err(DcbError::BrokenTransport { iterations, .. }) => assert_eq!(iterations, 25),
            other => panic!("expected broken transport, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_silence_exhausts_total_time() {
        let sim = FilterWheelSimulator::new(0, 1).with_latency(Duration::ZERO);
        let mut driver = driver(&sim).await;
        sim.inject_fault(SimFault::Silent);

        let limits = Limits::new(Duration::from_millis(100), Duration::from_millis(250), 1000);
        let start = Instant::now();
        let result = driver
            .run_until("linewheel 2", "Moved to position", limits, &TracingSink)
            .await;
        assert!(matches!(result, Err(DcbError::Timeout { .. })));
        // The last window is clipped to what remains of the budget.
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_hang_up_is_not_a_timeout() {
        let sim = FilterWheelSimulator::new(0, 1).with_latency(Duration::ZERO);
        let mut driver = driver(&sim).await;
        sim.inject_fault(SimFault::HangUp);

        let result = driver
            .run_until("adc 1", "-.", limits(), &TracingSink)
            .await;
        assert!(matches!(result, Err(DcbError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_leftover_transcript_is_not_taken_as_reply() {
        let sim = FilterWheelSimulator::new(0, 1).with_latency(Duration::ZERO);
        sim.set_adc_reading("-.0014");
        let mut driver = driver(&sim).await;

        // Stops after the first few lines of the move transcript.
        driver
            .run_until("linewheel 2", "Setting FW", limits(), &TracingSink)
            .await
            .unwrap();
        assert_eq!(driver.query("adc 1", limits()).await.unwrap(), "-.0014");
    }

    #[tokio::test]
    async fn test_rejected_marker_line_does_not_end_exchange() {
        let sim = FilterWheelSimulator::new(0, 1).with_latency(Duration::ZERO);
        let mut driver = driver(&sim).await;
        let (sink, mut rx) = ChannelSink::new();

        let limits = Limits::new(Duration::from_millis(20), Duration::from_millis(200), 100);
        let result = driver
            .run_until_accepted("linewheel 3", "Moved to position", limits, &sink, |line| {
                line.ends_with(" 5")
            })
            .await;
        assert!(matches!(result, Err(DcbError::Timeout { .. })));
        let replies = drain(&mut rx);
        assert!(replies.iter().any(|r| r.text.contains("Moved to position 3")));
    }

    #[tokio::test]
    async fn test_query_returns_first_line() {
        let sim = FilterWheelSimulator::new(0, 1).with_latency(Duration::ZERO);
        sim.set_adc_reading("0.2513");
        let mut driver = driver(&sim).await;

        assert_eq!(driver.query("adc 2", limits()).await.unwrap(), "0.2513");
        assert_eq!(sim.call_log(), vec!["adc 2".to_string()]);
    }
}
