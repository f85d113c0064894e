//! Line transports
//!
//! Every device speaks an ASCII line protocol: commands go out terminated
//! with CRLF, replies come back LF-terminated. [`LineTransport`] is the one
//! capability both the real TCP connection and the in-process simulators
//! implement, so controllers never know which one they hold.

use crate::config::{FilterWheelConfig, Mode, SourcesConfig};
use crate::error::DcbResult;
use async_trait::async_trait;
use std::time::Duration;

pub mod filterwheel_sim;
pub mod pdu_sim;
pub mod tcp_adapter;

pub use filterwheel_sim::{FilterWheelSimulator, SimFault};
pub use pdu_sim::PduSimulator;
pub use tcp_adapter::TcpTransport;

/// Terminator appended to every command.
pub const COMMAND_EOL: &str = "\r\n";

/// Duplex line-oriented connection to a device.
#[async_trait]
pub trait LineTransport: Send + Sync {
    /// Establish the stream. Reconnecting an open transport replaces it.
    async fn connect(&mut self) -> DcbResult<()>;

    /// Write one command followed by [`COMMAND_EOL`].
    async fn send_line(&mut self, command: &str) -> DcbResult<()>;

    /// Wait up to `timeout` for one complete line, delimiter stripped.
    ///
    /// An empty window yields [`DcbError::ReadTimeout`](crate::error::DcbError::ReadTimeout),
    /// which is routine and distinct from a closed connection.
    async fn read_line(&mut self, timeout: Duration) -> DcbResult<String>;

    /// Throw away input that has already arrived, without waiting for more.
    ///
    /// Returns the number of complete lines discarded. Used before a new
    /// command so that late output of an earlier exchange cannot be taken
    /// for its reply.
    async fn discard_pending(&mut self) -> DcbResult<usize>;

    /// Release the stream. Closing twice is fine.
    async fn close(&mut self) -> DcbResult<()>;

    /// Whether the stream is open.
    fn is_connected(&self) -> bool;

    /// Human readable endpoint, for logs.
    fn describe(&self) -> String;
}

/// Transport for the filter-wheel controller, chosen by configured mode.
pub fn filterwheel_transport(config: &FilterWheelConfig) -> Box<dyn LineTransport> {
    match config.mode {
        Mode::Operation => Box::new(
            TcpTransport::new(config.host.clone(), config.port)
                .with_connect_timeout(config.connect_timeout()),
        ),
        Mode::Simulation => Box::new(FilterWheelSimulator::from_config(config)),
    }
}

/// Transport for the PDU driving the lamps, chosen by configured mode.
pub fn pdu_transport(config: &SourcesConfig) -> Box<dyn LineTransport> {
    match config.mode {
        Mode::Operation => Box::new(
            TcpTransport::new(config.host.clone(), config.port)
                .with_connect_timeout(config.connect_timeout()),
        ),
        Mode::Simulation => Box::new(PduSimulator::from_config(config)),
    }
}
