//! Error types for the DCB actor.
//!
//! `DcbError` is the single error type shared by the transports, the line
//! protocol driver, the device controllers and the persistence layer. The
//! variants follow how a caller is expected to react:
//!
//! - **`Precondition`**: the request was rejected before any device I/O
//!   (unknown lamp, uninitialized wheel, slot out of range). Nothing changed.
//! - **`ReadTimeout`**: one read window elapsed without a complete line. The
//!   line driver absorbs these; they only escape from direct transport use.
//! - **`Timeout`**: the total time budget of a protocol exchange ran out.
//!   Retrying may help.
//! - **`BrokenTransport`**: the iteration cap was hit without the expected
//!   marker. The device is considered faulted until it is reconnected.
//! - **`CalibrationFailed`**: the final phase of a wheel calibration timed
//!   out while the device was still calibrating. Inspect the hardware.
//! - **`UserAborted`**: a warm-up or illumination dwell was cancelled.
//! - **`LampSwitch`**: a lamp batch did not reach the requested state; the
//!   rollback outcome is carried along.
//! - **`Persistence`**: the state file could not be read or written. The
//!   device itself is fine, so this only soft-fails the operation.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the DCB error type.
pub type DcbResult<T> = std::result::Result<T, DcbError>;

/// Every failure a controller, transport or store can report.
#[derive(Error, Debug)]
pub enum DcbError {
    /// Request rejected before any device I/O
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// One read window passed without a complete line
    #[error("No line received within {0:?}")]
    ReadTimeout(Duration),

    /// Total budget of an exchange ran out before the marker appeared
    #[error("Timed out after {elapsed:?} waiting for '{marker}' (limit {limit:?})")]
    Timeout {
        /// Marker that was being waited for
        marker: String,
        /// Time spent in the exchange
        elapsed: Duration,
        /// Configured budget
        limit: Duration,
    },

    /// Iteration cap hit without the marker
    #[error("Broken transport: '{marker}' not seen after {iterations} reads")]
    BrokenTransport {
        /// Marker that was being waited for
        marker: String,
        /// Reads performed
        iterations: u32,
    },

    /// Peer closed the connection
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Transport used before it was opened
    #[error("Not connected")]
    NotConnected,

    /// Final calibration phase timed out
    #[error("Calibration of {wheel} failed: {reason}")]
    CalibrationFailed {
        /// Wheel name
        wheel: String,
        /// Underlying timeout
        reason: String,
    },

    /// Warm-up or dwell cancelled; the payload names what was cancelled
    #[error("{0} aborted by user")]
    UserAborted(String),

    /// A lamp batch did not reach the requested state
    #[error("Lamp {lamp} did not switch {desired}; lamps switched back off: {rolled_back}")]
    LampSwitch {
        /// First lamp found in the wrong state
        lamp: String,
        /// Requested state, `on` or `off`
        desired: String,
        /// Whether the batch was switched back off
        rolled_back: bool,
    },

    /// Operation not allowed in the current lifecycle state
    #[error("{device} is {state}, cannot {operation}")]
    InvalidTransition {
        /// Device name
        device: String,
        /// Current state, as reported in status
        state: String,
        /// Rejected operation
        operation: String,
    },

    /// Device carries a hard fault and refuses commands
    #[error("{device} has a hard fault ({reason}); reconnect before issuing commands")]
    DeviceFailed {
        /// Device name
        device: String,
        /// Error that caused the fault
        reason: String,
    },

    /// Persisted key was never written
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Device reply did not have the expected shape
    #[error("Unexpected device reply: {0}")]
    Parse(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Actor mailbox is gone
    #[error("Controller {0} is not running")]
    ActorUnavailable(String),

    /// Reading or writing the persisted state failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed persisted state
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DcbError {
    /// Errors after which the transport must be reopened before further use.
    pub fn is_hard_fault(&self) -> bool {
        matches!(
            self,
            DcbError::BrokenTransport { .. } | DcbError::ConnectionClosed | DcbError::Io(_)
        )
    }

    /// Shorthand for building a [`DcbError::Precondition`].
    pub fn precondition(msg: impl Into<String>) -> Self {
        DcbError::Precondition(msg.into())
    }
}
