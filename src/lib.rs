//! Distributed calibration box (DCB) actor.
//!
//! Drives the calibration hardware of a spectrograph test bench:
//!
//! - a filter-wheel controller (two wheels plus a photodiode ADC) speaking
//!   an ASCII line protocol over TCP
//! - a power distribution unit switching the calibration lamps
//! - declared collimator masks and fiber bundles, persisted only
//!
//! Each device is owned by a kameo actor with its own state machine. The
//! line protocol layer is shared: [`adapters`] provides TCP and simulated
//! transports, [`hardware::LineDriver`] runs the bounded read loops.

pub mod actors;
pub mod adapters;
pub mod collimators;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fsm;
pub mod hardware;
pub mod monitor;
pub mod sink;
pub mod status;
pub mod store;

pub use error::{DcbError, DcbResult};
