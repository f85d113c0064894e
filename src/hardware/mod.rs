//! Device protocol drivers.

pub mod line_driver;

pub use line_driver::{Limits, LineDriver};
