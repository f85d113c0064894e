//! DCB Configuration System
//!
//! Configuration is loaded with Figment from (in order of precedence):
//! 1. Environment variables prefixed with `DCB_`
//! 2. TOML configuration file (default: `config/dcb.toml`)
//!
//! # Example
//!
//! ```no_run
//! use dcb_actor::config::DcbConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DcbConfig::load_from("config/dcb.toml")?;
//!
//!     println!("Actor name: {}", config.application.name);
//!     println!("Filter wheel host: {}", config.filterwheel.host);
//!     println!("Lamps: {}", config.sources.lamps.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Environment Variables
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! DCB_APPLICATION__LOG_LEVEL=debug
//! DCB_FILTERWHEEL__MODE=operation
//! DCB_SOURCES__HOST=pdu-dcb
//! ```

pub mod dcb_config;

pub use dcb_config::{
    ApplicationConfig, CollimatorConfig, ConfigError, DcbConfig, FilterWheelConfig, LampConfig,
    Mode, PersistenceConfig, SourcesConfig, WheelConfig,
};
