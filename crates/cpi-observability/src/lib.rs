//! Logging for the Docker CPI
//!
//! The CPI speaks its protocol over stdout, so every console layer built here
//! writes to stderr. File output is optional and rotated by
//! `tracing-appender`.
//!
//! ```no_run
//! use cpi_observability::{init_logging, LoggingConfig};
//!
//! let _guard = init_logging(&LoggingConfig::default()).expect("logging");
//! tracing::info!("cpi started");
//! ```

pub mod config;
pub mod error;
pub mod logging;

pub use config::*;
pub use error::{ObservabilityError, Result};
pub use logging::{init_logging, LogGuard};
