//! Telemetry: logging setup and data-plane rate metering.

mod logging;
mod meter;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use meter::{Gauge, RateMeter};
