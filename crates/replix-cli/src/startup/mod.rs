//! Startup utilities for the replix binary.

mod logging;

pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
