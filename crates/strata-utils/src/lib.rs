//! # Strata Utilities
//!
//! Shared utilities for the Strata workspace.
//!
//! The core library only emits `tracing` events. This crate installs the
//! subscriber that turns them into console or file output, for binaries and
//! for integration tests that want to see acquisition decisions.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{init_logging, init_logging_with_level, LogFormat, LogLevel, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
