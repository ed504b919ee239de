//! Shared helpers for unit and conformance tests.
//!
//! - Consistent tracing-based logging initialization
//! - Runtime constructors
//!
//! # Example
//! ```ignore
//! use coopsync::test_utils::test_runtime;
//!
//! let mut rt = test_runtime();
//! rt.block_on(async { /* test body */ });
//! ```

use std::sync::Once;

use crate::runtime::Runtime;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Create a fresh runtime with test logging initialized.
#[must_use]
pub fn test_runtime() -> Runtime {
    init_test_logging();
    Runtime::new()
}
