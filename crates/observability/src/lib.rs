//! Process-wide tracing/logging setup.

/// Initialize process-wide logging.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Logging for test binaries: human-readable, captured by the test harness.
pub fn init_for_tests() {
    tracing::init_for_tests();
}

pub mod tracing;
