//! Tracing subscriber initialization.
//!
//! Filtering comes from `RUST_LOG` (default `info`). Output is JSON unless
//! `LOCKSTEP_LOG_FORMAT=pretty`.

use tracing_subscriber::EnvFilter;

/// Output format of the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// Read `LOCKSTEP_LOG_FORMAT`; anything but `pretty` means JSON.
    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOCKSTEP_LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing for the process. Safe to call multiple times.
pub fn init() {
    init_with(LogFormat::from_env());
}

pub fn init_with(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_thread_names(true)
        .with_target(false);

    let _ = match format {
        LogFormat::Json => builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

/// Compact output through the test writer so `cargo test` captures it.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_test_writer()
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pretty_switches_format() {
        assert_eq!(LogFormat::parse(Some("pretty")), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(Some(" PRETTY ")), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::parse(None), LogFormat::Json);
    }

    #[test]
    fn init_is_idempotent() {
        init_for_tests();
        init_for_tests();
        init();
    }
}
