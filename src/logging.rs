//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence; otherwise the filter is derived from the
//! `-v` verbosity flag. Logs go to stderr so fatal startup errors land on the
//! process's error stream.

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Filter directive for a verbosity level.
pub fn filter_directive(verbosity: i32) -> &'static str {
    match verbosity {
        i32::MIN..=0 => "warn,sqlcluster=info",
        1 => "info",
        2 => "info,sqlcluster=debug,tower_http=info",
        3 => "info,sqlcluster=debug,tower_http=debug",
        _ => "debug,sqlcluster=trace",
    }
}

/// Install the global subscriber.
pub fn init(verbosity: i32, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(verbosity)));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_verbosity_hides_debug() {
        assert_eq!(filter_directive(0), "warn,sqlcluster=info");
        assert_eq!(filter_directive(-5), "warn,sqlcluster=info");
    }

    #[test]
    fn test_default_verbosity_enables_node_debug() {
        assert!(filter_directive(3).contains("sqlcluster=debug"));
        assert!(filter_directive(10).contains("sqlcluster=trace"));
    }

    #[test]
    fn test_directives_parse() {
        for v in -1..=5 {
            assert!(EnvFilter::try_new(filter_directive(v)).is_ok());
        }
    }
}
