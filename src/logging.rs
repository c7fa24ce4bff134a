use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable output (interactive use).
    Human,
    /// Structured JSON output (daemon mode).
    Json,
}

/// Initialize the global tracing subscriber.
///
/// Call once at startup. `RUST_LOG` wins when set; otherwise the
/// configured level applies to nimbus crates with warnings from
/// dependencies.
pub fn init(format: LogFormat, level: &str) {
    let directive = format!("nimbus={},warn", level);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    match format {
        LogFormat::Human => {
            let layer = fmt::layer().with_target(false).compact();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .init();
        }
        LogFormat::Json => {
            let layer = fmt::layer().json().with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_equality() {
        assert_eq!(LogFormat::Human, LogFormat::Human);
        assert_ne!(LogFormat::Human, LogFormat::Json);
    }
}
