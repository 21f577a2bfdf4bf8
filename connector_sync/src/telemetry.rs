use crate::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Log output format for the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "pretty" | "text" => Some(LogFormat::Pretty),
            _ => None,
        }
    }
}

/// Reads `CONNECTOR_SYNC_LOG_FORMAT` (`json` | `pretty`, default `json`).
/// Filtering follows `RUST_LOG`, defaulting to `info`. Logs go to stderr so
/// command output on stdout stays machine-readable.
pub fn init_from_env() -> Result<()> {
    let format = std::env::var("CONNECTOR_SYNC_LOG_FORMAT")
        .ok()
        .and_then(|v| LogFormat::parse_str(&v))
        .unwrap_or_default();
    init(format)
}

#[tracing::instrument(level = "info")]
pub fn init(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let res = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    res.map_err(|e| Error::Conflict(format!("tracing already initialized: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_known_names() {
        assert_eq!(LogFormat::parse_str("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse_str(" pretty "), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse_str("text"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse_str("xml"), None);
    }

    #[test]
    fn second_init_reports_conflict() {
        let _ = init(LogFormat::Json);
        let second = init(LogFormat::Pretty);
        assert!(matches!(second, Err(Error::Conflict(_))));
    }
}
