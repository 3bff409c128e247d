//! Tracing subscriber setup.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Normalise a configured level, falling back to `info`.
fn fallback_level(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Install a global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level comes from
/// `PHASEWRIGHT_LOG` or the config. Only the first call has an effect, and
/// an already-installed global subscriber is left alone.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.get_or_init(|| {
        let level = config.effective_level();
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(fallback_level(&level)))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let installed = if config.json {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .try_init()
                .is_ok()
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .try_init()
                .is_ok()
        };

        if installed {
            tracing::info!(level = %level, json = config.json, "tracing initialized");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_level() {
        assert_eq!(fallback_level("DEBUG"), "debug");
        assert_eq!(fallback_level(" warn "), "warn");
        assert_eq!(fallback_level("verbose"), "info");
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        let config = LoggingConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }
}
