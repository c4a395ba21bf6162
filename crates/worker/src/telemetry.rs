// Telemetry initialization
//
// Console logging through tracing-subscriber with an EnvFilter.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default filter when neither RUST_LOG nor LOG_LEVEL is set
pub const DEFAULT_LOG_FILTER: &str = "benchrun_worker=info,benchrun_scheduler=info";

/// Configuration for logging
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name, attached to the startup event
    pub service_name: String,
    /// Whether to enable console logging
    pub enable_console: bool,
    /// Log filter (e.g., "info", "benchrun_scheduler=debug")
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "benchrun-worker".to_string(),
            enable_console: true,
            log_filter: None,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `OTEL_SERVICE_NAME`: Service name (default: "benchrun-worker")
    /// - `RUST_LOG`: Full log filter
    /// - `LOG_LEVEL`: Level applied to the benchrun crates
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let log_filter = lookup("RUST_LOG").or_else(|| {
            lookup("LOG_LEVEL")
                .map(|level| format!("benchrun_worker={level},benchrun_scheduler={level}"))
        });
        Self {
            service_name: lookup("OTEL_SERVICE_NAME")
                .unwrap_or_else(|| "benchrun-worker".to_string()),
            enable_console: true,
            log_filter,
        }
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

/// Initialize the global subscriber
///
/// Call once, at startup.
pub fn init_telemetry(config: TelemetryConfig) {
    let console_layer = if config.enable_console {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(config.filter()),
        )
    } else {
        None
    };

    tracing_subscriber::registry().with(console_layer).init();

    tracing::debug!(service = %config.service_name, "Telemetry initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_expands_to_crates() {
        let config = TelemetryConfig::from_lookup(|key| {
            (key == "LOG_LEVEL").then(|| "debug".to_string())
        });
        assert_eq!(
            config.log_filter.as_deref(),
            Some("benchrun_worker=debug,benchrun_scheduler=debug")
        );
        assert_eq!(config.service_name, "benchrun-worker");
    }

    #[test]
    fn test_rust_log_wins() {
        let config = TelemetryConfig::from_lookup(|key| match key {
            "RUST_LOG" => Some("warn".to_string()),
            "LOG_LEVEL" => Some("trace".to_string()),
            _ => None,
        });
        assert_eq!(config.log_filter.as_deref(), Some("warn"));
    }

    #[test]
    fn test_default_filter() {
        let config = TelemetryConfig::default();
        assert_eq!(
            config.filter().to_string(),
            EnvFilter::new(DEFAULT_LOG_FILTER).to_string()
        );
    }
}
