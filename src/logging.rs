/// Tracing setup shared by the binaries.
///
/// Logs go to stderr so that reports printed on stdout (`--json`) stay
/// machine-readable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TracingConfig {
    /// Filter directive used when `RUST_LOG` is unset (e.g. "info", "nimbus_sync=debug")
    pub filter: String,
    /// JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl TracingConfig {
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Reads `RUST_LOG` and `LOG_JSON` through `lookup`.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let json = lookup("LOG_JSON").is_some_and(|v| is_truthy(&v));
        let filter = lookup("RUST_LOG")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "info".to_string());
        Self::default().with_filter(filter).with_json(json)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Installs the global subscriber. A second call is a no-op.
pub fn init_tracing(config: &TracingConfig) {
    let env_filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if config.json {
        let fmt_layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()
    } else {
        let fmt_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

        tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()
    };

    if installed.is_ok() {
        tracing::debug!(filter = %config.filter, json = config.json, "tracing initialized");
    }
}

/// Initializes tracing from `RUST_LOG` / `LOG_JSON`, reading `.env` first.
pub fn init_from_env() {
    dotenv::dotenv().ok();
    init_tracing(&TracingConfig::from_lookup(&|name| std::env::var(name).ok()));
}
