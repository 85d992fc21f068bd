use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

pub const ENV_LOG_JSON: &str = "DEMO_RECORDER_LOG_JSON";

/// Install the global subscriber. `RUST_LOG` wins over the `debug` flag.
pub fn init_tracing(debug: bool) {
    let _ = TRACING_INIT.get_or_init(|| {
        let default_level = if debug { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));

        let json = std::env::var(ENV_LOG_JSON)
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(false);

        // stdout carries the status lines
        let result = if json {
            let subscriber = tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_current_span(false)
                .with_span_list(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        } else {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        };

        if let Err(e) = result {
            eprintln!("Warning: could not install log subscriber: {}", e);
        }
    });
}
