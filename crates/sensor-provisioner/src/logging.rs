use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "PROVISION_LOG";
const DEFAULT_LEVEL: &str = "info";

/// Filter directives from `PROVISION_LOG`, then `RUST_LOG`, then `info`.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
}

/// Installs the global subscriber on stderr; stdout carries tool output and the run summary.
pub fn init_tracing(json: bool) {
    let filter = env_filter();
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .without_time()
            .compact()
            .init();
    }
}
