use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "RUST_LOG";

/// Sends `tracing` output to stderr so stdout carries only protocol output.
/// `RUST_LOG` wins over `verbose` when both are given.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
