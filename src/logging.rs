use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `STAGECRAFT_LOG` overrides the
/// default level; `--verbose` raises it to debug.
pub fn init(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("STAGECRAFT_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
