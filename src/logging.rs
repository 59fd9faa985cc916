use tracing_subscriber::{fmt, EnvFilter};

/// Logs go to stderr; `RUST_LOG` overrides the default level.
pub fn init(verbose: bool) {
    let default_directive = if verbose {
        "rdl=debug,rdl_resume=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
