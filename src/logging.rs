use tracing_subscriber::EnvFilter;

/// Crate log level when `RUST_LOG` is unset: chatty in dev builds only.
fn default_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "craft_loop=debug"
    } else {
        "craft_loop=info"
    }
}

/// Install the global subscriber, writing to stderr with thread names.
///
/// Safe to call more than once; later calls are ignored.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init();
}
