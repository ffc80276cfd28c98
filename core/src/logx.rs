use tracing_subscriber::{fmt, EnvFilter};

/// Initialize `tracing` once. Respects `RUST_LOG`; falls back to `default_level`.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Map a `-v` count onto a level name, starting from `base`.
pub fn level_for<'a>(base: &'a str, verbose: u8) -> &'a str {
    match verbose {
        0 => base,
        1 => "debug",
        _ => "trace",
    }
}
