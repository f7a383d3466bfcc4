//! Shared `tracing` initialization for the MCPL binaries.

/// Install a `tracing_subscriber` that writes to stderr and honors `RUST_LOG`.
/// Call once, near the top of `main`.
pub fn init() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
