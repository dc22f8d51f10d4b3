pub mod dispatch;
pub mod lifecycle;
pub mod models;
pub mod persistence;
pub mod provider;
pub mod registry;
pub mod runtime;
pub mod sqlite;

/// Install a process-wide fmt subscriber honoring `RUST_LOG`. Embedders
/// call this once at startup; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
