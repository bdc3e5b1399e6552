use tracing_subscriber::EnvFilter;

/// Initialize process-wide tracing output.
///
/// Honors `RUST_LOG` when set, defaulting to `info` otherwise. Safe to call
/// more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ragline_orchestration=info,ragline_worker=info,info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
