use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins when set; the default keeps the gateway chatty enough to
/// follow routing decisions without upstream bodies.
pub fn setup_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,switchboard=info,switchboard_server=info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
