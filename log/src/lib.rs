use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt,
};

/// Install the process-wide tracing subscriber.
///
/// Events go to stderr through a non-blocking writer so that logging never
/// stalls the signaling or media loops. The default level is INFO and can be
/// overridden with `RUST_LOG`.
pub fn init() {
    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
    std::mem::forget(guard);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .compact(),
        )
        .init();
}
