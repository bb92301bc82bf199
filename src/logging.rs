use crate::config::AppConfig;

/// Initialize logging from the service configuration.
///
/// The default level follows `APP_DEBUG` (`debug` when set, `info` otherwise)
/// and can be overridden per-target through `TRANSOM_LOG`. Dev runs log
/// compact human-readable lines; every other environment emits JSON with span
/// context, since those logs are headed for an ingestion pipeline rather than
/// a terminal.
#[cfg(feature = "logging")]
pub fn init(cfg: &AppConfig) {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    use crate::config::Environment;

    let default_level = if cfg.debug {
        tracing::level_filters::LevelFilter::DEBUG
    } else {
        tracing::level_filters::LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_env_var("TRANSOM_LOG")
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);
    let _ = match cfg.environment {
        Environment::Dev => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
        _ => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init(),
    };
}

/// Initialize logging when the `logging` feature is not enabled.
///
/// We keep this as a no-op so library consumers can call `transom::init_logging()` without
/// needing to pull in `tracing-subscriber`.
#[cfg(not(feature = "logging"))]
pub fn init(_cfg: &AppConfig) {}
