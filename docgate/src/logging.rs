use crate::config::LoggingConfig;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. With a DSN configured, errors are sent to
/// Sentry as events and lower levels become breadcrumbs. The returned guard
/// flushes pending events when dropped and must outlive the runtime.
pub fn init(config: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                environment: config.environment.clone().map(Into::into),
                send_default_pii: false,
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    if guard.as_ref().is_some_and(|g| g.is_enabled()) {
        tracing::info!("sentry reporting enabled");
    }
    guard
}
