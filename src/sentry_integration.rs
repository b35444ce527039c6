use failure::Error as FailureError;
use sentry;
use sentry::integrations::failure::capture_error;

#[derive(Debug, Deserialize, Clone)]
pub struct SentryConfig {
    pub dsn: String,
}

pub fn init(sentry_config: Option<&SentryConfig>) -> Option<sentry::internals::ClientInitGuard> {
    sentry_config.map(|config_sentry| {
        info!("initialization support with sentry {}", config_sentry.dsn);
        let result = sentry::init((
            config_sentry.dsn.clone(),
            sentry::ClientOptions {
                release: sentry_crate_release!(),
                ..Default::default()
            },
        ));
        sentry::integrations::panic::register_panic_handler();
        result
    })
}

/// Logs the error and reports it to sentry when the client is initialized
pub fn report(err: &FailureError) {
    error!("{:?}", err);
    capture_error(err);
}
