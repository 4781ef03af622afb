pub const LOG_FILTER_ENV: &str = "MODMAIL_LOG";
const DEFAULT_FILTER: &str = "modmail=info,sqlx=warn";

/// Install the JSON tracing subscriber and bridge `log` records into it.
///
/// Safe to call more than once; later calls keep the first subscriber.
/// Output goes to stderr so command output on stdout stays parseable.
pub fn init_logging() {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var(LOG_FILTER_ENV).unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .json()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_writer(std::io::stderr)
        .try_init();
}
