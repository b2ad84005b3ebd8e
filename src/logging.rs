use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "PROCVISOR_LOG";
pub const DEFAULT_DIRECTIVE: &str = "warn";

/// Installs the stderr fmt subscriber. Filter directives come from
/// `PROCVISOR_LOG`; a second call is a no-op.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(std::env::var(LOG_ENV).ok().as_deref()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn env_filter(raw: Option<&str>) -> EnvFilter {
    raw.map(str::trim)
        .filter(|raw| !raw.is_empty())
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}
