use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "vdevice_plugin=info,info";

pub(crate) fn initialize_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if vdevice_plugin::clienv::json_logs() {
        builder.json().init();
    } else {
        builder.init();
    }
    tracing::trace!("Logging initialized");
}
