use anyhow::Context;
use std::path::Path;
use tokio::sync::mpsc;
use vdevice_plugin::clienv;
use vdevice_plugin::plugin::controller::{self, LifecycleController};
use vdevice_plugin::PluginConfig;

pub(crate) async fn cmd_run(config: PluginConfig, plugin_dir: &Path) -> anyhow::Result<()> {
    tracing::info!(dir = %plugin_dir.display(), "Starting device plugin");

    let (tx, rx) = mpsc::unbounded_channel();

    // Keep the watcher alive for the whole run.
    let _watcher = controller::watch_plugin_dir(plugin_dir, tx.clone())
        .with_context(|| format!("Failed to watch {}", plugin_dir.display()))?;
    let signals = controller::spawn_signal_listener(tx)
        .context("Failed to install signal handlers")?;

    let result = LifecycleController::new(config, plugin_dir, clienv::retry_interval())
        .run(rx)
        .await;
    signals.abort();

    result.context("Device plugin stopped with an unrecoverable error")?;
    tracing::info!("Device plugin stopped");
    Ok(())
}
