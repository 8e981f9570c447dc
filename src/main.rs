mod args;
mod commands;
mod init;

use anyhow::Context;
use args::{Cli, Commands};
use clap::Parser;
use vdevice_plugin::{clienv, PluginConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    init::initialize_logging();

    let config_path = cli.config.unwrap_or_else(clienv::config_path);
    let plugin_dir = cli.plugin_dir.unwrap_or_else(clienv::device_plugin_dir);

    let config = PluginConfig::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    tracing::info!(path = %config_path.display(), "Loaded config: {}", config.to_json()?);

    match cli.command.unwrap_or_default() {
        Commands::Run => commands::run::cmd_run(config, &plugin_dir).await?,
        Commands::Expand => commands::expand::cmd_expand(&config)?,
    }

    Ok(())
}
