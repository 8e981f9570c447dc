use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vdevice-plugin")]
#[command(version)]
#[command(about = "Kubelet device plugin exposing host device files as virtual devices", long_about = None)]
pub(crate) struct Cli {
    /// Config file. Can also be set via VDP_CONFIG env var.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Kubelet device plugin directory. Can also be set via VDP_DEVICE_PLUGIN_DIR env var.
    #[arg(long, global = true)]
    pub plugin_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Default)]
pub(crate) enum Commands {
    /// Serve the device plugin and keep it registered with the kubelet (default)
    #[default]
    Run,

    /// Expand the configured templates on this host and print the result
    Expand,
}
