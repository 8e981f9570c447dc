pub mod api;
pub mod clienv;
pub mod config;
pub mod error;
pub mod plugin;

pub use config::PluginConfig;
pub use error::{PluginError, Result};
pub use plugin::{LifecycleController, PluginServer};
