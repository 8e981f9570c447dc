use std::path::PathBuf;
use std::time::Duration;

use crate::api;

pub enum EnvVar {
    VdpConfig,
    VdpDevicePluginDir,
    VdpRetryIntervalSecs,
    VdpLogFormat,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VdpConfig => "VDP_CONFIG",
            Self::VdpDevicePluginDir => "VDP_DEVICE_PLUGIN_DIR",
            Self::VdpRetryIntervalSecs => "VDP_RETRY_INTERVAL_SECS",
            Self::VdpLogFormat => "VDP_LOG_FORMAT",
        }
    }
}

const DEFAULT_CONFIG_PATH: &str = "/etc/vdevice-plugin/config.json";
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 5;

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Plugin config file ($VDP_CONFIG or /etc/vdevice-plugin/config.json)
pub fn config_path() -> PathBuf {
    let path = env_opt(EnvVar::VdpConfig.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    tracing::trace!(path = %path.display(), "Resolved config path");
    path
}

/// Kubelet device plugin directory ($VDP_DEVICE_PLUGIN_DIR or /var/lib/kubelet/device-plugins/)
pub fn device_plugin_dir() -> PathBuf {
    let dir = env_opt(EnvVar::VdpDevicePluginDir.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(api::DEVICE_PLUGIN_PATH));
    tracing::trace!(dir = %dir.display(), "Resolved device plugin directory");
    dir
}

/// Delay before re-attempting a pending restart ($VDP_RETRY_INTERVAL_SECS or 5)
pub fn retry_interval() -> Duration {
    let secs = env_opt(EnvVar::VdpRetryIntervalSecs.as_str())
        .and_then(|s| s.parse().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_RETRY_INTERVAL_SECS);
    Duration::from_secs(secs)
}

/// JSON log output when $VDP_LOG_FORMAT=json
pub fn json_logs() -> bool {
    env_opt(EnvVar::VdpLogFormat.as_str())
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}
