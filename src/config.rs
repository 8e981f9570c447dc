use crate::error::{PluginError, Result};
use crate::plugin::device::DeviceTemplate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 60;

/// Upper bound for `healthCheckIntervalSeconds` (one day)
pub const MAX_HEALTH_CHECK_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Plugin configuration as read from the JSON config file.
///
/// Immutable for the lifetime of the process; every generation is built
/// from the same value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    /// Extended resource name, e.g. `example.com/vgpu`
    pub resource_name: String,
    /// Socket file name inside the device plugin directory
    pub socket_name: String,
    #[serde(default)]
    pub virtual_devices: Vec<DeviceTemplate>,
    /// Number of slots advertised, independent of how many files matched
    pub num_devices: usize,
    #[serde(default)]
    pub health_check_interval_seconds: Option<u64>,
}

impl PluginConfig {
    pub fn load(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading plugin config");

        let content = fs::read_to_string(path).map_err(|e| {
            PluginError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json(&content)?;

        tracing::trace!(
            resource = %config.resource_name,
            templates = config.virtual_devices.len(),
            "Plugin config loaded"
        );
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject structurally invalid configs up front rather than running
    /// with a partial device set.
    pub fn validate(&self) -> Result<()> {
        if self.resource_name.trim().is_empty() {
            return Err(PluginError::Config("resourceName must not be empty".into()));
        }
        if self.socket_name.trim().is_empty() {
            return Err(PluginError::Config("socketName must not be empty".into()));
        }
        if self.socket_name.contains('/') {
            return Err(PluginError::Config(format!(
                "socketName must be a file name, got '{}'",
                self.socket_name
            )));
        }
        if let Some(secs) = self.health_check_interval_seconds {
            if secs > MAX_HEALTH_CHECK_INTERVAL_SECS {
                return Err(PluginError::Config(format!(
                    "healthCheckIntervalSeconds must be at most {}, got {}",
                    MAX_HEALTH_CHECK_INTERVAL_SECS, secs
                )));
            }
        }
        for template in &self.virtual_devices {
            template.validate()?;
        }
        Ok(())
    }

    /// Configured interval, or 60s when absent or zero. Capped at one day.
    pub fn health_check_interval(&self) -> Duration {
        let secs = match self.health_check_interval_seconds {
            Some(secs) if secs > 0 => secs.min(MAX_HEALTH_CHECK_INTERVAL_SECS),
            _ => DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
        };
        Duration::from_secs(secs)
    }

    /// Single-line JSON rendering for the startup log
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "resourceName": "example.com/vgpu",
        "socketName": "vgpu.sock",
        "virtualDevices": [
            {"pathTemplate": "/dev/gpu*", "containerPathTemplate": "/dev/vgpu*", "permission": "rw"}
        ],
        "numDevices": 4,
        "healthCheckIntervalSeconds": 10
    }"#;

    #[test]
    fn test_parse_config() {
        let config = PluginConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.resource_name, "example.com/vgpu");
        assert_eq!(config.socket_name, "vgpu.sock");
        assert_eq!(config.num_devices, 4);
        assert_eq!(
            config.virtual_devices,
            vec![DeviceTemplate::new("/dev/gpu*", "/dev/vgpu*", "rw")]
        );
        assert_eq!(config.health_check_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_default_health_interval() {
        let config = PluginConfig::from_json(
            r#"{"resourceName": "r", "socketName": "s.sock", "numDevices": 1}"#,
        )
        .unwrap();
        assert_eq!(config.health_check_interval(), Duration::from_secs(60));

        let config = PluginConfig::from_json(
            r#"{"resourceName": "r", "socketName": "s.sock", "numDevices": 1, "healthCheckIntervalSeconds": 0}"#,
        )
        .unwrap();
        assert_eq!(config.health_check_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_invalid_structure() {
        assert!(matches!(
            PluginConfig::from_json(r#"{"resourceName": "", "socketName": "s", "numDevices": 1}"#),
            Err(PluginError::Config(_))
        ));
        assert!(matches!(
            PluginConfig::from_json(
                r#"{"resourceName": "r", "socketName": "a/b.sock", "numDevices": 1}"#
            ),
            Err(PluginError::Config(_))
        ));
        assert!(matches!(
            PluginConfig::from_json(r#"{"resourceName": "r", "socketName": "s", "numDevices": -1}"#),
            Err(PluginError::Serialization(_))
        ));
        assert!(matches!(
            PluginConfig::from_json(r#"{"socketName": "s", "numDevices": 1}"#),
            Err(PluginError::Serialization(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_template() {
        let json = r#"{
            "resourceName": "r",
            "socketName": "s.sock",
            "virtualDevices": [
                {"pathTemplate": "/dev/a*b*", "containerPathTemplate": "/dev/c*", "permission": "rw"}
            ],
            "numDevices": 1
        }"#;
        assert!(matches!(
            PluginConfig::from_json(json),
            Err(PluginError::InvalidTemplate { .. })
        ));
    }

    #[test]
    fn test_rejects_oversized_health_interval() {
        let json = r#"{
            "resourceName": "r",
            "socketName": "s.sock",
            "numDevices": 1,
            "healthCheckIntervalSeconds": 18446744073709551615
        }"#;
        assert!(matches!(
            PluginConfig::from_json(json),
            Err(PluginError::Config(_))
        ));

        let config = PluginConfig {
            resource_name: "r".to_string(),
            socket_name: "s.sock".to_string(),
            virtual_devices: Vec::new(),
            num_devices: 1,
            health_check_interval_seconds: Some(u64::MAX),
        };
        assert_eq!(
            config.health_check_interval(),
            Duration::from_secs(MAX_HEALTH_CHECK_INTERVAL_SECS)
        );
    }

    #[test]
    fn test_rejects_malformed_glob() {
        let json = r#"{
            "resourceName": "r",
            "socketName": "s.sock",
            "virtualDevices": [
                {"pathTemplate": "/dev/[gpu*", "containerPathTemplate": "/dev/vgpu*", "permission": "rw"}
            ],
            "numDevices": 1
        }"#;
        let err = PluginConfig::from_json(json).unwrap_err();
        assert!(matches!(err, PluginError::Expansion(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_to_json_uses_camel_case() {
        let config = PluginConfig::from_json(SAMPLE).unwrap();
        let json = config.to_json().unwrap();
        assert!(json.contains("\"resourceName\":\"example.com/vgpu\""));
        assert!(json.contains("\"healthCheckIntervalSeconds\":10"));
        assert_eq!(PluginConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let result = PluginConfig::load(Path::new("/nonexistent/vdevice-plugin/config.json"));
        assert!(matches!(result, Err(PluginError::Config(_))));
    }
}
