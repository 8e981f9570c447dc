//! Kubelet device plugin API (v1beta1)
//!
//! Wire types and tonic stubs are generated from
//! `proto/deviceplugin/v1beta1/api.proto` and committed. This module also holds
//! the conversions between those wire types and the plugin's own device types,
//! so nothing outside the gRPC handlers touches protobuf structs.

pub mod v1beta1 {
    include!("../generated/v1beta1.rs");
}

use crate::plugin::device::{ConcreteDevice, ExposedDevice, Health};

/// API version sent in the registration request
pub const VERSION: &str = "v1beta1";

/// Directory where the kubelet expects device plugin sockets
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

/// File name of the kubelet registration socket inside [`DEVICE_PLUGIN_PATH`]
pub const KUBELET_SOCKET: &str = "kubelet.sock";

pub const HEALTHY: &str = "Healthy";
pub const UNHEALTHY: &str = "Unhealthy";

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => HEALTHY,
            Health::Unhealthy => UNHEALTHY,
        }
    }
}

impl From<&ConcreteDevice> for v1beta1::DeviceSpec {
    fn from(device: &ConcreteDevice) -> Self {
        Self {
            container_path: device.container_path.display().to_string(),
            host_path: device.host_path.display().to_string(),
            permissions: device.permission.clone(),
        }
    }
}

impl From<&ExposedDevice> for v1beta1::Device {
    fn from(device: &ExposedDevice) -> Self {
        Self {
            id: device.id.clone(),
            health: device.health.as_str().to_string(),
            topology: None,
        }
    }
}
