//! Virtual device plugin - exposes host device files to containers
//!
//! Each generation of the plugin:
//! - Expands the configured path templates into concrete device files
//! - Serves the DevicePlugin gRPC API on its own socket
//! - Registers that socket with the kubelet
//! - Probes device files periodically and pushes health transitions
//!
//! # Architecture
//!
//! A single controller task owns the current generation and replaces it
//! whenever the kubelet restarts, SIGHUP arrives, or registration failed.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              LifecycleController             │
//! │   (inotify on kubelet.sock, unix signals)    │
//! ├──────────────────────────────────────────────┤
//! │                 PluginServer                 │
//! ├──────────────────────┬───────────────────────┤
//! │   InventoryService   │     HealthMonitor     │
//! │  (gRPC, unix socket) │  (probe ──▶ watch)    │
//! ├──────────────────────┴───────────────────────┤
//! │  DeviceTemplate::expand  │  probe(devices)   │
//! └──────────────────────────────────────────────┘
//! ```

pub mod controller;
pub mod device;
pub mod health;
pub mod registration;
pub mod server;
pub mod shutdown;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{ControllerEvent, LifecycleController};
pub use device::{ConcreteDevice, DeviceTemplate, ExposedDevice, Health};
pub use health::HealthMonitor;
pub use server::{InventoryService, PluginServer, ServerState};
pub use shutdown::{ShutdownCoordinator, ShutdownListener};
