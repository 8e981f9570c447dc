use super::device::{expand_all, probe, ConcreteDevice, ExposedDevice, Health};
use super::health::HealthMonitor;
use super::registration::{self, DIAL_TIMEOUT};
use super::shutdown::{ShutdownCoordinator, ShutdownListener};
use crate::api::v1beta1::device_plugin_server::{DevicePlugin, DevicePluginServer};
use crate::api::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, Device, DevicePluginOptions,
    DeviceSpec, Empty, ListAndWatchResponse, PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse,
};
use crate::config::PluginConfig;
use crate::error::{PluginError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info, trace, warn};

/// How long `stop` waits for in-flight RPCs before aborting the server task
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const LIST_AND_WATCH_BUFFER: usize = 4;

pub fn plugin_options() -> DevicePluginOptions {
    DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: false,
    }
}

/// The kubelet-facing device plugin service for one generation.
///
/// Cloned into the tonic server. Health updates arrive on a watch channel
/// written only by the [`HealthMonitor`]; each ListAndWatch stream owns its
/// copy of the device slots and is the only place health gets applied.
#[derive(Clone)]
pub struct InventoryService {
    devices: Arc<[ConcreteDevice]>,
    slots: Arc<[ExposedDevice]>,
    health: watch::Receiver<Health>,
    stop: ShutdownListener,
}

impl InventoryService {
    /// Every container in the request receives every expanded device.
    fn container_response(&self) -> ContainerAllocateResponse {
        ContainerAllocateResponse {
            devices: self.devices.iter().map(DeviceSpec::from).collect(),
            ..Default::default()
        }
    }
}

fn list_response(slots: &[ExposedDevice]) -> ListAndWatchResponse {
    ListAndWatchResponse {
        devices: slots.iter().map(Device::from).collect(),
    }
}

fn apply_health(slots: &mut [ExposedDevice], health: Health) {
    for slot in slots.iter_mut() {
        slot.health = health;
    }
}

#[tonic::async_trait]
impl DevicePlugin for InventoryService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(plugin_options()))
    }

    type ListAndWatchStream = ReceiverStream<std::result::Result<ListAndWatchResponse, Status>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<Self::ListAndWatchStream>, Status> {
        let (tx, rx) = mpsc::channel(LIST_AND_WATCH_BUFFER);
        let mut slots = self.slots.to_vec();
        let mut health = self.health.clone();
        let mut stop = self.stop.clone();

        tokio::spawn(async move {
            let current = *health.borrow_and_update();
            apply_health(&mut slots, current);
            info!(devices = slots.len(), health = %current, "Exposing devices");
            if tx.send(Ok(list_response(&slots))).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    _ = stop.wait() => {
                        debug!("ListAndWatch stream closed by stop signal");
                        return;
                    }
                    _ = tx.closed() => {
                        debug!("ListAndWatch client went away");
                        return;
                    }
                    changed = health.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let value = *health.borrow_and_update();
                        apply_health(&mut slots, value);
                        info!(health = %value, "Sending updated device health");
                        if tx.send(Ok(list_response(&slots))).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> std::result::Result<Response<PreferredAllocationResponse>, Status> {
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> std::result::Result<Response<AllocateResponse>, Status> {
        let request = request.into_inner();
        info!(
            containers = request.container_requests.len(),
            "Allocate request"
        );
        debug!(?request, "Allocate request details");

        let response = AllocateResponse {
            container_responses: request
                .container_requests
                .iter()
                .map(|_| self.container_response())
                .collect(),
        };

        debug!(?response, "Allocate response");
        Ok(Response::new(response))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> std::result::Result<Response<PreStartContainerResponse>, Status> {
        Ok(Response::new(PreStartContainerResponse::default()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    Serving,
    Stopped,
}

/// One plugin generation: expanded devices, gRPC server, socket file and
/// health monitor. A generation is never restarted; the controller builds a
/// new one instead.
pub struct PluginServer {
    resource_name: String,
    socket_name: String,
    socket: PathBuf,
    health_interval: Duration,
    devices: Arc<[ConcreteDevice]>,
    slots: Arc<[ExposedDevice]>,
    health: watch::Sender<Health>,
    shutdown: ShutdownCoordinator,
    server_task: Option<JoinHandle<std::result::Result<(), tonic::transport::Error>>>,
    monitor_task: Option<JoinHandle<()>>,
    state: ServerState,
}

impl PluginServer {
    /// Expand the configured templates and probe their initial health.
    pub fn new(config: &PluginConfig, plugin_dir: &Path) -> Result<Self> {
        let devices: Arc<[ConcreteDevice]> = expand_all(&config.virtual_devices)?.into();
        let initial = probe(&devices);
        let (health, _) = watch::channel(initial);

        Ok(Self {
            resource_name: config.resource_name.clone(),
            socket_name: config.socket_name.clone(),
            socket: plugin_dir.join(&config.socket_name),
            health_interval: config.health_check_interval(),
            devices,
            slots: ExposedDevice::slots(config.num_devices, initial).into(),
            health,
            shutdown: ShutdownCoordinator::new(),
            server_task: None,
            monitor_task: None,
            state: ServerState::Created,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    pub fn devices(&self) -> &[ConcreteDevice] {
        &self.devices
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn health(&self) -> Health {
        *self.health.borrow()
    }

    fn service(&self) -> InventoryService {
        InventoryService {
            devices: Arc::clone(&self.devices),
            slots: Arc::clone(&self.slots),
            health: self.health.subscribe(),
            stop: self.shutdown.listener(),
        }
    }

    /// Bind the socket, serve gRPC on it and confirm with a self-dial.
    ///
    /// On failure after binding, the listener and socket file are torn down
    /// before returning.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ServerState::Created {
            return Err(PluginError::Lifecycle(format!(
                "plugin server cannot start from state {:?}",
                self.state
            )));
        }

        self.cleanup()?;

        let listener =
            UnixListener::bind(&self.socket).map_err(|e| PluginError::socket(&self.socket, e))?;
        self.state = ServerState::Listening;
        debug!(socket = %self.socket.display(), "Plugin socket bound");

        let mut stop = self.shutdown.listener();
        let router = Server::builder().add_service(DevicePluginServer::new(self.service()));
        self.server_task = Some(tokio::spawn(router.serve_with_incoming_shutdown(
            UnixListenerStream::new(listener),
            async move { stop.wait().await },
        )));

        match registration::dial(&self.socket, DIAL_TIMEOUT).await {
            Ok(channel) => drop(channel),
            Err(e) => {
                if let Err(stop_err) = self.stop().await {
                    warn!("Failed to clean up after start failure: {}", stop_err);
                }
                return Err(e);
            }
        }

        let monitor = HealthMonitor::new(
            Arc::clone(&self.devices),
            self.health_interval,
            self.health.clone(),
            self.shutdown.listener(),
        );
        self.monitor_task = Some(tokio::spawn(monitor.run()));
        self.state = ServerState::Serving;

        Ok(())
    }

    /// Start, then register with the kubelet. A registration failure stops
    /// the freshly started server again.
    pub async fn serve(&mut self, kubelet_socket: &Path) -> Result<()> {
        if let Err(e) = self.start().await {
            warn!("Could not start device plugin: {}", e);
            return Err(e);
        }
        info!("Starting to serve on {}", self.socket.display());

        let registered =
            registration::register(kubelet_socket, &self.socket_name, &self.resource_name).await;
        if let Err(e) = registered {
            warn!("Could not register device plugin: {}", e);
            self.stop().await?;
            return Err(e);
        }
        info!(resource = %self.resource_name, "Registered device plugin with Kubelet");

        Ok(())
    }

    /// Halt the server and health monitor and remove the socket file.
    ///
    /// Returns only once the listener is closed. Calling it again is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == ServerState::Stopped {
            return Ok(());
        }
        let bound = self.state != ServerState::Created;

        self.shutdown.trigger();

        if let Some(mut task) = self.server_task.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(Ok(()))) => trace!("gRPC server shut down"),
                Ok(Ok(Err(e))) => warn!("gRPC server exited with error: {}", e),
                Ok(Err(e)) => warn!("gRPC server task failed: {}", e),
                Err(_) => {
                    warn!(
                        "gRPC server did not stop within {:?}, aborting",
                        SHUTDOWN_GRACE
                    );
                    task.abort();
                    let _ = task.await;
                }
            }
        }

        if let Some(task) = self.monitor_task.take() {
            if let Err(e) = task.await {
                warn!("Health monitor task failed: {}", e);
            }
        }

        self.state = ServerState::Stopped;
        if bound {
            self.cleanup()?;
        }
        debug!(socket = %self.socket.display(), "Plugin server stopped");
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        match std::fs::remove_file(&self.socket) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PluginError::socket(&self.socket, e)),
        }
    }
}
