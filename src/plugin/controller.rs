use super::server::PluginServer;
use crate::api;
use crate::config::PluginConfig;
use crate::error::Result;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Triggers consumed by the controller loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// The kubelet registration socket was (re)created
    KubeletRestarted,
    /// SIGHUP
    Reload,
    /// A terminating signal; carries the signal name
    Shutdown(&'static str),
    /// The directory watch reported an error
    WatchError(String),
}

/// Owns the current plugin generation and decides when to rebuild it.
///
/// Runs on a single task: restarts are never concurrent, and a generation is
/// fully stopped before the next one binds its socket.
pub struct LifecycleController {
    config: PluginConfig,
    plugin_dir: PathBuf,
    kubelet_socket: PathBuf,
    retry_interval: Duration,
    current: Option<PluginServer>,
    restart_pending: bool,
    generation: u64,
}

impl LifecycleController {
    pub fn new(config: PluginConfig, plugin_dir: &Path, retry_interval: Duration) -> Self {
        Self {
            config,
            plugin_dir: plugin_dir.to_path_buf(),
            kubelet_socket: plugin_dir.join(api::KUBELET_SOCKET),
            retry_interval,
            current: None,
            restart_pending: true,
            generation: 0,
        }
    }

    /// Drive restarts until a terminating event arrives or the event
    /// channel closes. Only non-recoverable errors are returned.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ControllerEvent>) -> Result<()> {
        loop {
            if self.restart_pending {
                if let Err(e) = self.restart().await {
                    error!("Fatal error while restarting device plugin: {}", e);
                    self.stop_current().await;
                    return Err(e);
                }
            }

            let event = if self.restart_pending {
                tokio::select! {
                    event = events.recv() => event,
                    _ = tokio::time::sleep(self.retry_interval) => {
                        debug!("Retrying pending restart");
                        continue;
                    }
                }
            } else {
                events.recv().await
            };

            match event {
                Some(ControllerEvent::KubeletRestarted) => {
                    info!(
                        "inotify: {} created, restarting.",
                        self.kubelet_socket.display()
                    );
                    self.restart_pending = true;
                }
                Some(ControllerEvent::Reload) => {
                    info!("Received SIGHUP, restarting.");
                    self.restart_pending = true;
                }
                Some(ControllerEvent::WatchError(e)) => {
                    warn!("inotify: {}", e);
                }
                Some(ControllerEvent::Shutdown(name)) => {
                    info!("Received signal \"{}\", shutting down.", name);
                    break;
                }
                None => {
                    info!("Event sources closed, shutting down.");
                    break;
                }
            }
        }

        self.stop_current().await;
        Ok(())
    }

    async fn restart(&mut self) -> Result<()> {
        self.stop_current().await;

        self.generation += 1;
        let mut server = PluginServer::new(&self.config, &self.plugin_dir)?;
        let expanded: Vec<String> = server
            .devices()
            .iter()
            .map(|d| {
                format!(
                    "{} -> {} ({})",
                    d.host_path.display(),
                    d.container_path.display(),
                    d.permission
                )
            })
            .collect();
        info!(
            generation = self.generation,
            "expanded virtual devices: [{}]",
            expanded.join(", ")
        );

        match server.serve(&self.kubelet_socket).await {
            Ok(()) => {
                self.current = Some(server);
                self.restart_pending = false;
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                warn!(
                    "Could not contact Kubelet, retrying. Did you enable the device plugin feature gate? ({})",
                    e
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn stop_current(&mut self) {
        if let Some(mut server) = self.current.take() {
            if let Err(e) = server.stop().await {
                warn!("Failed to stop device plugin cleanly: {}", e);
            }
        }
    }
}

/// Map a directory watch notification to a controller event
pub fn classify_fs_event(
    result: notify::Result<notify::Event>,
    kubelet_socket: &Path,
) -> Option<ControllerEvent> {
    match result {
        Ok(event) => {
            let created = matches!(event.kind, EventKind::Create(_));
            if created && event.paths.iter().any(|p| p == kubelet_socket) {
                Some(ControllerEvent::KubeletRestarted)
            } else {
                None
            }
        }
        Err(e) => Some(ControllerEvent::WatchError(e.to_string())),
    }
}

/// Watch the device plugin directory for kubelet socket creation.
///
/// The returned watcher must be kept alive for events to flow.
pub fn watch_plugin_dir(
    plugin_dir: &Path,
    events: mpsc::UnboundedSender<ControllerEvent>,
) -> Result<RecommendedWatcher> {
    let kubelet_socket = plugin_dir.join(api::KUBELET_SOCKET);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Some(event) = classify_fs_event(res, &kubelet_socket) {
            let _ = events.send(event);
        }
    })?;
    watcher.watch(plugin_dir, RecursiveMode::NonRecursive)?;
    info!(dir = %plugin_dir.display(), "Watching device plugin directory");
    Ok(watcher)
}

/// Forward SIGHUP as [`ControllerEvent::Reload`] and SIGINT/SIGTERM/SIGQUIT
/// as [`ControllerEvent::Shutdown`].
pub fn spawn_signal_listener(
    events: mpsc::UnboundedSender<ControllerEvent>,
) -> Result<JoinHandle<()>> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = sighup.recv() => ControllerEvent::Reload,
                _ = sigint.recv() => ControllerEvent::Shutdown("interrupt"),
                _ = sigterm.recv() => ControllerEvent::Shutdown("terminated"),
                _ = sigquit.recv() => ControllerEvent::Shutdown("quit"),
            };
            let terminal = matches!(event, ControllerEvent::Shutdown(_));
            if events.send(event).is_err() || terminal {
                return;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;
    use crate::plugin::device::DeviceTemplate;
    use crate::plugin::testing::FakeKubelet;
    use notify::event::CreateKind;
    use std::fs;
    use tempfile::TempDir;

    const RETRY: Duration = Duration::from_millis(100);

    fn config(dir: &TempDir) -> PluginConfig {
        let devs = dir.path().join("dev");
        fs::create_dir_all(&devs).unwrap();
        fs::write(devs.join("gpu0"), b"").unwrap();

        PluginConfig {
            resource_name: "example.com/vgpu".to_string(),
            socket_name: "vgpu.sock".to_string(),
            virtual_devices: vec![DeviceTemplate::new(
                devs.join("gpu*").to_string_lossy(),
                "/dev/vgpu*",
                "rw",
            )],
            num_devices: 2,
            health_check_interval_seconds: None,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_classify_fs_event() {
        let socket = PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock");

        let created = notify::Event::new(EventKind::Create(CreateKind::File)).add_path(socket.clone());
        assert_eq!(
            classify_fs_event(Ok(created), &socket),
            Some(ControllerEvent::KubeletRestarted)
        );

        let other = notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/var/lib/kubelet/device-plugins/other.sock"));
        assert_eq!(classify_fs_event(Ok(other), &socket), None);

        let removed = notify::Event::new(EventKind::Remove(notify::event::RemoveKind::File))
            .add_path(socket.clone());
        assert_eq!(classify_fs_event(Ok(removed), &socket), None);

        let err = classify_fs_event(Err(notify::Error::generic("queue overflow")), &socket);
        assert!(matches!(err, Some(ControllerEvent::WatchError(_))));
    }

    #[tokio::test]
    async fn test_registers_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let kubelet = FakeKubelet::default();
        let kubelet_server = kubelet.serve(&dir.path().join(api::KUBELET_SOCKET)).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let controller = LifecycleController::new(config(&dir), dir.path(), RETRY);
        let task = tokio::spawn(controller.run(rx));

        wait_until(|| kubelet.requests().len() == 1).await;
        let request = &kubelet.requests()[0];
        assert_eq!(request.endpoint, "vgpu.sock");
        assert_eq!(request.resource_name, "example.com/vgpu");
        assert!(dir.path().join("vgpu.sock").exists());

        tx.send(ControllerEvent::WatchError("transient".into())).unwrap();
        tx.send(ControllerEvent::Shutdown("terminated")).unwrap();
        task.await.unwrap().unwrap();

        assert!(!dir.path().join("vgpu.sock").exists());
        assert_eq!(kubelet.requests().len(), 1);
        kubelet_server.stop().await;
    }

    #[tokio::test]
    async fn test_reregisters_after_kubelet_restart_and_reload() {
        let dir = TempDir::new().unwrap();
        let kubelet = FakeKubelet::default();
        let kubelet_socket = dir.path().join(api::KUBELET_SOCKET);
        let first = kubelet.serve(&kubelet_socket).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let controller = LifecycleController::new(config(&dir), dir.path(), RETRY);
        let task = tokio::spawn(controller.run(rx));
        wait_until(|| kubelet.requests().len() == 1).await;

        first.stop().await;
        let second = kubelet.serve(&kubelet_socket).await;
        tx.send(ControllerEvent::KubeletRestarted).unwrap();
        wait_until(|| kubelet.requests().len() == 2).await;

        tx.send(ControllerEvent::Reload).unwrap();
        wait_until(|| kubelet.requests().len() == 3).await;
        assert!(dir.path().join("vgpu.sock").exists());

        drop(tx);
        task.await.unwrap().unwrap();
        assert!(!dir.path().join("vgpu.sock").exists());
        second.stop().await;
    }

    #[tokio::test]
    async fn test_retries_until_registration_succeeds() {
        let dir = TempDir::new().unwrap();
        let kubelet = FakeKubelet::rejecting();
        let kubelet_server = kubelet.serve(&dir.path().join(api::KUBELET_SOCKET)).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let controller = LifecycleController::new(config(&dir), dir.path(), RETRY);
        let task = tokio::spawn(controller.run(rx));

        wait_until(|| kubelet.requests().len() >= 2).await;

        kubelet.set_reject(false);
        let attempts = kubelet.requests().len();
        wait_until(|| kubelet.requests().len() > attempts).await;
        wait_until(|| dir.path().join("vgpu.sock").exists()).await;

        tx.send(ControllerEvent::Shutdown("interrupt")).unwrap();
        task.await.unwrap().unwrap();
        kubelet_server.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_template_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.virtual_devices = vec![DeviceTemplate::new("/dev/a*b*", "/dev/c*", "rw")];

        let (_tx, rx) = mpsc::unbounded_channel();
        let controller = LifecycleController::new(config, dir.path(), RETRY);
        let result = controller.run(rx).await;
        assert!(matches!(result, Err(PluginError::InvalidTemplate { .. })));
    }

    #[tokio::test]
    async fn test_malformed_glob_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.virtual_devices = vec![DeviceTemplate::new("/dev/[gpu*", "/dev/vgpu*", "rw")];

        let (_tx, rx) = mpsc::unbounded_channel();
        let controller = LifecycleController::new(config, dir.path(), RETRY);
        let err = controller.run(rx).await.unwrap_err();
        assert!(matches!(err, PluginError::Expansion(_)));
        assert!(!err.is_recoverable());
        assert!(!dir.path().join("vgpu.sock").exists());
    }

    #[tokio::test]
    async fn test_watch_reports_kubelet_socket_creation() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = watch_plugin_dir(dir.path(), tx).unwrap();

        let _listener =
            std::os::unix::net::UnixListener::bind(dir.path().join(api::KUBELET_SOCKET)).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(ControllerEvent::KubeletRestarted));
    }
}
