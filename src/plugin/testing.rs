//! In-process kubelet registration endpoint for tests

use super::shutdown::ShutdownCoordinator;
use crate::api::v1beta1::registration_server::{Registration, RegistrationServer};
use crate::api::v1beta1::{Empty, RegisterRequest};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

#[derive(Clone, Default)]
pub struct FakeKubelet {
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
    reject: Arc<AtomicBool>,
}

pub struct FakeKubeletHandle {
    socket: PathBuf,
    shutdown: ShutdownCoordinator,
    task: JoinHandle<()>,
}

impl FakeKubelet {
    pub fn rejecting() -> Self {
        let kubelet = Self::default();
        kubelet.set_reject(true);
        kubelet
    }

    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<RegisterRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub async fn serve(&self, socket: &Path) -> FakeKubeletHandle {
        let _ = std::fs::remove_file(socket);
        let listener = UnixListener::bind(socket).unwrap();
        let shutdown = ShutdownCoordinator::new();
        let mut stop = shutdown.listener();
        let router = Server::builder().add_service(RegistrationServer::new(self.clone()));

        let task = tokio::spawn(async move {
            let _ = router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    stop.wait().await
                })
                .await;
        });

        FakeKubeletHandle {
            socket: socket.to_path_buf(),
            shutdown,
            task,
        }
    }
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        self.requests.lock().unwrap().push(request.into_inner());
        if self.reject.load(Ordering::SeqCst) {
            return Err(Status::failed_precondition("registration rejected"));
        }
        Ok(Response::new(Empty {}))
    }
}

impl FakeKubeletHandle {
    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = self.task.await;
        let _ = std::fs::remove_file(&self.socket);
    }
}
