use crate::api::v1beta1::registration_client::RegistrationClient;
use crate::api::v1beta1::RegisterRequest;
use crate::api;
use crate::error::{PluginError, Result};
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, trace};

/// Bound for the self-dial in `Start` and for the kubelet dial in `Register`
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

const DIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Only used to build the endpoint; the connector ignores it.
const UNIX_PLACEHOLDER_URI: &str = "http://[::]:50051";

/// Open a gRPC channel over a Unix socket, retrying until `timeout` elapses.
pub async fn dial(path: &Path, timeout: Duration) -> Result<Channel> {
    let deadline = Instant::now() + timeout;

    loop {
        match tokio::time::timeout_at(deadline, connect(path)).await {
            Ok(Ok(channel)) => {
                trace!(path = %path.display(), "Dialed unix socket");
                return Ok(channel);
            }
            Ok(Err(e)) => {
                trace!(path = %path.display(), "Dial attempt failed: {}", e);
                if Instant::now() + DIAL_RETRY_DELAY >= deadline {
                    break;
                }
                tokio::time::sleep(DIAL_RETRY_DELAY).await;
            }
            Err(_) => break,
        }
    }

    Err(PluginError::DialTimeout {
        path: path.to_path_buf(),
        timeout,
    })
}

async fn connect(path: &Path) -> Result<Channel> {
    let socket: PathBuf = path.to_path_buf();
    let channel = Endpoint::try_from(UNIX_PLACEHOLDER_URI)?
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket).await?)) }
        }))
        .await?;
    Ok(channel)
}

/// Register `endpoint` (the plugin socket's file name) for `resource_name`
/// with the kubelet listening on `kubelet_socket`.
pub async fn register(kubelet_socket: &Path, endpoint: &str, resource_name: &str) -> Result<()> {
    let channel = dial(kubelet_socket, DIAL_TIMEOUT).await?;
    let mut client = RegistrationClient::new(channel);

    let request = RegisterRequest {
        version: api::VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(super::server::plugin_options()),
    };
    debug!(?request, "Sending registration request");

    client.register(request).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::testing::FakeKubelet;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_dial_missing_socket_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.sock");

        let result = dial(&path, Duration::from_millis(300)).await;
        assert!(matches!(result, Err(PluginError::DialTimeout { .. })));
    }

    #[tokio::test]
    async fn test_register_sends_request() {
        let dir = TempDir::new().unwrap();
        let kubelet = FakeKubelet::default();
        let socket = dir.path().join(api::KUBELET_SOCKET);
        let server = kubelet.serve(&socket).await;

        register(&socket, "vgpu.sock", "example.com/vgpu")
            .await
            .unwrap();

        let requests = kubelet.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].version, "v1beta1");
        assert_eq!(requests[0].endpoint, "vgpu.sock");
        assert_eq!(requests[0].resource_name, "example.com/vgpu");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_register_rejected() {
        let dir = TempDir::new().unwrap();
        let kubelet = FakeKubelet::rejecting();
        let socket = dir.path().join(api::KUBELET_SOCKET);
        let server = kubelet.serve(&socket).await;

        let result = register(&socket, "vgpu.sock", "example.com/vgpu").await;
        assert!(matches!(result, Err(PluginError::Registration(_))));
        assert!(result.unwrap_err().is_recoverable());

        server.stop().await;
    }
}
