use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("invalid device template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("failed to expand device template: {0}")]
    Expansion(#[from] glob::PatternError),

    #[error("socket error on {path}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {timeout:?} dialing {path}")]
    DialTimeout { path: PathBuf, timeout: Duration },

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("registration with kubelet failed: {0}")]
    Registration(#[from] tonic::Status),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid lifecycle transition: {0}")]
    Lifecycle(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("filesystem watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl PluginError {
    pub fn invalid_template(template: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            template: template.into(),
            reason: reason.into(),
        }
    }

    pub fn socket(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Socket {
            path: path.into(),
            source,
        }
    }

    /// Errors caused by the kubelet side (missing socket, refused dial,
    /// rejected registration). The controller keeps the restart pending
    /// for these instead of exiting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Socket { .. } | Self::DialTimeout { .. } | Self::Transport(_) | Self::Registration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        let timeout = PluginError::DialTimeout {
            path: PathBuf::from("/tmp/kubelet.sock"),
            timeout: Duration::from_secs(5),
        };
        assert!(timeout.is_recoverable());

        let socket = PluginError::socket(
            "/tmp/plugin.sock",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(socket.is_recoverable());

        let rejected = PluginError::Registration(tonic::Status::unavailable("down"));
        assert!(rejected.is_recoverable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(!PluginError::invalid_template("/dev/a*b*", "too many wildcards").is_recoverable());
        assert!(!PluginError::Config("empty resourceName".into()).is_recoverable());
        assert!(!PluginError::Lifecycle("start from Stopped".into()).is_recoverable());
    }

    #[test]
    fn test_error_messages() {
        let err = PluginError::invalid_template("/dev/a*b*", "too many wildcards");
        assert_eq!(
            err.to_string(),
            "invalid device template '/dev/a*b*': too many wildcards"
        );
    }
}
