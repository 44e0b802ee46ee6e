//! Error types for kubedock

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No such container: {0}")]
    ContainerNotFound(String),

    #[error("Conflict. The container name \"{0}\" is already in use")]
    NameConflict(String),

    #[error("No pod found for container: {0}")]
    PodNotFound(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Pod {pod} failed to start: {reason}")]
    SchedulingFailure { pod: String, reason: String },

    #[error("Port tunnel error: {0}")]
    Tunnel(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Start of container {0} cancelled by a stop request")]
    Cancelled(String),

    #[error("Unable to allocate a unique container id")]
    IdExhausted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error means the container or its pod does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ContainerNotFound(_) | Error::PodNotFound(_))
    }

    /// Check if the operation that produced this error is worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(resp)) => {
                matches!(resp.code, 429 | 500 | 502 | 503 | 504)
            }
            Error::Kube(
                kube::Error::HyperError(_)
                | kube::Error::Service(_)
                | kube::Error::HttpError(_),
            ) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Build the error the API server reports for a failed request
    pub fn from_status(code: u16, reason: &str, message: impl Into<String>) -> Self {
        Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: message.into(),
            reason: reason.into(),
            code,
        }))
    }

    /// HTTP status code reported by the API server, if any
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }
}
