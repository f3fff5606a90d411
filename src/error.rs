use thiserror::Error;

/// Failures reported by a transport collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Client request failed: {0}")]
    Client(String),
    #[error("Connection closed")]
    Closed,
    #[error("Request queue is full")]
    RequestQueueFull,
    #[error("Unsupported broker URL: {0}")]
    UnsupportedUrl(String),
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

/// Rejections at the manager boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Broker connection is closing")]
    Closing,
}
