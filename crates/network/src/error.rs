use infermesh_core::FailureCategory;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Not connected")]
    NotConnected,

    #[error("Dial failed: {0}")]
    DialFailed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("DHT error: {0}")]
    DhtError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::ProtocolViolation(_) | Self::InvalidPeerId(_) | Self::InvalidAddress(_) => {
                FailureCategory::ProtocolViolation
            }
            Self::Cancelled => FailureCategory::Cancelled,
            _ => FailureCategory::TransientNetwork,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;
