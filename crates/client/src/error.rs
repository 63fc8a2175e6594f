use thiserror::Error;

use infermesh_core::{CoreError, FailureCategory, RejectReason};
use infermesh_network::NetworkError;
use infermesh_settlement::SettlementError;

use crate::NegotiationOutcome;

/// Why one negotiation attempt did not produce a winner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// The peer refused the offer
    Rejected(Option<RejectReason>),
    /// The peer answered with an error status
    PeerError(String),
    /// No answer within the request timeout
    TimedOut,
    /// Dial or transport failure
    Unreachable(String),
    /// Malformed or mismatched response
    ProtocolViolation(String),
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(Some(reason)) => write!(f, "rejected ({})", reason),
            Self::Rejected(None) => write!(f, "rejected"),
            Self::PeerError(msg) => write!(f, "error: {}", msg),
            Self::TimedOut => write!(f, "timed out"),
            Self::Unreachable(msg) => write!(f, "unreachable: {}", msg),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

/// One peer that was offered the job and did not take it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub peer_id: String,
    pub failure: AttemptFailure,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Not connected")]
    NotConnected,

    #[error("No peer accepted workload {workload} after {attempts} attempt(s)")]
    NoPeerAccepted {
        workload: String,
        attempts: u32,
        attempted: Vec<AttemptRecord>,
    },

    /// Negotiation succeeded but settlement failed and peer-only fallback
    /// was not enabled. The negotiated job is kept in `outcome`.
    #[error("Settlement failed after negotiation: {error}")]
    SettlementFailed {
        outcome: Box<NegotiationOutcome>,
        #[source]
        error: SettlementError,
    },

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Stream gap in job {job_id}: expected index {expected}")]
    StreamGap { job_id: String, expected: u64 },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Network(e) => e.category(),
            Self::NotConnected => FailureCategory::TransientNetwork,
            Self::NoPeerAccepted { .. } => FailureCategory::Exhaustion,
            Self::SettlementFailed { error, .. } | Self::Settlement(error) => error.category(),
            Self::StreamGap { .. } => FailureCategory::ProtocolViolation,
            Self::SessionNotFound(_) | Self::InvalidState(_) => FailureCategory::ProtocolViolation,
            Self::Archive(_) => FailureCategory::TransientNetwork,
            Self::Core(e) => e.category(),
            Self::Cancelled => FailureCategory::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
