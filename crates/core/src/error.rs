use std::fmt;

use thiserror::Error;

/// Failure classes every InferMesh error maps onto.
///
/// Callers branch on the category rather than on individual variants:
/// transient network failures are retried, refusals advance a negotiation
/// cascade, protocol violations are dropped and logged, conflicts resolve in
/// favour of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    /// Dial failure, connection reset, lookup timeout
    TransientNetwork,
    /// Peer explicitly rejected an offer
    PeerRefusal,
    /// Malformed or out-of-protocol message
    ProtocolViolation,
    /// Ledger submission failed
    SettlementFailure,
    /// Peer-reported and ledger-reported state disagree
    ConsistencyConflict,
    /// Every candidate or attempt was used up
    Exhaustion,
    /// Caller cancelled the operation
    Cancelled,
}

impl FailureCategory {
    /// Only transient network failures are worth retrying automatically
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork)
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TransientNetwork => "transient-network",
            Self::PeerRefusal => "peer-refusal",
            Self::ProtocolViolation => "protocol-violation",
            Self::SettlementFailure => "settlement-failure",
            Self::ConsistencyConflict => "consistency-conflict",
            Self::Exhaustion => "exhaustion",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Request id mismatch: expected {expected}, got {actual}")]
    RequestIdMismatch { expected: String, actual: String },

    #[error("Confirmed price {confirmed} exceeds offered price {offered}")]
    PriceAboveOffer { offered: u64, confirmed: u64 },

    #[error("Accepted response missing {0}")]
    MissingField(&'static str),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoreError {
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::InvalidConfig(_) => FailureCategory::Exhaustion,
            _ => FailureCategory::ProtocolViolation,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
