//! InferMesh Settlement
//!
//! Links negotiated jobs to the external ledger that settles them.
//!
//! ## Settlement Flow
//!
//! 1. **Negotiated**: a peer accepted the job. The job is registered with the
//!    [`ReconciliationBridge`] but is not final.
//! 2. **Submitted**: the ledger accepted the transaction and assigned a
//!    ledger job id. Confirmations accumulate as blocks are produced.
//! 3. **Confirmed**: confirmations reached the required depth. A reorg
//!    sends the job back to Submitted with zero confirmations.
//! 4. **PeerOnly**: submission failed and the caller kept the job off-chain.
//!
//! Ledger-reported status always wins over peer-reported status; every
//! disagreement is published as a conflict event.

mod bridge;
mod ledger;
mod rpc;
mod types;

pub use bridge::ReconciliationBridge;
pub use ledger::{Ledger, MockLedger};
pub use rpc::{spawn_event_poller, RpcLedger};
pub use types::*;

use std::sync::Arc;

use infermesh_core::{FailureCategory, LedgerMode, SettlementSettings};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Ledger job not found: {0}")]
    JobNotFound(u64),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Job {0} has not been submitted")]
    NotSubmitted(String),

    #[error("Submission gave up after {attempts} attempt(s): {last_error}")]
    SubmissionExhausted { attempts: u32, last_error: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl SettlementError {
    /// Whether resubmitting may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RpcError(_) | Self::Unavailable(_) | Self::TransactionFailed(_)
        )
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Cancelled => FailureCategory::Cancelled,
            Self::SerializationError(_) => FailureCategory::ProtocolViolation,
            _ => FailureCategory::SettlementFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, SettlementError>;

/// Construct the ledger named by the settings.
///
/// In RPC mode the event poller is started and stops with `cancel`.
pub fn ledger_from_settings(
    settings: &SettlementSettings,
    cancel: &CancellationToken,
) -> Result<Arc<dyn Ledger>> {
    match settings.mode {
        LedgerMode::Mock => Ok(Arc::new(MockLedger::new())),
        LedgerMode::Rpc => {
            let ledger = Arc::new(RpcLedger::new(&settings.rpc_url)?);
            spawn_event_poller(ledger.clone(), settings.event_poll_interval(), cancel.clone());
            Ok(ledger)
        }
    }
}
