//! Settlement types shared by the ledgers and the bridge

use serde::{Deserialize, Serialize};

use infermesh_core::{now_millis, JobStatus};

/// Identifier the ledger assigns to a submitted job
pub type LedgerJobId = u64;

/// A job a peer agreed to, as handed to the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiatedJob {
    /// Internal negotiation id (the accepted offer's request id)
    pub negotiation_id: String,
    pub peer_id: String,
    pub requester: String,
    pub workload: String,
    /// Confirmed total price
    pub price: u64,
    pub estimated_time_ms: u64,
}

/// What the ledger returns for an accepted submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerReceipt {
    pub transaction_hash: String,
    pub ledger_job_id: LedgerJobId,
    /// Block the transaction was included in
    pub block_number: u64,
}

/// Current on-chain view of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerJobState {
    pub ledger_job_id: LedgerJobId,
    pub status: JobStatus,
    pub confirmations: u64,
    #[serde(default)]
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerEventKind {
    Claimed,
    Completed,
    Failed,
}

impl LedgerEventKind {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Claimed => JobStatus::Claimed,
            Self::Completed => JobStatus::Completed,
            Self::Failed => JobStatus::Failed,
        }
    }
}

/// Job lifecycle event emitted by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEvent {
    pub ledger_job_id: LedgerJobId,
    pub kind: LedgerEventKind,
    pub block_number: u64,
}

/// Link between a negotiation and its ledger record.
///
/// Exists only once a submission succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMapping {
    pub negotiation_id: String,
    pub ledger_job_id: LedgerJobId,
    pub peer_id: String,
    pub transaction_hash: String,
    /// Inclusion block, used to find jobs hit by a reorg
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum SettlementPhase {
    /// Agreed with a peer, not on the ledger; never final
    Negotiated,
    /// On the ledger, awaiting confirmations
    Submitted { confirmations: u64 },
    /// Reached the required confirmation depth
    Confirmed,
    /// Chain submission failed; the job continues off-chain
    PeerOnly,
}

impl SettlementPhase {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Confirmed)
    }

    pub fn is_on_ledger(&self) -> bool {
        matches!(self, Self::Submitted { .. } | Self::Confirmed)
    }
}

/// A job in the bridge's registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedJob {
    pub job: NegotiatedJob,
    pub phase: SettlementPhase,
    pub mapping: Option<JobMapping>,
    /// Provisional status reported by the peer
    pub peer_status: Option<JobStatus>,
    /// Authoritative status reported by the ledger
    pub ledger_status: Option<JobStatus>,
    pub updated_at: u64,
}

impl TrackedJob {
    pub fn new(job: NegotiatedJob) -> Self {
        Self {
            job,
            phase: SettlementPhase::Negotiated,
            mapping: None,
            peer_status: None,
            ledger_status: None,
            updated_at: now_millis(),
        }
    }

    /// Externally observed status: the ledger's when known, else the peer's
    pub fn status(&self) -> JobStatus {
        self.ledger_status
            .or(self.peer_status)
            .unwrap_or(JobStatus::Pending)
    }
}

/// Inclusive block range removed by a reorg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, block: u64) -> bool {
        self.start <= block && block <= self.end
    }
}

/// Peer and ledger disagreed; the ledger value was kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEvent {
    pub negotiation_id: String,
    pub peer_status: JobStatus,
    pub ledger_status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Submitted(JobMapping),
    Confirmed {
        negotiation_id: String,
        confirmations: u64,
    },
    StatusChanged {
        negotiation_id: String,
        status: JobStatus,
    },
    Conflict(ConflictEvent),
    Reorged {
        negotiation_id: String,
        range: BlockRange,
    },
    PeerOnly {
        negotiation_id: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> NegotiatedJob {
        NegotiatedJob {
            negotiation_id: "neg-1".to_string(),
            peer_id: "peer".to_string(),
            requester: "me".to_string(),
            workload: "llama-3-8b".to_string(),
            price: 100,
            estimated_time_ms: 2000,
        }
    }

    #[test]
    fn test_ledger_status_wins_for_observed_status() {
        let mut tracked = TrackedJob::new(job());
        assert_eq!(tracked.status(), JobStatus::Pending);
        tracked.peer_status = Some(JobStatus::Completed);
        assert_eq!(tracked.status(), JobStatus::Completed);
        tracked.ledger_status = Some(JobStatus::Processing);
        assert_eq!(tracked.status(), JobStatus::Processing);
    }

    #[test]
    fn test_phases() {
        assert!(!SettlementPhase::Negotiated.is_final());
        assert!(!SettlementPhase::Submitted { confirmations: 9 }.is_final());
        assert!(SettlementPhase::Confirmed.is_final());
        assert!(!SettlementPhase::PeerOnly.is_on_ledger());
    }

    #[test]
    fn test_block_range_inclusive() {
        let range = BlockRange::new(10, 12);
        assert!(range.contains(10));
        assert!(range.contains(12));
        assert!(!range.contains(13));
    }

    #[test]
    fn test_ledger_event_wire_format() {
        let event: LedgerEvent = serde_json::from_str(
            r#"{"ledgerJobId":7,"kind":"completed","blockNumber":120}"#,
        )
        .unwrap();
        assert_eq!(event.kind.status(), JobStatus::Completed);
        assert_eq!(event.ledger_job_id, 7);
    }
}
