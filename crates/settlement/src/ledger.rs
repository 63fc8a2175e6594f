//! Ledger interface and the in-memory mock
//!
//! The bridge treats the ledger as authoritative and never interprets
//! transaction internals: it only submits jobs, reads job state and
//! listens for lifecycle events.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, info};

use infermesh_core::JobStatus;

use crate::{
    LedgerEvent, LedgerEventKind, LedgerJobId, LedgerJobState, LedgerReceipt, NegotiatedJob,
    Result, SettlementError,
};

/// Capacity of ledger event broadcast channels
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait Ledger: Send + Sync + 'static {
    /// Submit a negotiated job, returning the transaction hash and ledger id
    async fn submit_job(&self, job: &NegotiatedJob) -> Result<LedgerReceipt>;

    /// Current on-chain state of a job
    async fn job_state(&self, ledger_job_id: LedgerJobId) -> Result<LedgerJobState>;

    /// Job lifecycle events (claimed, completed, failed).
    ///
    /// Only events emitted after subscribing are received.
    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent>;
}

#[derive(Debug, Clone)]
struct MockJob {
    job: NegotiatedJob,
    status: JobStatus,
    confirmations: u64,
    block_number: u64,
}

#[derive(Debug, Default)]
struct MockState {
    jobs: HashMap<LedgerJobId, MockJob>,
    next_job_id: LedgerJobId,
    block_number: u64,
    /// Submissions to fail before succeeding again
    fail_next: u32,
    fail_always: bool,
    submissions: u32,
}

/// In-memory ledger with deterministic transaction hashes.
///
/// Every successful submission is included in a new block. Confirmations
/// only grow through [`MockLedger::advance_blocks`].
pub struct MockLedger {
    state: Mutex<MockState>,
    events: broadcast::Sender<LedgerEvent>,
}

impl MockLedger {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MockState {
                next_job_id: 1,
                ..Default::default()
            }),
            events,
        }
    }

    /// Fail the next `count` submissions with a retryable error
    pub fn fail_next_submissions(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    /// Fail every submission until turned off
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().fail_always = failing;
    }

    /// Submission calls received, failed ones included
    pub fn submissions(&self) -> u32 {
        self.state.lock().submissions
    }

    pub fn block_number(&self) -> u64 {
        self.state.lock().block_number
    }

    /// Produce `count` blocks, adding confirmations to every job
    pub fn advance_blocks(&self, count: u64) {
        let mut state = self.state.lock();
        state.block_number += count;
        for job in state.jobs.values_mut() {
            job.confirmations += count;
        }
    }

    /// Overwrite a job's status without emitting an event
    pub fn set_status(&self, ledger_job_id: LedgerJobId, status: JobStatus) -> Result<()> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&ledger_job_id)
            .ok_or(SettlementError::JobNotFound(ledger_job_id))?;
        job.status = status;
        Ok(())
    }

    /// Drop confirmations of jobs included at or after `from_block`
    pub fn reorg(&self, from_block: u64) -> Vec<LedgerJobId> {
        let mut state = self.state.lock();
        let mut affected = Vec::new();
        for (id, job) in state.jobs.iter_mut() {
            if job.block_number >= from_block {
                job.confirmations = 0;
                affected.push(*id);
            }
        }
        affected.sort_unstable();
        affected
    }

    /// Update a job's status and broadcast the matching event
    pub fn emit(&self, ledger_job_id: LedgerJobId, kind: LedgerEventKind) -> Result<()> {
        let block_number = {
            let mut state = self.state.lock();
            let block_number = state.block_number;
            let job = state
                .jobs
                .get_mut(&ledger_job_id)
                .ok_or(SettlementError::JobNotFound(ledger_job_id))?;
            job.status = kind.status();
            block_number
        };
        let _ = self.events.send(LedgerEvent {
            ledger_job_id,
            kind,
            block_number,
        });
        Ok(())
    }

    /// The job submitted under a ledger id
    pub fn submitted_job(&self, ledger_job_id: LedgerJobId) -> Option<NegotiatedJob> {
        self.state
            .lock()
            .jobs
            .get(&ledger_job_id)
            .map(|j| j.job.clone())
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn mock_transaction_hash(job: &NegotiatedJob, ledger_job_id: LedgerJobId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job.negotiation_id.as_bytes());
    hasher.update(job.peer_id.as_bytes());
    hasher.update(ledger_job_id.to_be_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

#[async_trait]
impl Ledger for MockLedger {
    async fn submit_job(&self, job: &NegotiatedJob) -> Result<LedgerReceipt> {
        let mut state = self.state.lock();
        state.submissions += 1;

        if state.fail_always {
            return Err(SettlementError::Unavailable("mock ledger failing".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SettlementError::TransactionFailed(
                "mock submission failure".to_string(),
            ));
        }

        let ledger_job_id = state.next_job_id;
        state.next_job_id += 1;
        state.block_number += 1;
        let block_number = state.block_number;
        state.jobs.insert(
            ledger_job_id,
            MockJob {
                job: job.clone(),
                status: JobStatus::Pending,
                confirmations: 0,
                block_number,
            },
        );

        let transaction_hash = mock_transaction_hash(job, ledger_job_id);
        info!(
            "[MOCK] Job {} settled as ledger job {} in block {}",
            job.negotiation_id, ledger_job_id, block_number
        );
        Ok(LedgerReceipt {
            transaction_hash,
            ledger_job_id,
            block_number,
        })
    }

    async fn job_state(&self, ledger_job_id: LedgerJobId) -> Result<LedgerJobState> {
        let state = self.state.lock();
        let job = state
            .jobs
            .get(&ledger_job_id)
            .ok_or(SettlementError::JobNotFound(ledger_job_id))?;
        debug!(
            "[MOCK] Ledger job {} is {} with {} confirmations",
            ledger_job_id, job.status, job.confirmations
        );
        Ok(LedgerJobState {
            ledger_job_id,
            status: job.status,
            confirmations: job.confirmations,
            block_number: Some(job.block_number),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }
}
