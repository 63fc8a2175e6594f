//! Reconciliation bridge
//!
//! Owns the registry of negotiated jobs and their ledger mappings. Every
//! status change goes through here so peer-reported and ledger-reported
//! state can be compared in one place. Conflicts are resolved toward the
//! ledger and always published.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use infermesh_core::{now_millis, retry_with_backoff_if, JobStatus, RetryError, SettlementSettings};

use crate::{
    BlockRange, BridgeEvent, ConflictEvent, JobMapping, Ledger, LedgerEvent, LedgerJobId,
    NegotiatedJob, Result, SettlementError, SettlementPhase, TrackedJob,
};

const BRIDGE_EVENT_CAPACITY: usize = 256;

pub struct ReconciliationBridge {
    ledger: Arc<dyn Ledger>,
    settings: SettlementSettings,
    jobs: DashMap<String, TrackedJob>,
    by_ledger_id: DashMap<LedgerJobId, String>,
    /// Serializes submissions per negotiation id
    submit_locks: DashMap<String, Arc<Mutex<()>>>,
    events: broadcast::Sender<BridgeEvent>,
}

impl ReconciliationBridge {
    pub fn new(ledger: Arc<dyn Ledger>, settings: SettlementSettings) -> Self {
        let (events, _) = broadcast::channel(BRIDGE_EVENT_CAPACITY);
        Self {
            ledger,
            settings,
            jobs: DashMap::new(),
            by_ledger_id: DashMap::new(),
            submit_locks: DashMap::new(),
            events,
        }
    }

    pub fn settings(&self) -> &SettlementSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    /// Track a job a peer agreed to. Registering twice keeps the first.
    pub fn register_negotiated(&self, job: NegotiatedJob) -> TrackedJob {
        self.jobs
            .entry(job.negotiation_id.clone())
            .or_insert_with(|| {
                debug!("Tracking negotiated job {} with {}", job.negotiation_id, job.peer_id);
                TrackedJob::new(job)
            })
            .clone()
    }

    pub fn job(&self, negotiation_id: &str) -> Option<TrackedJob> {
        self.jobs.get(negotiation_id).map(|j| j.clone())
    }

    pub fn jobs(&self) -> Vec<TrackedJob> {
        self.jobs.iter().map(|j| j.clone()).collect()
    }

    pub fn mapping(&self, negotiation_id: &str) -> Option<JobMapping> {
        self.jobs.get(negotiation_id).and_then(|j| j.mapping.clone())
    }

    /// Negotiation id for a ledger job id
    pub fn negotiation_for(&self, ledger_job_id: LedgerJobId) -> Option<String> {
        self.by_ledger_id.get(&ledger_job_id).map(|id| id.clone())
    }

    fn phase_for(&self, confirmations: u64) -> SettlementPhase {
        if confirmations >= self.settings.required_confirmations {
            SettlementPhase::Confirmed
        } else {
            SettlementPhase::Submitted { confirmations }
        }
    }

    /// Submit a registered job, retrying with backoff up to `attempts` times.
    ///
    /// A job that already has a mapping returns it without resubmitting.
    /// Concurrent calls for one job wait for the submission in flight.
    pub async fn submit_to_ledger(
        &self,
        negotiation_id: &str,
        attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<JobMapping> {
        if let Some(mapping) = self.existing_mapping(negotiation_id)? {
            return Ok(mapping);
        }

        let lock = self
            .submit_locks
            .entry(negotiation_id.to_string())
            .or_default()
            .clone();
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(SettlementError::Cancelled),
            guard = lock.lock() => guard,
        };
        if let Some(mapping) = self.existing_mapping(negotiation_id)? {
            debug!("Job {} was submitted concurrently", negotiation_id);
            return Ok(mapping);
        }
        self.submit_locked(negotiation_id, attempts, cancel).await
    }

    fn existing_mapping(&self, negotiation_id: &str) -> Result<Option<JobMapping>> {
        self.jobs
            .get(negotiation_id)
            .map(|tracked| tracked.mapping.clone())
            .ok_or_else(|| SettlementError::UnknownJob(negotiation_id.to_string()))
    }

    async fn submit_locked(
        &self,
        negotiation_id: &str,
        attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<JobMapping> {
        let job = {
            let tracked = self
                .jobs
                .get(negotiation_id)
                .ok_or_else(|| SettlementError::UnknownJob(negotiation_id.to_string()))?;
            if let Some(mapping) = &tracked.mapping {
                return Ok(mapping.clone());
            }
            tracked.job.clone()
        };

        let policy = self.settings.submit_backoff(attempts.max(1));
        let ledger = self.ledger.clone();
        let result = retry_with_backoff_if(
            &policy,
            cancel,
            |attempt| {
                let ledger = ledger.clone();
                let job = job.clone();
                async move {
                    debug!("Submitting job {} (attempt {})", job.negotiation_id, attempt);
                    ledger.submit_job(&job).await
                }
            },
            SettlementError::is_retryable,
        )
        .await;

        let receipt = match result {
            Ok(receipt) => receipt,
            Err(RetryError::Cancelled { .. }) => return Err(SettlementError::Cancelled),
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                warn!(
                    "Submission of job {} failed after {} attempt(s): {}",
                    negotiation_id, attempts, last_error
                );
                return Err(SettlementError::SubmissionExhausted {
                    attempts,
                    last_error: last_error.to_string(),
                });
            }
        };

        let mapping = JobMapping {
            negotiation_id: negotiation_id.to_string(),
            ledger_job_id: receipt.ledger_job_id,
            peer_id: job.peer_id.clone(),
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
        };

        {
            let mut tracked = self
                .jobs
                .get_mut(negotiation_id)
                .ok_or_else(|| SettlementError::UnknownJob(negotiation_id.to_string()))?;
            tracked.mapping = Some(mapping.clone());
            tracked.phase = self.phase_for(0);
            tracked.updated_at = now_millis();
        }
        self.by_ledger_id
            .insert(mapping.ledger_job_id, negotiation_id.to_string());

        info!(
            "Job {} submitted as ledger job {} ({})",
            negotiation_id, mapping.ledger_job_id, mapping.transaction_hash
        );
        self.emit(BridgeEvent::Submitted(mapping.clone()));
        Ok(mapping)
    }

    /// Keep a job off-chain after its submission failed
    pub fn mark_peer_only(&self, negotiation_id: &str, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        {
            let mut tracked = self
                .jobs
                .get_mut(negotiation_id)
                .ok_or_else(|| SettlementError::UnknownJob(negotiation_id.to_string()))?;
            tracked.phase = SettlementPhase::PeerOnly;
            tracked.updated_at = now_millis();
        }
        warn!("Job {} continues peer-only: {}", negotiation_id, reason);
        self.emit(BridgeEvent::PeerOnly {
            negotiation_id: negotiation_id.to_string(),
            reason,
        });
        Ok(())
    }

    /// Record the status a peer claims for a job. Provisional until synced.
    pub fn report_peer_status(&self, negotiation_id: &str, status: JobStatus) -> Result<()> {
        let mut tracked = self
            .jobs
            .get_mut(negotiation_id)
            .ok_or_else(|| SettlementError::UnknownJob(negotiation_id.to_string()))?;
        tracked.peer_status = Some(status);
        tracked.updated_at = now_millis();
        debug!("Peer reports job {} as {}", negotiation_id, status);
        Ok(())
    }

    /// Apply a ledger status to a tracked job, reporting any disagreement
    fn apply_ledger_status(&self, tracked: &mut TrackedJob, status: JobStatus) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        let negotiation_id = tracked.job.negotiation_id.clone();

        if let Some(peer_status) = tracked.peer_status {
            if peer_status != status {
                warn!(
                    "Job {}: peer reports {} but ledger reports {}, keeping ledger",
                    negotiation_id, peer_status, status
                );
                events.push(BridgeEvent::Conflict(ConflictEvent {
                    negotiation_id: negotiation_id.clone(),
                    peer_status,
                    ledger_status: status,
                }));
                tracked.peer_status = Some(status);
            }
        }

        if tracked.ledger_status != Some(status) {
            tracked.ledger_status = Some(status);
            events.push(BridgeEvent::StatusChanged {
                negotiation_id,
                status,
            });
        }
        tracked.updated_at = now_millis();
        events
    }

    /// Compare peer and ledger state for a job; the ledger wins.
    ///
    /// Jobs that never reached the ledger report their provisional status.
    pub async fn sync_state(&self, negotiation_id: &str) -> Result<JobStatus> {
        let ledger_job_id = {
            let tracked = self
                .jobs
                .get(negotiation_id)
                .ok_or_else(|| SettlementError::UnknownJob(negotiation_id.to_string()))?;
            match &tracked.mapping {
                Some(mapping) => mapping.ledger_job_id,
                None => return Ok(tracked.status()),
            }
        };

        let state = self.ledger.job_state(ledger_job_id).await?;

        let events = {
            let mut tracked = self
                .jobs
                .get_mut(negotiation_id)
                .ok_or_else(|| SettlementError::UnknownJob(negotiation_id.to_string()))?;
            let mut events = self.apply_ledger_status(&mut tracked, state.status);

            let was_final = tracked.phase.is_final();
            tracked.phase = self.phase_for(state.confirmations);
            if tracked.phase.is_final() && !was_final {
                events.push(BridgeEvent::Confirmed {
                    negotiation_id: negotiation_id.to_string(),
                    confirmations: state.confirmations,
                });
            }
            if let (Some(block), Some(mapping)) = (state.block_number, tracked.mapping.as_mut()) {
                mapping.block_number = block;
            }
            events
        };

        for event in events {
            self.emit(event);
        }
        Ok(state.status)
    }

    /// Reset confirmations of jobs hit by a reorg.
    ///
    /// Affected jobs are the ones named plus any whose inclusion block lies
    /// in `range`. They return to submitted with zero confirmations; the
    /// negotiation is kept. Returns the ids that were reset.
    pub fn handle_reorg(&self, range: BlockRange, affected_job_ids: &[String]) -> Vec<String> {
        let mut reset = Vec::new();
        for mut entry in self.jobs.iter_mut() {
            let tracked = entry.value_mut();
            let named = affected_job_ids.contains(&tracked.job.negotiation_id);
            let in_range = tracked
                .mapping
                .as_ref()
                .map(|m| range.contains(m.block_number))
                .unwrap_or(false);
            if !(named || in_range) || !tracked.phase.is_on_ledger() {
                continue;
            }
            tracked.phase = SettlementPhase::Submitted { confirmations: 0 };
            tracked.updated_at = now_millis();
            reset.push(tracked.job.negotiation_id.clone());
        }
        reset.sort();

        for negotiation_id in &reset {
            warn!(
                "Reorg of blocks {}..={} reset confirmations of job {}",
                range.start, range.end, negotiation_id
            );
            self.emit(BridgeEvent::Reorged {
                negotiation_id: negotiation_id.clone(),
                range,
            });
        }
        reset
    }

    /// Apply a ledger lifecycle event.
    ///
    /// Events for unknown ledger ids are ignored. Once the ledger reported a
    /// terminal status, later non-terminal events are stale and dropped.
    pub fn apply_ledger_event(&self, event: &LedgerEvent) {
        let Some(negotiation_id) = self.negotiation_for(event.ledger_job_id) else {
            debug!("Ignoring event for untracked ledger job {}", event.ledger_job_id);
            return;
        };

        let events = {
            let Some(mut tracked) = self.jobs.get_mut(&negotiation_id) else {
                return;
            };
            let status = event.kind.status();
            if tracked.ledger_status.map(|s| s.is_terminal()).unwrap_or(false) && !status.is_terminal() {
                debug!("Dropping stale {:?} event for job {}", event.kind, negotiation_id);
                return;
            }
            self.apply_ledger_status(&mut tracked, status)
        };

        for event in events {
            self.emit(event);
        }
    }

    /// Apply ledger events as they arrive until cancelled
    pub fn spawn_event_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let bridge = self.clone();
        let mut events = self.ledger.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => bridge.apply_ledger_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Bridge lagged behind ledger, skipped {} event(s)", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Bridge event listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LedgerEventKind, MockLedger};
    use std::time::Duration;

    fn job(id: &str) -> NegotiatedJob {
        NegotiatedJob {
            negotiation_id: id.to_string(),
            peer_id: "peer-a".to_string(),
            requester: "me".to_string(),
            workload: "llama-3-8b".to_string(),
            price: 100,
            estimated_time_ms: 1000,
        }
    }

    fn settings() -> SettlementSettings {
        SettlementSettings {
            required_confirmations: 3,
            base_delay_ms: 100,
            ..Default::default()
        }
    }

    fn bridge() -> (Arc<MockLedger>, Arc<ReconciliationBridge>) {
        let ledger = Arc::new(MockLedger::new());
        let bridge = Arc::new(ReconciliationBridge::new(ledger.clone(), settings()));
        (ledger, bridge)
    }

    #[tokio::test]
    async fn test_submit_creates_mapping() {
        let (_ledger, bridge) = bridge();
        bridge.register_negotiated(job("neg-1"));
        assert_eq!(bridge.job("neg-1").unwrap().phase, SettlementPhase::Negotiated);

        let mut events = bridge.subscribe();
        let mapping = bridge
            .submit_to_ledger("neg-1", 3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(mapping.ledger_job_id, 1);
        assert_eq!(mapping.peer_id, "peer-a");
        assert_eq!(
            bridge.job("neg-1").unwrap().phase,
            SettlementPhase::Submitted { confirmations: 0 }
        );
        assert_eq!(bridge.negotiation_for(1).as_deref(), Some("neg-1"));
        assert!(matches!(events.recv().await.unwrap(), BridgeEvent::Submitted(_)));

        // Resubmitting is idempotent
        let again = bridge
            .submit_to_ledger("neg-1", 3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again, mapping);
    }

    /// Ledger that takes a while to include each submission
    struct SlowLedger {
        inner: MockLedger,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl Ledger for SlowLedger {
        async fn submit_job(&self, job: &NegotiatedJob) -> Result<crate::LedgerReceipt> {
            tokio::time::sleep(self.delay).await;
            self.inner.submit_job(job).await
        }

        async fn job_state(&self, ledger_job_id: LedgerJobId) -> Result<crate::LedgerJobState> {
            self.inner.job_state(ledger_job_id).await
        }

        fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
            self.inner.subscribe()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_submits_reach_ledger_once() {
        let ledger = Arc::new(SlowLedger {
            inner: MockLedger::new(),
            delay: Duration::from_millis(50),
        });
        let bridge = ReconciliationBridge::new(ledger.clone(), settings());
        bridge.register_negotiated(job("neg-1"));

        let cancel = CancellationToken::new();
        let (first, second) = tokio::join!(
            bridge.submit_to_ledger("neg-1", 1, &cancel),
            bridge.submit_to_ledger("neg-1", 1, &cancel),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(ledger.inner.submissions(), 1);
        assert_eq!(first, second);
        assert_eq!(bridge.mapping("neg-1"), Some(first.clone()));
        assert_eq!(bridge.negotiation_for(first.ledger_job_id).as_deref(), Some("neg-1"));
        assert_eq!(bridge.negotiation_for(first.ledger_job_id + 1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_retries_then_succeeds() {
        let (ledger, bridge) = bridge();
        ledger.fail_next_submissions(2);
        bridge.register_negotiated(job("neg-1"));
        let mapping = bridge
            .submit_to_ledger("neg-1", 3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ledger.submissions(), 3);
        assert_eq!(mapping.negotiation_id, "neg-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_exhausts_and_stays_negotiated() {
        let (ledger, bridge) = bridge();
        ledger.set_failing(true);
        bridge.register_negotiated(job("neg-1"));
        let err = bridge
            .submit_to_ledger("neg-1", 2, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::SubmissionExhausted { attempts: 2, .. }));
        assert_eq!(ledger.submissions(), 2);

        let tracked = bridge.job("neg-1").unwrap();
        assert_eq!(tracked.phase, SettlementPhase::Negotiated);
        assert!(tracked.mapping.is_none());

        bridge.mark_peer_only("neg-1", err.to_string()).unwrap();
        assert_eq!(bridge.job("neg-1").unwrap().phase, SettlementPhase::PeerOnly);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_cancelled() {
        let (ledger, bridge) = bridge();
        ledger.set_failing(true);
        bridge.register_negotiated(job("neg-1"));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = bridge.submit_to_ledger("neg-1", 5, &cancel).await.unwrap_err();
        assert_eq!(err, SettlementError::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (_ledger, bridge) = bridge();
        assert!(matches!(
            bridge.submit_to_ledger("nope", 1, &CancellationToken::new()).await,
            Err(SettlementError::UnknownJob(_))
        ));
        assert!(bridge.report_peer_status("nope", JobStatus::Completed).is_err());
    }

    #[tokio::test]
    async fn test_sync_ledger_wins_with_one_conflict() {
        let (ledger, bridge) = bridge();
        bridge.register_negotiated(job("neg-1"));
        let mapping = bridge
            .submit_to_ledger("neg-1", 1, &CancellationToken::new())
            .await
            .unwrap();
        ledger.set_status(mapping.ledger_job_id, JobStatus::Processing).unwrap();
        bridge.report_peer_status("neg-1", JobStatus::Completed).unwrap();

        let mut events = bridge.subscribe();
        assert_eq!(bridge.sync_state("neg-1").await.unwrap(), JobStatus::Processing);
        assert_eq!(bridge.job("neg-1").unwrap().status(), JobStatus::Processing);
        // A second sync finds nothing to reconcile
        bridge.sync_state("neg-1").await.unwrap();

        let mut conflicts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let BridgeEvent::Conflict(conflict) = event {
                conflicts.push(conflict);
            }
        }
        assert_eq!(
            conflicts,
            vec![ConflictEvent {
                negotiation_id: "neg-1".to_string(),
                peer_status: JobStatus::Completed,
                ledger_status: JobStatus::Processing,
            }]
        );
    }

    #[tokio::test]
    async fn test_sync_without_mapping_is_provisional() {
        let (_ledger, bridge) = bridge();
        bridge.register_negotiated(job("neg-1"));
        bridge.report_peer_status("neg-1", JobStatus::Processing).unwrap();
        assert_eq!(bridge.sync_state("neg-1").await.unwrap(), JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_confirmations_reach_final_then_reorg() {
        let (ledger, bridge) = bridge();
        bridge.register_negotiated(job("neg-1"));
        bridge.register_negotiated(job("neg-2"));
        let first = bridge
            .submit_to_ledger("neg-1", 1, &CancellationToken::new())
            .await
            .unwrap();
        let second = bridge
            .submit_to_ledger("neg-2", 1, &CancellationToken::new())
            .await
            .unwrap();

        ledger.advance_blocks(5);
        bridge.sync_state("neg-1").await.unwrap();
        bridge.sync_state("neg-2").await.unwrap();
        assert_eq!(bridge.job("neg-1").unwrap().phase, SettlementPhase::Confirmed);

        // neg-2 is caught by its inclusion block, neg-1 by name
        let range = BlockRange::new(second.block_number, second.block_number + 10);
        let reset = bridge.handle_reorg(range, &["neg-1".to_string()]);
        assert_eq!(reset, vec!["neg-1".to_string(), "neg-2".to_string()]);
        for id in ["neg-1", "neg-2"] {
            let tracked = bridge.job(id).unwrap();
            assert_eq!(tracked.phase, SettlementPhase::Submitted { confirmations: 0 });
            assert!(tracked.mapping.is_some());
        }
        assert!(first.block_number < second.block_number);
    }

    #[tokio::test]
    async fn test_reorg_skips_jobs_not_on_ledger() {
        let (_ledger, bridge) = bridge();
        bridge.register_negotiated(job("neg-1"));
        let reset = bridge.handle_reorg(BlockRange::new(0, 100), &["neg-1".to_string()]);
        assert!(reset.is_empty());
        assert_eq!(bridge.job("neg-1").unwrap().phase, SettlementPhase::Negotiated);
    }

    #[tokio::test]
    async fn test_event_listener_applies_ledger_events() {
        let (ledger, bridge) = bridge();
        bridge.register_negotiated(job("neg-1"));
        let mapping = bridge
            .submit_to_ledger("neg-1", 1, &CancellationToken::new())
            .await
            .unwrap();
        bridge.report_peer_status("neg-1", JobStatus::Processing).unwrap();

        let cancel = CancellationToken::new();
        let listener = bridge.spawn_event_listener(cancel.clone());
        let mut events = bridge.subscribe();
        ledger.emit(mapping.ledger_job_id, LedgerEventKind::Completed).unwrap();

        let mut saw_conflict = false;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                BridgeEvent::Conflict(c) => {
                    assert_eq!(c.ledger_status, JobStatus::Completed);
                    saw_conflict = true;
                }
                BridgeEvent::StatusChanged { status, .. } => {
                    assert_eq!(status, JobStatus::Completed);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_conflict);
        assert_eq!(bridge.job("neg-1").unwrap().status(), JobStatus::Completed);

        cancel.cancel();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_event_after_terminal_dropped() {
        let (_ledger, bridge) = bridge();
        bridge.register_negotiated(job("neg-1"));
        let mapping = bridge
            .submit_to_ledger("neg-1", 1, &CancellationToken::new())
            .await
            .unwrap();
        let event = |kind| LedgerEvent {
            ledger_job_id: mapping.ledger_job_id,
            kind,
            block_number: 10,
        };
        bridge.apply_ledger_event(&event(LedgerEventKind::Failed));
        bridge.apply_ledger_event(&event(LedgerEventKind::Claimed));
        assert_eq!(bridge.job("neg-1").unwrap().status(), JobStatus::Failed);
    }
}
