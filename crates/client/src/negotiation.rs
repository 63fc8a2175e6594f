//! Negotiation engine
//!
//! Sends job offers to candidate peers and picks the one that does the job.
//!
//! - **Cascading**: one candidate at a time in discovery order, each under
//!   its own request timeout. The first acceptance wins. Rejections, errors
//!   and timeouts move on to the next candidate.
//! - **Parallel**: every candidate at once under a shared deadline. The
//!   acceptance with the lowest `price / estimated_time` wins, ties going to
//!   the earlier candidate. Responses arriving after the deadline are
//!   discarded.
//!
//! Every offer is registered as outstanding until its response is matched.
//! A response with no outstanding offer is dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use infermesh_core::{
    retry_with_backoff_if, BackoffPolicy, JobOffer, JobOfferResponse, NegotiationMode,
    NegotiationSettings, OfferStatus, PeerRecord, RetryError,
};
use infermesh_network::{NetworkError, PeerNetwork};
use infermesh_settlement::{JobMapping, NegotiatedJob, ReconciliationBridge, SettlementError};

use crate::{AttemptFailure, AttemptRecord, ClientError, ReliabilityTracker, Result};

/// What the requester wants done, minus the per-offer request id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferTemplate {
    pub workload: String,
    pub payload: String,
    pub resource_limit: u64,
    /// Total price ceiling
    pub offered_price: u64,
}

impl OfferTemplate {
    pub fn new(workload: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            workload: workload.into(),
            payload: payload.into(),
            resource_limit: 256,
            offered_price: 0,
        }
    }

    pub fn resource_limit(mut self, units: u64) -> Self {
        self.resource_limit = units;
        self
    }

    pub fn offered_price(mut self, price: u64) -> Self {
        self.offered_price = price;
        self
    }

    /// A fresh offer with its own request id
    pub fn to_offer(&self, requester: &str) -> JobOffer {
        JobOffer::new(
            requester,
            &self.workload,
            &self.payload,
            self.resource_limit,
            self.offered_price,
        )
    }
}

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct NegotiateOptions {
    pub mode: Option<NegotiationMode>,
    pub max_attempts: Option<usize>,
    /// Hand the winning job to the reconciliation bridge
    pub settle: bool,
    /// Ledger submission attempts; the settlement default when `None`
    pub settlement_attempts: Option<u32>,
    /// Keep the job peer-only if submission fails; the settlement default
    /// when `None`
    pub peer_only_fallback: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    Settled(JobMapping),
    PeerOnly { reason: String },
}

/// Result of a successful negotiation
#[derive(Debug, Clone)]
pub struct NegotiationOutcome {
    pub selected_peer: PeerRecord,
    pub response: JobOfferResponse,
    /// The offer the selected peer accepted
    pub offer: JobOffer,
    /// Offers sent, the winning one included
    pub attempts: u32,
    /// Candidates that did not win, in candidate order
    pub attempted: Vec<AttemptRecord>,
    /// Offer round trip to the selected peer
    pub latency_ms: u64,
    pub settlement: Option<SettlementOutcome>,
}

impl NegotiationOutcome {
    /// Job id shared by the stream session and the bridge
    pub fn job_id(&self) -> &str {
        &self.offer.request_id
    }

    pub fn confirmed_price(&self) -> u64 {
        self.response.confirmed_price.unwrap_or(self.offer.offered_price)
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.settlement, Some(SettlementOutcome::Settled(_)))
    }
}

#[derive(Debug, Clone)]
struct OutstandingOffer {
    peer_id: String,
    sent_at: Instant,
}

/// Removes an offer from the outstanding registry when dropped
struct OutstandingGuard<'a> {
    registry: &'a DashMap<String, OutstandingOffer>,
    request_id: String,
}

impl Drop for OutstandingGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.request_id);
    }
}

/// One candidate's result that did not produce a winner
#[derive(Error, Debug)]
enum AttemptError {
    #[error("{}: {}", .0.peer_id, .0.failure)]
    Failed(AttemptRecord),
    /// Stops the whole negotiation
    #[error(transparent)]
    Fatal(ClientError),
}

struct Accepted {
    peer: PeerRecord,
    offer: JobOffer,
    response: JobOfferResponse,
    latency_ms: u64,
}

struct ParallelReply {
    index: usize,
    result: std::result::Result<JobOfferResponse, NetworkError>,
    elapsed_ms: u64,
}

pub struct NegotiationEngine {
    network: Arc<dyn PeerNetwork>,
    reliability: Arc<ReliabilityTracker>,
    bridge: Option<Arc<ReconciliationBridge>>,
    settings: NegotiationSettings,
    outstanding: Arc<DashMap<String, OutstandingOffer>>,
    tasks: TaskTracker,
}

impl NegotiationEngine {
    pub fn new(
        network: Arc<dyn PeerNetwork>,
        reliability: Arc<ReliabilityTracker>,
        settings: NegotiationSettings,
    ) -> Self {
        Self {
            network,
            reliability,
            bridge: None,
            settings,
            outstanding: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
        }
    }

    pub fn with_bridge(mut self, bridge: Arc<ReconciliationBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn settings(&self) -> &NegotiationSettings {
        &self.settings
    }

    pub fn bridge(&self) -> Option<&Arc<ReconciliationBridge>> {
        self.bridge.as_ref()
    }

    /// Offers sent and not yet answered
    pub fn outstanding_offers(&self) -> usize {
        self.outstanding.len()
    }

    /// Negotiate a job with `candidates`, in order.
    ///
    /// Blacklisted candidates are skipped before any offer is sent. Fails
    /// with [`ClientError::NoPeerAccepted`] when nobody takes the job.
    pub async fn negotiate(
        &self,
        candidates: &[PeerRecord],
        template: &OfferTemplate,
        options: &NegotiateOptions,
        cancel: &CancellationToken,
    ) -> Result<NegotiationOutcome> {
        if !self.network.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let max_attempts = options.max_attempts.unwrap_or(self.settings.max_attempts);
        let candidates: Vec<PeerRecord> = candidates
            .iter()
            .filter(|p| {
                let blacklisted = self.reliability.is_blacklisted(&p.peer_id);
                if blacklisted {
                    debug!("Skipping blacklisted candidate {}", p.peer_id);
                }
                !blacklisted
            })
            .take(max_attempts)
            .cloned()
            .collect();

        if candidates.is_empty() {
            return Err(ClientError::NoPeerAccepted {
                workload: template.workload.clone(),
                attempts: 0,
                attempted: Vec::new(),
            });
        }

        let mode = options.mode.unwrap_or(self.settings.mode);
        info!(
            "Negotiating {} with {} candidate(s) ({:?})",
            template.workload,
            candidates.len(),
            mode
        );

        let (accepted, attempts, attempted) = match mode {
            NegotiationMode::Cascading => self.cascade(&candidates, template, cancel).await?,
            NegotiationMode::Parallel => self.parallel(&candidates, template, cancel).await?,
        };

        info!(
            "Peer {} accepted job {} at {}",
            accepted.peer.peer_id,
            accepted.offer.request_id,
            accepted.response.confirmed_price.unwrap_or_default()
        );

        let mut outcome = NegotiationOutcome {
            selected_peer: accepted.peer,
            response: accepted.response,
            offer: accepted.offer,
            attempts,
            attempted,
            latency_ms: accepted.latency_ms,
            settlement: None,
        };

        if options.settle {
            let settlement = match self.settle(&outcome, options, cancel).await {
                Ok(settlement) => settlement,
                Err(SettleError::Cancelled) => return Err(ClientError::Cancelled),
                Err(SettleError::Client(e)) => return Err(e),
                Err(SettleError::Failed(error)) => {
                    return Err(ClientError::SettlementFailed {
                        outcome: Box::new(outcome),
                        error,
                    })
                }
            };
            outcome.settlement = Some(settlement);
        }
        Ok(outcome)
    }

    async fn cascade(
        &self,
        candidates: &[PeerRecord],
        template: &OfferTemplate,
        cancel: &CancellationToken,
    ) -> Result<(Accepted, u32, Vec<AttemptRecord>)> {
        // Cascading reuses the retry loop with no delay between candidates
        let policy = BackoffPolicy::new(Duration::ZERO, (candidates.len() - 1) as u32)
            .with_max_delay(Duration::ZERO);
        let attempted = Mutex::new(Vec::new());

        let result = retry_with_backoff_if(
            &policy,
            cancel,
            |attempt| {
                let peer = &candidates[(attempt - 1) as usize];
                let attempted = &attempted;
                async move {
                    let result = self.offer_one(peer, template).await;
                    if let Err(AttemptError::Failed(record)) = &result {
                        debug!("Candidate {} {}, moving on", record.peer_id, record.failure);
                        attempted.lock().push(record.clone());
                    }
                    result
                }
            },
            |e| matches!(e, AttemptError::Failed(_)),
        )
        .await;

        let attempted = attempted.into_inner();
        match result {
            Ok(accepted) => {
                let attempts = attempted.len() as u32 + 1;
                Ok((accepted, attempts, attempted))
            }
            Err(RetryError::Cancelled { .. }) => Err(ClientError::Cancelled),
            Err(RetryError::Exhausted {
                last_error: AttemptError::Fatal(e),
                ..
            }) => Err(e),
            Err(RetryError::Exhausted { attempts, .. }) => {
                warn!(
                    "No peer accepted {} after {} attempt(s)",
                    template.workload, attempts
                );
                Err(ClientError::NoPeerAccepted {
                    workload: template.workload.clone(),
                    attempts,
                    attempted,
                })
            }
        }
    }

    /// Send one offer and wait for its response
    async fn offer_one(
        &self,
        peer: &PeerRecord,
        template: &OfferTemplate,
    ) -> std::result::Result<Accepted, AttemptError> {
        let offer = template.to_offer(&self.network.local_peer_id());
        let sent_at = Instant::now();
        self.outstanding.insert(
            offer.request_id.clone(),
            OutstandingOffer {
                peer_id: peer.peer_id.clone(),
                sent_at,
            },
        );
        let _guard = OutstandingGuard {
            registry: &self.outstanding,
            request_id: offer.request_id.clone(),
        };

        debug!("Offering job {} to {}", offer.request_id, peer.peer_id);
        let result = match tokio::time::timeout(
            self.settings.request_timeout(),
            self.network.send_offer(peer, offer.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout(peer.peer_id.clone())),
        };
        let elapsed_ms = sent_at.elapsed().as_millis() as u64;

        let result = result.and_then(|response| {
            match self.outstanding.remove(&response.request_id) {
                Some((_, pending)) if pending.peer_id == peer.peer_id => Ok(response),
                _ => Err(NetworkError::ProtocolViolation(format!(
                    "response {} from {} matches no outstanding offer",
                    response.request_id, peer.peer_id
                ))),
            }
        });

        let response = self.judge(peer, &offer, result, elapsed_ms)?;
        Ok(Accepted {
            peer: peer.clone(),
            offer,
            response,
            latency_ms: elapsed_ms,
        })
    }

    async fn parallel(
        &self,
        candidates: &[PeerRecord],
        template: &OfferTemplate,
        cancel: &CancellationToken,
    ) -> Result<(Accepted, u32, Vec<AttemptRecord>)> {
        let local = self.network.local_peer_id();
        let (tx, mut rx) = mpsc::channel(candidates.len());
        let started = Instant::now();
        let timeout = self.settings.request_timeout();

        let mut offers = Vec::with_capacity(candidates.len());
        for (index, peer) in candidates.iter().enumerate() {
            let offer = template.to_offer(&local);
            self.outstanding.insert(
                offer.request_id.clone(),
                OutstandingOffer {
                    peer_id: peer.peer_id.clone(),
                    sent_at: started,
                },
            );
            offers.push(offer.clone());

            let network = self.network.clone();
            let outstanding = self.outstanding.clone();
            let tx = tx.clone();
            let peer = peer.clone();
            let cancel = cancel.child_token();
            self.tasks.spawn(async move {
                let sent = tokio::time::timeout(timeout, network.send_offer(&peer, offer.clone()));
                let result = tokio::select! {
                    _ = cancel.cancelled() => {
                        outstanding.remove(&offer.request_id);
                        debug!("Offer {} to {} cancelled", offer.request_id, peer.peer_id);
                        return;
                    }
                    result = sent => match result {
                        Ok(result) => result,
                        Err(_) => Err(NetworkError::Timeout(peer.peer_id.clone())),
                    },
                };
                let Some((_, pending)) = outstanding.remove(&offer.request_id) else {
                    debug!(
                        "Discarding late response from {} for offer {}",
                        peer.peer_id, offer.request_id
                    );
                    return;
                };
                let elapsed_ms = pending.sent_at.elapsed().as_millis() as u64;
                let _ = tx
                    .send(ParallelReply {
                        index,
                        result,
                        elapsed_ms,
                    })
                    .await;
            });
        }
        drop(tx);

        let mut replies: Vec<Option<ParallelReply>> = (0..candidates.len()).map(|_| None).collect();
        let deadline = tokio::time::sleep(self.settings.parallel_deadline());
        tokio::pin!(deadline);
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = &mut deadline => break,
                reply = rx.recv() => match reply {
                    Some(reply) => {
                        let index = reply.index;
                        replies[index] = Some(reply);
                    }
                    None => break,
                },
            }
        }

        // Anything still outstanding lost the race against the deadline
        let deadline_ms = started.elapsed().as_millis() as u64;
        for offer in &offers {
            self.outstanding.remove(&offer.request_id);
        }
        // A reply may have landed between the deadline and the removal above
        while let Ok(reply) = rx.try_recv() {
            let index = reply.index;
            replies[index] = Some(reply);
        }
        if cancelled {
            return Err(ClientError::Cancelled);
        }

        let mut attempted = Vec::new();
        let mut best: Option<(f64, Accepted)> = None;
        for ((peer, offer), reply) in candidates.iter().zip(offers).zip(replies) {
            let (result, elapsed_ms) = match reply {
                Some(reply) => (reply.result, reply.elapsed_ms),
                None => (Err(NetworkError::Timeout(peer.peer_id.clone())), deadline_ms),
            };
            match self.judge(peer, &offer, result, elapsed_ms) {
                Ok(response) => {
                    let rate = response.cost_rate().unwrap_or(f64::MAX);
                    let accepted = Accepted {
                        peer: peer.clone(),
                        offer,
                        response,
                        latency_ms: elapsed_ms,
                    };
                    match &best {
                        Some((best_rate, _)) if rate >= *best_rate => {
                            debug!("Acceptance from {} outscored", peer.peer_id);
                        }
                        _ => best = Some((rate, accepted)),
                    }
                }
                Err(AttemptError::Failed(record)) => attempted.push(record),
                Err(AttemptError::Fatal(e)) => return Err(e),
            }
        }

        let attempts = candidates.len() as u32;
        match best {
            Some((_, accepted)) => Ok((accepted, attempts, attempted)),
            None => {
                warn!(
                    "No peer accepted {} from {} parallel offer(s)",
                    template.workload, attempts
                );
                Err(ClientError::NoPeerAccepted {
                    workload: template.workload.clone(),
                    attempts,
                    attempted,
                })
            }
        }
    }

    /// Classify one offer result and record the peer's reliability outcome.
    ///
    /// Rejections are answers, not failures, and leave reliability alone.
    fn judge(
        &self,
        peer: &PeerRecord,
        offer: &JobOffer,
        result: std::result::Result<JobOfferResponse, NetworkError>,
        elapsed_ms: u64,
    ) -> std::result::Result<JobOfferResponse, AttemptError> {
        let failure = match result {
            Ok(response) => match response.validate_for(offer) {
                Err(e) => {
                    warn!("Dropping response from {}: {}", peer.peer_id, e);
                    AttemptFailure::ProtocolViolation(e.to_string())
                }
                Ok(()) => match response.status {
                    OfferStatus::Accepted => {
                        self.reliability.record_outcome(&peer.peer_id, true, elapsed_ms);
                        return Ok(response);
                    }
                    OfferStatus::Rejected => {
                        return Err(AttemptError::Failed(AttemptRecord {
                            peer_id: peer.peer_id.clone(),
                            failure: AttemptFailure::Rejected(response.reject_reason),
                        }));
                    }
                    OfferStatus::Error => AttemptFailure::PeerError(
                        response.message.unwrap_or_else(|| "unspecified".to_string()),
                    ),
                },
            },
            Err(NetworkError::NotConnected) => {
                return Err(AttemptError::Fatal(ClientError::NotConnected));
            }
            Err(NetworkError::Cancelled) => return Err(AttemptError::Fatal(ClientError::Cancelled)),
            Err(NetworkError::Timeout(_)) => AttemptFailure::TimedOut,
            Err(NetworkError::ProtocolViolation(msg)) => {
                warn!("Protocol violation from {}: {}", peer.peer_id, msg);
                AttemptFailure::ProtocolViolation(msg)
            }
            Err(e) => AttemptFailure::Unreachable(e.to_string()),
        };

        self.reliability.record_outcome(&peer.peer_id, false, elapsed_ms);
        Err(AttemptError::Failed(AttemptRecord {
            peer_id: peer.peer_id.clone(),
            failure,
        }))
    }

    async fn settle(
        &self,
        outcome: &NegotiationOutcome,
        options: &NegotiateOptions,
        cancel: &CancellationToken,
    ) -> std::result::Result<SettlementOutcome, SettleError> {
        let bridge = self.bridge.as_ref().ok_or_else(|| {
            SettleError::Client(ClientError::InvalidState(
                "settlement requested without a ledger".to_string(),
            ))
        })?;

        let job = NegotiatedJob {
            negotiation_id: outcome.job_id().to_string(),
            peer_id: outcome.selected_peer.peer_id.clone(),
            requester: outcome.offer.requester.clone(),
            workload: outcome.offer.workload.clone(),
            price: outcome.confirmed_price(),
            estimated_time_ms: outcome.response.estimated_time_ms.unwrap_or_default(),
        };
        bridge.register_negotiated(job);

        let attempts = options
            .settlement_attempts
            .unwrap_or(bridge.settings().submit_attempts);
        let fallback = options
            .peer_only_fallback
            .unwrap_or(bridge.settings().peer_only_fallback);

        match bridge.submit_to_ledger(outcome.job_id(), attempts, cancel).await {
            Ok(mapping) => Ok(SettlementOutcome::Settled(mapping)),
            Err(SettlementError::Cancelled) => Err(SettleError::Cancelled),
            Err(e) if fallback => {
                let reason = e.to_string();
                bridge
                    .mark_peer_only(outcome.job_id(), reason.clone())
                    .map_err(SettleError::Failed)?;
                Ok(SettlementOutcome::PeerOnly { reason })
            }
            Err(e) => Err(SettleError::Failed(e)),
        }
    }

    /// Stop in-flight parallel offers and wait for them
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.outstanding.clear();
    }
}

enum SettleError {
    Cancelled,
    Failed(SettlementError),
    Client(ClientError),
}
