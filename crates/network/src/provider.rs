//! Provider side of negotiation and streaming
//!
//! [`OfferHandler`] answers inbound job offers; [`OfferEvaluator`] is the
//! default handler, deciding from the node's [`ProviderSettings`].
//! [`TokenSource`] produces the frames served on inbound token streams.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use infermesh_core::{JobOffer, JobOfferResponse, ProviderSettings, RejectReason, TokenFrame};

use crate::Result;

/// Answers inbound job offers
#[async_trait]
pub trait OfferHandler: Send + Sync + 'static {
    async fn handle_offer(&self, from: &str, offer: JobOffer) -> JobOfferResponse;
}

/// Supplies token frames for an accepted job
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    /// Open the frame sequence for `job_id`, starting at `resume_from`
    async fn open(&self, job_id: &str, resume_from: u64) -> Result<mpsc::Receiver<TokenFrame>>;
}

/// Offer policy driven by the provider's settings.
///
/// Accepted offers hold a concurrency slot until [`OfferEvaluator::release`].
pub struct OfferEvaluator {
    local_peer_id: String,
    settings: ProviderSettings,
    active: Mutex<HashMap<String, JobOffer>>,
}

impl OfferEvaluator {
    pub fn new(local_peer_id: &str, settings: ProviderSettings) -> Self {
        Self {
            local_peer_id: local_peer_id.to_string(),
            settings,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// Decide on an offer without any I/O
    pub fn evaluate(&self, offer: &JobOffer) -> JobOfferResponse {
        let me = &self.local_peer_id;

        if let Err(e) = offer.check_version() {
            return JobOfferResponse::error(offer, me, e.to_string());
        }
        if !self.settings.workloads.iter().any(|w| w == &offer.workload) {
            return JobOfferResponse::rejected(offer, me, RejectReason::UnsupportedWorkload);
        }
        if offer.resource_limit > self.settings.max_units {
            return JobOfferResponse::rejected(offer, me, RejectReason::UnsupportedWorkload)
                .with_message(format!(
                    "resource limit {} exceeds {}",
                    offer.resource_limit, self.settings.max_units
                ));
        }

        let quote = self.settings.price_per_unit.saturating_mul(offer.resource_limit);
        if offer.offered_price < quote {
            return JobOfferResponse::rejected(offer, me, RejectReason::InsufficientPayment)
                .with_message(format!("quote is {}", quote));
        }

        let mut active = self.active.lock();
        if active.contains_key(&offer.request_id) {
            return JobOfferResponse::error(offer, me, "duplicate request id");
        }
        if active.len() >= self.settings.max_concurrent as usize {
            return JobOfferResponse::rejected(offer, me, RejectReason::Busy);
        }
        active.insert(offer.request_id.clone(), offer.clone());

        let estimated_time_ms = self.settings.ms_per_unit.saturating_mul(offer.resource_limit);
        JobOfferResponse::accepted(offer, me, quote.min(offer.offered_price), estimated_time_ms)
    }

    /// The accepted offer behind a job id
    pub fn accepted_offer(&self, job_id: &str) -> Option<JobOffer> {
        self.active.lock().get(job_id).cloned()
    }

    /// Free the concurrency slot held by a job
    pub fn release(&self, job_id: &str) -> bool {
        let released = self.active.lock().remove(job_id).is_some();
        if released {
            debug!("Released job slot {}", job_id);
        }
        released
    }

    pub fn active_jobs(&self) -> usize {
        self.active.lock().len()
    }
}

#[async_trait]
impl OfferHandler for OfferEvaluator {
    async fn handle_offer(&self, from: &str, offer: JobOffer) -> JobOfferResponse {
        let response = self.evaluate(&offer);
        info!(
            "Offer {} from {} for {}: {:?}{}",
            offer.request_id,
            from,
            offer.workload,
            response.status,
            response
                .reject_reason
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
        response
    }
}
