use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CoreError, Result};

/// Current version of the negotiation wire messages
pub const NEGOTIATION_PROTOCOL_VERSION: u16 = 1;

/// Reputation assigned to a peer with no recorded history (0-100 scale)
pub const DEFAULT_REPUTATION: u8 = 50;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Hardware class a provider runs its workloads on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ComputeClass {
    Cpu,
    #[default]
    Gpu,
    Accelerator,
}

/// What a provider advertises it can run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Workload identifiers served (model names)
    pub workloads: BTreeSet<String>,
    /// Largest single job, in resource units (tokens)
    pub max_units: u64,
    /// Price per resource unit, in the smallest currency unit
    pub price_per_unit: u64,
    #[serde(default)]
    pub compute_class: ComputeClass,
    /// Jobs served at the same time
    pub max_concurrent: u32,
}

impl Capabilities {
    pub fn supports(&self, workload: &str) -> bool {
        self.workloads.contains(workload)
    }

    /// Price for a job of `units` resource units
    pub fn quote(&self, units: u64) -> u64 {
        self.price_per_unit.saturating_mul(units)
    }
}

/// A provider as seen by the discovery engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub peer_id: String,
    /// Multiaddrs in string form
    pub addresses: Vec<String>,
    pub capabilities: Capabilities,
    /// Last measured round trip, if any
    pub latency_ms: Option<u32>,
    /// Advisory reputation, 0-100
    pub reputation: u8,
    /// Unix millis of the last successful contact
    pub last_seen: u64,
}

impl PeerRecord {
    /// Whether the record was last refreshed more than `ttl` before `now`
    pub fn is_stale(&self, ttl: Duration, now: u64) -> bool {
        now.saturating_sub(self.last_seen) > ttl.as_millis() as u64
    }

    /// Per-unit price advertised by the peer
    pub fn price(&self) -> u64 {
        self.capabilities.price_per_unit
    }
}

/// Job offer sent from a requester to a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOffer {
    pub version: u16,
    /// Unique per offer, echoed by the response
    pub request_id: String,
    /// Requester's peer id
    pub requester: String,
    /// Workload (model) identifier
    pub workload: String,
    /// Opaque job payload (prompt)
    pub payload: String,
    /// Maximum resource units (tokens) the job may use
    pub resource_limit: u64,
    /// Total price the requester is willing to pay
    pub offered_price: u64,
    /// Unix millis at creation
    pub timestamp: u64,
}

impl JobOffer {
    pub fn new(
        requester: &str,
        workload: &str,
        payload: &str,
        resource_limit: u64,
        offered_price: u64,
    ) -> Self {
        Self {
            version: NEGOTIATION_PROTOCOL_VERSION,
            request_id: uuid::Uuid::new_v4().to_string(),
            requester: requester.to_string(),
            workload: workload.to_string(),
            payload: payload.to_string(),
            resource_limit,
            offered_price,
            timestamp: now_millis(),
        }
    }

    pub fn check_version(&self) -> Result<()> {
        if self.version != NEGOTIATION_PROTOCOL_VERSION {
            return Err(CoreError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferStatus {
    Accepted,
    Rejected,
    Error,
}

/// Why a provider declined an offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    Busy,
    InsufficientPayment,
    UnsupportedWorkload,
    Timeout,
    Error,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Busy => "busy",
            Self::InsufficientPayment => "insufficient-payment",
            Self::UnsupportedWorkload => "unsupported-workload",
            Self::Timeout => "timeout",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Provider's answer to a [`JobOffer`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOfferResponse {
    pub request_id: String,
    pub responder: String,
    pub status: OfferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_price: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<RejectReason>,
}

impl JobOfferResponse {
    pub fn accepted(
        offer: &JobOffer,
        responder: &str,
        confirmed_price: u64,
        estimated_time_ms: u64,
    ) -> Self {
        Self {
            request_id: offer.request_id.clone(),
            responder: responder.to_string(),
            status: OfferStatus::Accepted,
            estimated_time_ms: Some(estimated_time_ms),
            confirmed_price: Some(confirmed_price),
            message: None,
            reject_reason: None,
        }
    }

    pub fn rejected(offer: &JobOffer, responder: &str, reason: RejectReason) -> Self {
        Self {
            request_id: offer.request_id.clone(),
            responder: responder.to_string(),
            status: OfferStatus::Rejected,
            estimated_time_ms: None,
            confirmed_price: None,
            message: None,
            reject_reason: Some(reason),
        }
    }

    pub fn error(offer: &JobOffer, responder: &str, message: impl Into<String>) -> Self {
        Self {
            request_id: offer.request_id.clone(),
            responder: responder.to_string(),
            status: OfferStatus::Error,
            estimated_time_ms: None,
            confirmed_price: None,
            message: Some(message.into()),
            reject_reason: Some(RejectReason::Error),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_accepted(&self) -> bool {
        self.status == OfferStatus::Accepted
    }

    /// Check the response answers `offer` and obeys the price ceiling.
    pub fn validate_for(&self, offer: &JobOffer) -> Result<()> {
        if self.request_id != offer.request_id {
            return Err(CoreError::RequestIdMismatch {
                expected: offer.request_id.clone(),
                actual: self.request_id.clone(),
            });
        }
        match self.status {
            OfferStatus::Accepted => {
                let confirmed = self
                    .confirmed_price
                    .ok_or(CoreError::MissingField("confirmedPrice"))?;
                if confirmed > offer.offered_price {
                    return Err(CoreError::PriceAboveOffer {
                        offered: offer.offered_price,
                        confirmed,
                    });
                }
                self.estimated_time_ms
                    .ok_or(CoreError::MissingField("estimatedTimeMs"))?;
            }
            OfferStatus::Rejected => {
                self.reject_reason
                    .ok_or(CoreError::MissingField("rejectReason"))?;
            }
            OfferStatus::Error => {}
        }
        Ok(())
    }

    /// Cost per millisecond of estimated work; lower is better
    pub fn cost_rate(&self) -> Option<f64> {
        let price = self.confirmed_price? as f64;
        let time = self.estimated_time_ms?.max(1) as f64;
        Some(price / time)
    }
}

/// Job lifecycle status, as reported by a peer or by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Claimed,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    #[default]
    Token,
    Metadata,
}

/// One token (or metadata chunk) of streamed output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFrame {
    pub content: String,
    /// Strictly increasing within a job
    pub index: u64,
    /// Unix millis when the provider emitted it
    pub timestamp: u64,
    #[serde(default)]
    pub kind: FrameKind,
}

impl TokenFrame {
    pub fn token(index: u64, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            index,
            timestamp: now_millis(),
            kind: FrameKind::Token,
        }
    }
}

/// Status of a stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Active,
    Paused,
    Closed,
    Error,
}

impl StreamStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

/// Sent once when a token stream ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub total_tokens: u64,
    pub duration_ms: u64,
    pub final_status: StreamStatus,
}

/// Frame written on a token stream by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamMessage {
    Token(TokenFrame),
    End(StreamSummary),
}

impl StreamMessage {
    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse from JSON bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

/// First frame a requester writes when opening a token stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOpen {
    pub job_id: String,
    /// Index of the first token wanted; earlier tokens are skipped
    pub resume_from: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(price: u64) -> JobOffer {
        JobOffer::new("requester", "llama-3-8b", "hello", 256, price)
    }

    fn caps() -> Capabilities {
        Capabilities {
            workloads: ["llama-3-8b".to_string()].into_iter().collect(),
            max_units: 4096,
            price_per_unit: 2,
            compute_class: ComputeClass::Gpu,
            max_concurrent: 4,
        }
    }

    #[test]
    fn test_capabilities_quote_saturates() {
        let mut c = caps();
        assert_eq!(c.quote(10), 20);
        c.price_per_unit = u64::MAX;
        assert_eq!(c.quote(2), u64::MAX);
        assert!(c.supports("llama-3-8b"));
        assert!(!c.supports("mistral"));
    }

    #[test]
    fn test_peer_record_staleness() {
        let record = PeerRecord {
            peer_id: "p".to_string(),
            addresses: vec![],
            capabilities: caps(),
            latency_ms: None,
            reputation: DEFAULT_REPUTATION,
            last_seen: 1_000,
        };
        assert!(!record.is_stale(Duration::from_secs(60), 61_000));
        assert!(record.is_stale(Duration::from_secs(60), 61_001));
    }

    #[test]
    fn test_offer_wire_format() {
        let o = offer(500);
        let json = serde_json::to_value(&o).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["requestId"], o.request_id.as_str());
        assert_eq!(json["resourceLimit"], 256);
        assert_eq!(json["offeredPrice"], 500);
        assert!(o.check_version().is_ok());
    }

    #[test]
    fn test_offer_request_ids_unique() {
        assert_ne!(offer(1).request_id, offer(1).request_id);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut o = offer(1);
        o.version = 7;
        assert_eq!(o.check_version(), Err(CoreError::UnsupportedVersion(7)));
    }

    #[test]
    fn test_reject_reason_wire_names() {
        let o = offer(1);
        let resp = JobOfferResponse::rejected(&o, "peer", RejectReason::InsufficientPayment);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["rejectReason"], "insufficient-payment");
        assert!(json.get("confirmedPrice").is_none());
        assert_eq!(RejectReason::UnsupportedWorkload.to_string(), "unsupported-workload");
    }

    #[test]
    fn test_accepted_response_validates() {
        let o = offer(500);
        let resp = JobOfferResponse::accepted(&o, "peer", 400, 2_000);
        assert!(resp.validate_for(&o).is_ok());
        assert_eq!(resp.cost_rate(), Some(0.2));
    }

    #[test]
    fn test_price_above_offer_is_violation() {
        let o = offer(500);
        let resp = JobOfferResponse::accepted(&o, "peer", 501, 2_000);
        assert_eq!(
            resp.validate_for(&o),
            Err(CoreError::PriceAboveOffer { offered: 500, confirmed: 501 })
        );
    }

    #[test]
    fn test_mismatched_request_id_is_violation() {
        let o = offer(500);
        let other = offer(500);
        let resp = JobOfferResponse::accepted(&other, "peer", 100, 10);
        assert!(matches!(
            resp.validate_for(&o),
            Err(CoreError::RequestIdMismatch { .. })
        ));
    }

    #[test]
    fn test_accepted_without_estimate_is_violation() {
        let o = offer(500);
        let mut resp = JobOfferResponse::accepted(&o, "peer", 100, 10);
        resp.estimated_time_ms = None;
        assert_eq!(
            resp.validate_for(&o),
            Err(CoreError::MissingField("estimatedTimeMs"))
        );
    }

    #[test]
    fn test_stream_message_tagging() {
        let frame = StreamMessage::Token(TokenFrame {
            content: "Hi".to_string(),
            index: 0,
            timestamp: 5,
            kind: FrameKind::Token,
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "token");
        assert_eq!(json["content"], "Hi");

        let end = StreamMessage::End(StreamSummary {
            total_tokens: 3,
            duration_ms: 40,
            final_status: StreamStatus::Closed,
        });
        let json = serde_json::to_value(&end).unwrap();
        assert_eq!(json["type"], "end");
        assert_eq!(json["totalTokens"], 3);
        assert_eq!(json["finalStatus"], "closed");
    }

    #[test]
    fn test_stream_message_from_garbage() {
        assert!(StreamMessage::from_bytes(b"not json").is_none());
        assert!(StreamMessage::from_bytes(br#"{"type":"bogus"}"#).is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Claimed.is_terminal());
        assert!(StreamStatus::Error.is_terminal());
        assert!(!StreamStatus::Paused.is_terminal());
    }
}
