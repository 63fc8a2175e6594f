//! Deterministic in-memory [`PeerNetwork`]
//!
//! Peers are scripted: each one carries the raw capability record bytes a
//! lookup returns, how it answers offers, and the frames it writes on a
//! token stream. Frames are sent exactly as scripted (apart from the
//! provider-side `resume_from` skip), so out-of-order and duplicate
//! delivery can be reproduced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use infermesh_core::{
    Capabilities, JobOffer, JobOfferResponse, PeerRecord, RejectReason, StreamMessage, StreamOpen,
};

use crate::{CapabilityRecord, NetworkError, PeerId, PeerNetwork, ProviderHit, Result};

/// How a scripted peer answers a job offer
#[derive(Debug, Clone)]
pub enum OfferScript {
    /// Accept at `price` (the offered price when `None`)
    Accept {
        price: Option<u64>,
        estimated_time_ms: u64,
    },
    Reject(RejectReason),
    Error(String),
    /// Never answer; the offer times out
    Silent,
    /// The dial fails
    Unreachable,
    /// Answer with the inner script after a delay
    Delay(Duration, Box<OfferScript>),
    /// Answer with a request id that matches no outstanding offer
    WrongRequestId,
    /// Accept at a price above the offer
    Overprice,
}

impl OfferScript {
    pub fn accept(estimated_time_ms: u64) -> Self {
        Self::Accept {
            price: None,
            estimated_time_ms,
        }
    }

    pub fn accept_at(price: u64, estimated_time_ms: u64) -> Self {
        Self::Accept {
            price: Some(price),
            estimated_time_ms,
        }
    }

    pub fn delayed(delay: Duration, then: OfferScript) -> Self {
        Self::Delay(delay, Box::new(then))
    }
}

/// A scripted remote peer
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    pub peer_id: String,
    /// Capability record bytes returned by lookups, as stored in the DHT
    pub record: Vec<u8>,
    pub offer: OfferScript,
    /// Frames written on every token stream opened to this peer
    pub stream: Vec<StreamMessage>,
    /// Pause before each frame
    pub token_delay: Duration,
    /// Time until a lookup reports this peer
    pub lookup_delay: Duration,
    /// Drop the first stream after this many frames, without an end frame
    pub cut_first_stream_after: Option<usize>,
}

impl MemoryPeer {
    /// A provider with a fresh peer id and a valid capability record
    pub fn provider(capabilities: Capabilities) -> Self {
        let peer_id = PeerId::random().to_string();
        let record = CapabilityRecord::new(
            &peer_id,
            vec!["/ip4/127.0.0.1/tcp/9400".to_string()],
            capabilities,
        )
        .to_bytes();
        Self::with_record(peer_id, record)
    }

    /// A peer whose stored record bytes are arbitrary
    pub fn with_record(peer_id: impl Into<String>, record: Vec<u8>) -> Self {
        Self {
            peer_id: peer_id.into(),
            record,
            offer: OfferScript::accept(1000),
            stream: Vec::new(),
            token_delay: Duration::ZERO,
            lookup_delay: Duration::ZERO,
            cut_first_stream_after: None,
        }
    }

    pub fn offer_script(mut self, script: OfferScript) -> Self {
        self.offer = script;
        self
    }

    pub fn stream_script(mut self, frames: Vec<StreamMessage>) -> Self {
        self.stream = frames;
        self
    }

    pub fn token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = delay;
        self
    }

    pub fn cut_first_stream_after(mut self, frames: usize) -> Self {
        self.cut_first_stream_after = Some(frames);
        self
    }

    /// Whether a lookup for `workload` reports this peer. Unparseable
    /// records are always reported so the caller sees them.
    fn matches(&self, workload: &str) -> bool {
        match CapabilityRecord::from_bytes(&self.record) {
            Some(record) => record.capabilities.supports(workload),
            None => true,
        }
    }
}

/// In-memory network of scripted peers
pub struct MemoryNetwork {
    local_peer_id: String,
    peers: RwLock<Vec<MemoryPeer>>,
    request_timeout: Duration,
    connected: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
    lookups: AtomicUsize,
    stream_opens: Mutex<HashMap<String, usize>>,
    offers_sent: Mutex<Vec<(String, JobOffer)>>,
    announced: Mutex<Vec<CapabilityRecord>>,
}

impl MemoryNetwork {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            local_peer_id: PeerId::random().to_string(),
            peers: RwLock::new(Vec::new()),
            request_timeout,
            connected: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            lookups: AtomicUsize::new(0),
            stream_opens: Mutex::new(HashMap::new()),
            offers_sent: Mutex::new(Vec::new()),
            announced: Mutex::new(Vec::new()),
        }
    }

    /// Add a peer, returning its id
    pub fn add_peer(&self, peer: MemoryPeer) -> String {
        let peer_id = peer.peer_id.clone();
        let mut peers = self.peers.write();
        peers.retain(|p| p.peer_id != peer_id);
        peers.push(peer);
        peer_id
    }

    pub fn remove_peer(&self, peer_id: &str) -> bool {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|p| p.peer_id != peer_id);
        peers.len() != before
    }

    /// Change how a peer answers offers from now on
    pub fn set_offer_script(&self, peer_id: &str, script: OfferScript) {
        if let Some(peer) = self.peers.write().iter_mut().find(|p| p.peer_id == peer_id) {
            peer.offer = script;
        }
    }

    /// Provider lookups issued so far
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Offers sent, as (peer id, offer), in send order
    pub fn offers_sent(&self) -> Vec<(String, JobOffer)> {
        self.offers_sent.lock().clone()
    }

    pub fn announced(&self) -> Vec<CapabilityRecord> {
        self.announced.lock().clone()
    }

    /// Token streams opened to a peer so far
    pub fn stream_opens(&self, peer_id: &str) -> usize {
        self.stream_opens.lock().get(peer_id).copied().unwrap_or(0)
    }

    fn peer(&self, peer_id: &str) -> Result<MemoryPeer> {
        self.peers
            .read()
            .iter()
            .find(|p| p.peer_id == peer_id)
            .cloned()
            .ok_or_else(|| NetworkError::PeerNotFound(peer_id.to_string()))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(NetworkError::NotConnected)
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(NetworkError::NotConnected),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[async_trait]
impl PeerNetwork for MemoryNetwork {
    fn local_peer_id(&self) -> String {
        self.local_peer_id.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn announce(&self, record: CapabilityRecord) -> Result<()> {
        self.ensure_connected()?;
        self.announced.lock().push(record);
        Ok(())
    }

    async fn find_providers(&self, workload: &str) -> Result<mpsc::Receiver<ProviderHit>> {
        self.ensure_connected()?;
        self.lookups.fetch_add(1, Ordering::SeqCst);

        let mut hits: Vec<(Duration, ProviderHit)> = self
            .peers
            .read()
            .iter()
            .filter(|p| p.matches(workload))
            .map(|p| {
                (
                    p.lookup_delay,
                    ProviderHit {
                        peer_id: p.peer_id.clone(),
                        record: p.record.clone(),
                    },
                )
            })
            .collect();
        hits.sort_by_key(|(delay, _)| *delay);
        debug!("Memory lookup for {} yields {} provider(s)", workload, hits.len());

        let (tx, rx) = mpsc::channel(hits.len().max(1));
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let started = tokio::time::Instant::now();
            for (delay, hit) in hits {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(started + delay) => {}
                }
                if tx.send(hit).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn send_offer(&self, peer: &PeerRecord, offer: JobOffer) -> Result<JobOfferResponse> {
        self.ensure_connected()?;
        self.offers_sent
            .lock()
            .push((peer.peer_id.clone(), offer.clone()));
        let remote = self.peer(&peer.peer_id)?;

        let mut script = &remote.offer;
        let mut delay = Duration::ZERO;
        while let OfferScript::Delay(d, inner) = script {
            delay += *d;
            script = inner;
        }
        if matches!(script, OfferScript::Silent) || delay >= self.request_timeout {
            self.sleep(self.request_timeout).await?;
            return Err(NetworkError::Timeout(remote.peer_id));
        }
        self.sleep(delay).await?;

        let me = &remote.peer_id;
        match script {
            OfferScript::Accept {
                price,
                estimated_time_ms,
            } => Ok(JobOfferResponse::accepted(
                &offer,
                me,
                price.unwrap_or(offer.offered_price),
                *estimated_time_ms,
            )),
            OfferScript::Reject(reason) => Ok(JobOfferResponse::rejected(&offer, me, *reason)),
            OfferScript::Error(message) => Ok(JobOfferResponse::error(&offer, me, message.clone())),
            OfferScript::Unreachable => Err(NetworkError::DialFailed(me.clone())),
            OfferScript::WrongRequestId => Err(NetworkError::ProtocolViolation(format!(
                "response from {} does not match offer {}",
                me, offer.request_id
            ))),
            OfferScript::Overprice => Ok(JobOfferResponse::accepted(
                &offer,
                me,
                offer.offered_price.saturating_add(1),
                1000,
            )),
            OfferScript::Silent | OfferScript::Delay(..) => {
                Err(NetworkError::Timeout(remote.peer_id.clone()))
            }
        }
    }

    async fn open_token_stream(
        &self,
        peer: &PeerRecord,
        open: StreamOpen,
    ) -> Result<mpsc::Receiver<StreamMessage>> {
        self.ensure_connected()?;
        let remote = self.peer(&peer.peer_id)?;

        let opened_before = {
            let mut opens = self.stream_opens.lock();
            let count = opens.entry(remote.peer_id.clone()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let cut_after = if opened_before == 0 {
            remote.cut_first_stream_after
        } else {
            None
        };

        let (tx, rx) = mpsc::channel(remote.stream.len().max(1));
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let mut sent = 0usize;
            for message in remote.stream {
                if let StreamMessage::Token(frame) = &message {
                    if frame.index < open.resume_from {
                        continue;
                    }
                }
                if cut_after == Some(sent) {
                    debug!("Cutting stream for job {} after {} frames", open.job_id, sent);
                    return;
                }
                if !remote.token_delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(remote.token_delay) => {}
                    }
                }
                if cancel.is_cancelled() || tx.send(message).await.is_err() {
                    return;
                }
                sent += 1;
            }
        });
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infermesh_core::{OfferStatus, StreamStatus, StreamSummary, TokenFrame};

    fn caps(workload: &str) -> Capabilities {
        Capabilities {
            workloads: [workload.to_string()].into_iter().collect(),
            max_units: 1000,
            price_per_unit: 1,
            compute_class: Default::default(),
            max_concurrent: 1,
        }
    }

    fn record_for(peer_id: &str) -> PeerRecord {
        PeerRecord {
            peer_id: peer_id.to_string(),
            addresses: vec![],
            capabilities: caps("llama-3-8b"),
            latency_ms: None,
            reputation: 50,
            last_seen: 0,
        }
    }

    #[tokio::test]
    async fn test_lookup_filters_by_workload() {
        let net = MemoryNetwork::new(Duration::from_secs(1));
        let llama = net.add_peer(MemoryPeer::provider(caps("llama-3-8b")));
        net.add_peer(MemoryPeer::provider(caps("mistral-7b")));
        net.add_peer(MemoryPeer::with_record("junk", b"garbage".to_vec()));

        let mut rx = net.find_providers("llama-3-8b").await.unwrap();
        let mut ids = Vec::new();
        while let Some(hit) = rx.recv().await {
            ids.push(hit.peer_id);
        }
        assert_eq!(ids, vec![llama, "junk".to_string()]);
        assert_eq!(net.lookups(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let net = MemoryNetwork::new(Duration::from_secs(2));
        let peer = net.add_peer(MemoryPeer::provider(caps("llama-3-8b")).offer_script(OfferScript::Silent));
        let offer = JobOffer::new("me", "llama-3-8b", "hi", 10, 10);
        let err = net.send_offer(&record_for(&peer), offer).await.unwrap_err();
        assert!(matches!(err, NetworkError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_delay_then_answer() {
        let net = MemoryNetwork::new(Duration::from_secs(2));
        let peer = net.add_peer(
            MemoryPeer::provider(caps("llama-3-8b")).offer_script(OfferScript::delayed(
                Duration::from_millis(500),
                OfferScript::Reject(RejectReason::Busy),
            )),
        );
        let offer = JobOffer::new("me", "llama-3-8b", "hi", 10, 10);
        let resp = net.send_offer(&record_for(&peer), offer.clone()).await.unwrap();
        assert_eq!(resp.status, OfferStatus::Rejected);
        assert_eq!(resp.request_id, offer.request_id);
        assert_eq!(net.offers_sent().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let net = MemoryNetwork::new(Duration::from_secs(1));
        let offer = JobOffer::new("me", "llama-3-8b", "hi", 10, 10);
        assert!(matches!(
            net.send_offer(&record_for("nobody"), offer).await,
            Err(NetworkError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_skips_below_resume_and_cuts_once() {
        let net = MemoryNetwork::new(Duration::from_secs(1));
        let frames = (0..4)
            .map(|i| StreamMessage::Token(TokenFrame::token(i, format!("t{}", i))))
            .chain(std::iter::once(StreamMessage::End(StreamSummary {
                total_tokens: 4,
                duration_ms: 1,
                final_status: StreamStatus::Closed,
            })))
            .collect();
        let peer = net.add_peer(
            MemoryPeer::provider(caps("llama-3-8b"))
                .stream_script(frames)
                .cut_first_stream_after(2),
        );

        let open = StreamOpen { job_id: "job".to_string(), resume_from: 0 };
        let mut rx = net.open_token_stream(&record_for(&peer), open).await.unwrap();
        let mut first = Vec::new();
        while let Some(m) = rx.recv().await {
            first.push(m);
        }
        assert_eq!(first.len(), 2);

        let open = StreamOpen { job_id: "job".to_string(), resume_from: 2 };
        let mut rx = net.open_token_stream(&record_for(&peer), open).await.unwrap();
        let mut second = Vec::new();
        while let Some(m) = rx.recv().await {
            second.push(m);
        }
        assert_eq!(second.len(), 3);
        assert!(matches!(second[0], StreamMessage::Token(ref f) if f.index == 2));
        assert_eq!(net.stream_opens(&peer), 2);
    }

    #[tokio::test]
    async fn test_disconnect_refuses_further_calls() {
        let net = MemoryNetwork::new(Duration::from_secs(1));
        net.disconnect().await.unwrap();
        assert!(!net.is_connected());
        assert!(matches!(
            net.find_providers("llama-3-8b").await,
            Err(NetworkError::NotConnected)
        ));
    }
}
