//! Two nodes over localhost TCP
//!
//! A provider node runs the default offer evaluator and a small token
//! source; a requester node bootstraps from it, negotiates a job and reads
//! the token stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;

use infermesh_core::{
    BackoffPolicy, Capabilities, JobOffer, JobOfferResponse, OfferStatus, PeerRecord, ProviderSettings, RejectReason,
    StreamMessage, StreamOpen, StreamStatus, TokenFrame,
};
use infermesh_network::{
    CapabilityRecord, Keypair, Multiaddr, NetworkConfig, NetworkError, OfferEvaluator,
    OfferHandler, PeerNetwork, TokenSource, TransportNode,
};

const WORKLOAD: &str = "llama-3-8b";

struct CountingSource;

#[async_trait]
impl TokenSource for CountingSource {
    async fn open(
        &self,
        _job_id: &str,
        resume_from: u64,
    ) -> infermesh_network::Result<mpsc::Receiver<TokenFrame>> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for i in resume_from..5 {
                if tx.send(TokenFrame::token(i, format!("tok{}", i))).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

fn provider_settings() -> ProviderSettings {
    ProviderSettings {
        workloads: vec![WORKLOAD.to_string()],
        price_per_unit: 1,
        max_units: 100,
        max_concurrent: 2,
        ms_per_unit: 5,
        ..Default::default()
    }
}

async fn wait_for_listen_addr(node: &TransportNode) -> Multiaddr {
    for _ in 0..100 {
        if let Some(addr) = node.listen_addrs().await.unwrap().into_iter().next() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("node never started listening");
}

async fn start_provider() -> (TransportNode, Multiaddr, Capabilities) {
    let keypair = Keypair::generate_ed25519();
    let peer_id = keypair.public().to_peer_id().to_string();
    let evaluator = Arc::new(OfferEvaluator::new(&peer_id, provider_settings()));
    let node = TransportNode::start(
        keypair,
        NetworkConfig::local(),
        evaluator,
        Some(Arc::new(CountingSource)),
    )
    .await
    .unwrap();
    let addr = wait_for_listen_addr(&node).await;
    (node, addr, provider_settings().capabilities())
}

async fn start_requester(provider: &TransportNode, addr: &Multiaddr) -> TransportNode {
    let keypair = Keypair::generate_ed25519();
    let peer_id = keypair.public().to_peer_id().to_string();
    let mut config = NetworkConfig::local();
    config.bootstrap_peers = vec![(provider.peer_id(), addr.clone())];
    TransportNode::start(
        keypair,
        config,
        Arc::new(OfferEvaluator::new(&peer_id, ProviderSettings::default())),
        None,
    )
    .await
    .unwrap()
}

fn peer_record(node: &TransportNode, addr: &Multiaddr, capabilities: Capabilities) -> PeerRecord {
    PeerRecord {
        peer_id: node.peer_id().to_string(),
        addresses: vec![addr.to_string()],
        capabilities,
        latency_ms: None,
        reputation: 50,
        last_seen: 0,
    }
}

#[tokio::test]
async fn test_negotiate_and_stream_between_nodes() {
    infermesh_logging::init_test_logging();

    let (provider, addr, caps) = start_provider().await;
    let requester = start_requester(&provider, &addr).await;
    let target = peer_record(&provider, &addr, caps);

    let offer = JobOffer::new(&requester.local_peer_id(), WORKLOAD, "hello", 10, 50);
    let response = timeout(Duration::from_secs(20), requester.send_offer(&target, offer.clone()))
        .await
        .expect("offer timed out")
        .unwrap();
    assert_eq!(response.status, OfferStatus::Accepted);
    assert_eq!(response.request_id, offer.request_id);
    assert_eq!(response.confirmed_price, Some(10));
    assert_eq!(response.estimated_time_ms, Some(50));

    let open = StreamOpen {
        job_id: offer.request_id.clone(),
        resume_from: 2,
    };
    let mut frames = requester.open_token_stream(&target, open).await.unwrap();
    let mut indices = Vec::new();
    let mut summary = None;
    while let Some(message) = timeout(Duration::from_secs(10), frames.recv())
        .await
        .expect("stream stalled")
    {
        match message {
            StreamMessage::Token(frame) => indices.push(frame.index),
            StreamMessage::End(end) => summary = Some(end),
        }
    }
    assert_eq!(indices, vec![2, 3, 4]);
    let summary = summary.expect("no end frame");
    assert_eq!(summary.total_tokens, 3);
    assert_eq!(summary.final_status, StreamStatus::Closed);

    requester.disconnect().await.unwrap();
    provider.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unsupported_workload_rejected_over_wire() {
    let (provider, addr, caps) = start_provider().await;
    let requester = start_requester(&provider, &addr).await;
    let target = peer_record(&provider, &addr, caps);

    let offer = JobOffer::new(&requester.local_peer_id(), "mistral-7b", "hello", 10, 50);
    let response = timeout(Duration::from_secs(20), requester.send_offer(&target, offer))
        .await
        .expect("offer timed out")
        .unwrap();
    assert_eq!(response.status, OfferStatus::Rejected);
    assert_eq!(response.reject_reason, Some(RejectReason::UnsupportedWorkload));

    requester.disconnect().await.unwrap();
    provider.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_capability_lookup_finds_provider() {
    let (provider, addr, caps) = start_provider().await;
    let record = CapabilityRecord::new(
        &provider.local_peer_id(),
        vec![addr.to_string()],
        caps,
    );
    provider.announce(record).await.unwrap();

    let requester = start_requester(&provider, &addr).await;
    // Wait for the bootstrap dial before querying
    for _ in 0..100 {
        if !requester.connected_peers().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut hits = requester.find_providers(WORKLOAD).await.unwrap();
    let hit = timeout(Duration::from_secs(30), hits.recv())
        .await
        .expect("lookup timed out")
        .expect("no provider found");
    assert_eq!(hit.peer_id, provider.local_peer_id());
    let parsed = CapabilityRecord::parse_for(&hit.peer_id, &hit.record).unwrap();
    assert!(parsed.capabilities.supports(WORKLOAD));

    requester.disconnect().await.unwrap();
    provider.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_is_final() {
    let (provider, _addr, _caps) = start_provider().await;
    provider.disconnect().await.unwrap();
    assert!(!provider.is_connected());
    assert!(provider.listen_addrs().await.is_err());
    // Second disconnect is a no-op
    provider.disconnect().await.unwrap();
}

async fn start_dialer(dial_backoff: BackoffPolicy) -> TransportNode {
    let keypair = Keypair::generate_ed25519();
    let peer_id = keypair.public().to_peer_id().to_string();
    let mut config = NetworkConfig::local();
    config.dial_backoff = dial_backoff;
    TransportNode::start(
        keypair,
        config,
        Arc::new(OfferEvaluator::new(&peer_id, ProviderSettings::default())),
        None,
    )
    .await
    .unwrap()
}

fn unreachable_addr(port: u16) -> Multiaddr {
    format!("/ip4/127.0.0.1/tcp/{}", port).parse().unwrap()
}

#[tokio::test]
async fn test_dial_backoff_budget_per_address() {
    let retry_delay = Duration::from_millis(100);
    let node = start_dialer(BackoffPolicy::new(retry_delay, 1)).await;

    let err = timeout(Duration::from_secs(10), node.dial_with_backoff(unreachable_addr(1)))
        .await
        .expect("dial loop hung")
        .unwrap_err();
    assert!(matches!(err, NetworkError::DialFailed(ref msg) if msg.contains("2 attempts")));

    // A spent budget on one address leaves the next one untouched
    let started = tokio::time::Instant::now();
    let err = timeout(Duration::from_secs(10), node.dial_with_backoff(unreachable_addr(2)))
        .await
        .expect("dial loop hung")
        .unwrap_err();
    assert!(matches!(err, NetworkError::DialFailed(ref msg) if msg.contains("2 attempts")));
    assert!(started.elapsed() >= retry_delay);

    node.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_ends_dial_backoff() {
    let node = start_dialer(BackoffPolicy::new(Duration::from_secs(30), 3)).await;

    let dialer = node.clone();
    let dial = tokio::spawn(async move { dialer.dial_with_backoff(unreachable_addr(1)).await });
    // Let the first attempt fail so the loop is waiting out its backoff
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!dial.is_finished());

    let started = tokio::time::Instant::now();
    timeout(Duration::from_secs(5), node.shutdown())
        .await
        .expect("shutdown waited on the dial backoff")
        .unwrap();
    let result = timeout(Duration::from_secs(1), dial)
        .await
        .expect("dial loop outlived shutdown")
        .unwrap();
    assert!(matches!(result, Err(NetworkError::Cancelled)), "{:?}", result);
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// Takes every offer and never answers
struct StallingHandler {
    started: Arc<Notify>,
    released: Arc<AtomicBool>,
}

struct ReleaseOnDrop(Arc<AtomicBool>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl OfferHandler for StallingHandler {
    async fn handle_offer(&self, _from: &str, _offer: JobOffer) -> JobOfferResponse {
        let _release = ReleaseOnDrop(self.released.clone());
        self.started.notify_one();
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_shutdown_stops_inbound_offer_handlers() {
    let started = Arc::new(Notify::new());
    let released = Arc::new(AtomicBool::new(false));
    let keypair = Keypair::generate_ed25519();
    let provider = TransportNode::start(
        keypair,
        NetworkConfig::local(),
        Arc::new(StallingHandler {
            started: started.clone(),
            released: released.clone(),
        }),
        None,
    )
    .await
    .unwrap();
    let addr = wait_for_listen_addr(&provider).await;
    let requester = start_requester(&provider, &addr).await;
    let target = peer_record(&provider, &addr, provider_settings().capabilities());

    let offer = JobOffer::new(&requester.local_peer_id(), WORKLOAD, "hello", 10, 50);
    let sender = requester.clone();
    let pending = tokio::spawn(async move { sender.send_offer(&target, offer).await });
    timeout(Duration::from_secs(20), started.notified())
        .await
        .expect("offer never reached the handler");
    assert!(!released.load(Ordering::SeqCst));

    timeout(Duration::from_secs(5), provider.shutdown())
        .await
        .expect("shutdown hung")
        .unwrap();
    assert!(released.load(Ordering::SeqCst));

    requester.disconnect().await.unwrap();
    let _ = pending.await;
}
