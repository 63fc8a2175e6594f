//! Requester-side facade over discovery, negotiation, streaming and
//! settlement

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use infermesh_core::{Capabilities, MeshConfig, PeerRecord};
use infermesh_network::{CapabilityRecord, PeerNetwork};
use infermesh_settlement::ReconciliationBridge;

use crate::{
    ConversationArchive, DiscoveryEngine, FindOptions, NegotiateOptions, NegotiationEngine,
    NegotiationOutcome, OfferTemplate, PeerFilter, ReliabilityEvent, ReliabilityTracker, Result,
    StreamManager, StreamSession,
};

/// Options for [`MeshClient::request_job`]
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub find: FindOptions,
    pub negotiate: NegotiateOptions,
}

pub struct MeshClient {
    network: Arc<dyn PeerNetwork>,
    config: MeshConfig,
    reliability: Arc<ReliabilityTracker>,
    discovery: DiscoveryEngine,
    negotiation: NegotiationEngine,
    streams: StreamManager,
    bridge: Option<Arc<ReconciliationBridge>>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshClient {
    /// Build a client over an already started network.
    ///
    /// Must be called inside a tokio runtime: the bridge event listener and
    /// the reliability alert logger are spawned here.
    pub fn new(
        network: Arc<dyn PeerNetwork>,
        config: &MeshConfig,
        bridge: Option<Arc<ReconciliationBridge>>,
        archive: Option<Arc<dyn ConversationArchive>>,
    ) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let reliability = Arc::new(ReliabilityTracker::new(config.reliability.clone()));
        let discovery = DiscoveryEngine::new(
            network.clone(),
            reliability.clone(),
            config.discovery.clone(),
        );
        let mut negotiation = NegotiationEngine::new(
            network.clone(),
            reliability.clone(),
            config.negotiation.clone(),
        );
        if let Some(bridge) = &bridge {
            negotiation = negotiation.with_bridge(bridge.clone());
        }
        let streams = StreamManager::new(network.clone(), config.streaming.clone(), archive);

        let mut background = vec![spawn_alert_logger(reliability.subscribe(), cancel.clone())];
        if let Some(bridge) = &bridge {
            background.push(bridge.spawn_event_listener(cancel.clone()));
        }

        info!("Mesh client ready as {}", network.local_peer_id());
        Ok(Self {
            network,
            config: config.clone(),
            reliability,
            discovery,
            negotiation,
            streams,
            bridge,
            cancel,
            background: Mutex::new(background),
        })
    }

    pub fn peer_id(&self) -> String {
        self.network.local_peer_id()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn reliability(&self) -> &Arc<ReliabilityTracker> {
        &self.reliability
    }

    pub fn discovery(&self) -> &DiscoveryEngine {
        &self.discovery
    }

    pub fn negotiation(&self) -> &NegotiationEngine {
        &self.negotiation
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    pub fn bridge(&self) -> Option<&Arc<ReconciliationBridge>> {
        self.bridge.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.network.is_connected() && !self.cancel.is_cancelled()
    }

    /// Advertise capabilities so requesters can find this node
    pub async fn announce(&self, addresses: Vec<String>, capabilities: Capabilities) -> Result<()> {
        let record = CapabilityRecord::new(&self.peer_id(), addresses, capabilities);
        self.network.announce(record).await?;
        Ok(())
    }

    pub async fn find_peers(
        &self,
        workload: &str,
        filter: &PeerFilter,
        options: &FindOptions,
    ) -> Result<Vec<PeerRecord>> {
        self.discovery.find_peers(workload, filter, options).await
    }

    /// Discover providers for the template's workload, negotiate with them
    /// and, when requested, settle the winning job on the ledger
    pub async fn request_job(
        &self,
        template: &OfferTemplate,
        filter: &PeerFilter,
        options: &RequestOptions,
    ) -> Result<NegotiationOutcome> {
        let candidates = self
            .discovery
            .find_peers(&template.workload, filter, &options.find)
            .await?;
        debug!(
            "{} candidate(s) for {}",
            candidates.len(),
            template.workload
        );

        let outcome = self
            .negotiation
            .negotiate(&candidates, template, &options.negotiate, &self.cancel)
            .await?;
        let latency = u32::try_from(outcome.latency_ms).unwrap_or(u32::MAX);
        self.discovery
            .touch(&outcome.selected_peer.peer_id, Some(latency));
        Ok(outcome)
    }

    /// Open the token stream for a negotiated job
    pub async fn open_stream(&self, outcome: &NegotiationOutcome) -> Result<Arc<StreamSession>> {
        self.streams
            .open(
                &outcome.selected_peer,
                outcome.job_id(),
                Some(outcome.offer.payload.clone()),
            )
            .await
    }

    /// Continue a failed stream after its last delivered token
    pub async fn resume_stream(&self, previous: &StreamSession) -> Result<Arc<StreamSession>> {
        self.streams.resume(previous).await
    }

    /// Shut everything down, in order: in-flight negotiations are
    /// cancelled, stream sessions closed, discovery caches cleared and the
    /// network disconnected. Nothing keeps running once this returns.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting mesh client");
        self.cancel.cancel();

        self.streams.shutdown().await;
        self.negotiation.shutdown().await;
        self.discovery.clear_cache();
        self.network.disconnect().await?;

        let background: Vec<_> = self.background.lock().drain(..).collect();
        for handle in background {
            let _ = handle.await;
        }
        info!("Mesh client disconnected");
        Ok(())
    }
}

/// Log reliability alerts for operators
fn spawn_alert_logger(
    mut events: broadcast::Receiver<ReliabilityEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ReliabilityEvent::Degraded {
                    peer_id,
                    score,
                    threshold,
                }) => warn!(
                    "Peer {} reliability {:.1} below threshold {:.1}",
                    peer_id, score, threshold
                ),
                Ok(ReliabilityEvent::Blacklisted { peer_id, until }) => {
                    warn!("Peer {} blacklisted until {}", peer_id, until)
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Alert logger skipped {} reliability event(s)", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use infermesh_core::{StreamMessage, StreamStatus, StreamSummary, TokenFrame};
    use infermesh_network::{MemoryNetwork, MemoryPeer, OfferScript};
    use infermesh_settlement::MockLedger;

    use crate::{ClientError, MemoryArchive};

    const WORKLOAD: &str = "llama-3-8b";

    fn caps(price: u64) -> Capabilities {
        Capabilities {
            workloads: [WORKLOAD.to_string()].into_iter().collect(),
            max_units: 4096,
            price_per_unit: price,
            compute_class: Default::default(),
            max_concurrent: 2,
        }
    }

    fn stream(n: u64) -> Vec<StreamMessage> {
        let mut frames: Vec<_> = (0..n)
            .map(|i| StreamMessage::Token(TokenFrame::token(i, format!("w{i}"))))
            .collect();
        frames.push(StreamMessage::End(StreamSummary {
            total_tokens: n,
            duration_ms: 1,
            final_status: StreamStatus::Closed,
        }));
        frames
    }

    #[tokio::test]
    async fn test_request_and_stream() {
        infermesh_logging::init_test_logging();
        let network = Arc::new(MemoryNetwork::new(Duration::from_secs(5)));
        let provider = network.add_peer(
            MemoryPeer::provider(caps(1))
                .offer_script(OfferScript::accept(50))
                .stream_script(stream(4)),
        );
        let client = MeshClient::new(network.clone(), &MeshConfig::default(), None, None).unwrap();

        let template = OfferTemplate::new(WORKLOAD, "hello").offered_price(1_000);
        let outcome = client
            .request_job(&template, &PeerFilter::default(), &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.selected_peer.peer_id, provider);
        assert!(client.discovery().known_peer(&provider).unwrap().latency_ms.is_some());

        let session = client.open_stream(&outcome).await.unwrap();
        let mut text = String::new();
        while let Some(frame) = session.next_token().await {
            text.push_str(&frame.content);
        }
        assert_eq!(text, "w0w1w2w3");
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_settles_with_bridge() {
        let network = Arc::new(MemoryNetwork::new(Duration::from_secs(5)));
        network.add_peer(MemoryPeer::provider(caps(1)));
        let config = MeshConfig::default();
        let bridge = Arc::new(ReconciliationBridge::new(
            Arc::new(MockLedger::new()),
            config.settlement.clone(),
        ));
        let client = MeshClient::new(network, &config, Some(bridge.clone()), None).unwrap();

        let options = RequestOptions {
            negotiate: NegotiateOptions {
                settle: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let template = OfferTemplate::new(WORKLOAD, "hello").offered_price(1_000);
        let outcome = client
            .request_job(&template, &PeerFilter::default(), &options)
            .await
            .unwrap();
        assert!(outcome.is_settled());
        assert!(bridge.mapping(outcome.job_id()).is_some());
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_providers_is_exhaustion() {
        let network = Arc::new(MemoryNetwork::new(Duration::from_secs(5)));
        let client = MeshClient::new(network, &MeshConfig::default(), None, None).unwrap();
        let err = client
            .request_job(
                &OfferTemplate::new(WORKLOAD, "hello"),
                &PeerFilter::default(),
                &RequestOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NoPeerAccepted { attempts: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_streams_and_clears_caches() {
        let network = Arc::new(MemoryNetwork::new(Duration::from_secs(5)));
        let frames: Vec<_> = (0..1000)
            .map(|i| StreamMessage::Token(TokenFrame::token(i, "x")))
            .collect();
        network.add_peer(
            MemoryPeer::provider(caps(1))
                .stream_script(frames)
                .token_delay(Duration::from_millis(10)),
        );
        let archive = Arc::new(MemoryArchive::new());
        let client = MeshClient::new(
            network.clone(),
            &MeshConfig::default(),
            None,
            Some(archive.clone()),
        )
        .unwrap();

        let template = OfferTemplate::new(WORKLOAD, "hello").offered_price(1_000);
        let outcome = client
            .request_job(&template, &PeerFilter::default(), &RequestOptions::default())
            .await
            .unwrap();
        let session = client.open_stream(&outcome).await.unwrap();
        session.next_token().await.unwrap();

        client.disconnect().await.unwrap();
        assert_eq!(session.status(), StreamStatus::Closed);
        assert!(client.discovery().known_peers().is_empty());
        assert!(!network.is_connected());
        assert!(!client.is_connected());
        assert_eq!(archive.len(), 1);

        let err = client
            .find_peers(WORKLOAD, &PeerFilter::default(), &FindOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_announce() {
        let network = Arc::new(MemoryNetwork::new(Duration::from_secs(5)));
        let client = MeshClient::new(network.clone(), &MeshConfig::default(), None, None).unwrap();
        client
            .announce(vec!["/ip4/127.0.0.1/tcp/9400".to_string()], caps(3))
            .await
            .unwrap();
        let announced = network.announced();
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].peer_id, client.peer_id());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let network = Arc::new(MemoryNetwork::new(Duration::from_secs(5)));
        let mut config = MeshConfig::default();
        config.negotiation.max_attempts = 0;
        assert!(matches!(
            MeshClient::new(network, &config, None, None),
            Err(ClientError::Core(_))
        ));
    }
}
