//! Capability interface over the peer-to-peer network
//!
//! Discovery, negotiation and streaming talk to peers only through
//! [`PeerNetwork`]. [`crate::TransportNode`] implements it over libp2p and
//! [`crate::MemoryNetwork`] implements it in memory; the choice is made once,
//! when the client is constructed.

use async_trait::async_trait;
use tokio::sync::mpsc;

use infermesh_core::{JobOffer, JobOfferResponse, PeerRecord, StreamMessage, StreamOpen};

use crate::{CapabilityRecord, Result};

/// One provider found by a capability lookup
#[derive(Debug, Clone)]
pub struct ProviderHit {
    /// Peer id the DHT returned as provider
    pub peer_id: String,
    /// Raw capability record bytes, not yet validated
    pub record: Vec<u8>,
}

#[async_trait]
pub trait PeerNetwork: Send + Sync + 'static {
    fn local_peer_id(&self) -> String;

    /// False once `disconnect` has started
    fn is_connected(&self) -> bool;

    /// Publish our capability record and provider entries
    async fn announce(&self, record: CapabilityRecord) -> Result<()>;

    /// Start a provider lookup for a workload.
    ///
    /// Hits arrive on the returned channel as they are found; the channel
    /// closes when the lookup finishes. Callers apply their own deadline.
    async fn find_providers(&self, workload: &str) -> Result<mpsc::Receiver<ProviderHit>>;

    /// Send an offer and wait for the peer's response
    async fn send_offer(&self, peer: &PeerRecord, offer: JobOffer) -> Result<JobOfferResponse>;

    /// Open a token stream for an accepted job.
    ///
    /// Frames are delivered as received, without reordering or
    /// deduplication. The channel closes when the stream ends.
    async fn open_token_stream(
        &self,
        peer: &PeerRecord,
        open: StreamOpen,
    ) -> Result<mpsc::Receiver<StreamMessage>>;

    /// Cancel pending dials, stop stream readers and shut the node down.
    /// Resolves once everything has stopped.
    async fn disconnect(&self) -> Result<()>;
}
