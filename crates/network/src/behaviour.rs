//! Network behaviour for InferMesh
//!
//! Combines Kademlia (capability provider records), Identify, optional mDNS,
//! the JSON negotiation protocol and libp2p-stream for token delivery.
//! DHT key layout and protocol names are defined here.

use std::time::Duration;

use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, identity::Keypair, kad, mdns, request_response, Multiaddr, PeerId, StreamProtocol};
use sha2::{Digest, Sha256};

use infermesh_core::{JobOffer, JobOfferResponse};

use crate::{CapabilityRecord, NetworkConfig};

/// Kademlia protocol name
pub const KADEMLIA_PROTOCOL: StreamProtocol = StreamProtocol::new("/infermesh/kad/1.0.0");

/// Identify protocol version string
pub const IDENTIFY_PROTOCOL: &str = "/infermesh/id/1.0.0";

/// Request-response protocol for job offers
pub const NEGOTIATION_PROTOCOL: StreamProtocol = StreamProtocol::new("/infermesh/negotiate/1.0.0");

/// Stream protocol for token delivery
pub const TOKEN_STREAM_PROTOCOL: StreamProtocol = StreamProtocol::new("/infermesh/tokens/1.0.0");

/// Prefix hashed with a workload id to form its provider key
pub const CAPABILITY_KEY_PREFIX: &str = "/infermesh/capability/";

/// DHT key prefix for a peer's capability record
pub const PEER_RECORD_KEY_PREFIX: &str = "/infermesh/peers/";

/// TTL for capability records and provider entries (5 minutes)
pub const CAPABILITY_RECORD_TTL: Duration = Duration::from_secs(300);

/// Providers re-announce every 2 minutes, well inside the record TTL
pub const CAPABILITY_REANNOUNCE_INTERVAL: Duration = Duration::from_secs(120);

/// Content-derived provider key for a workload
pub fn capability_key(workload: &str) -> kad::RecordKey {
    let digest = Sha256::digest(format!("{}{}", CAPABILITY_KEY_PREFIX, workload).as_bytes());
    kad::RecordKey::new(&digest.to_vec())
}

/// DHT key under which a peer publishes its capability record
pub fn peer_record_key(peer_id: &PeerId) -> kad::RecordKey {
    kad::RecordKey::new(&format!("{}{}", PEER_RECORD_KEY_PREFIX, peer_id).into_bytes())
}

#[derive(NetworkBehaviour)]
pub struct MeshBehaviour {
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub negotiation: request_response::json::Behaviour<JobOffer, JobOfferResponse>,
    pub stream: libp2p_stream::Behaviour,
}

impl MeshBehaviour {
    pub fn new(
        keypair: &Keypair,
        config: &NetworkConfig,
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let local_peer_id = keypair.public().to_peer_id();

        let mut kad_config = kad::Config::new(KADEMLIA_PROTOCOL);
        kad_config
            .set_query_timeout(config.kad_query_timeout)
            .set_record_ttl(Some(CAPABILITY_RECORD_TTL))
            .set_provider_record_ttl(Some(CAPABILITY_RECORD_TTL));
        let mut kademlia = kad::Behaviour::with_config(
            local_peer_id,
            kad::store::MemoryStore::new(local_peer_id),
            kad_config,
        );
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            keypair.public(),
        ));

        let mdns = if config.enable_mdns {
            Toggle::from(Some(mdns::tokio::Behaviour::new(
                mdns::Config::default(),
                local_peer_id,
            )?))
        } else {
            Toggle::from(None)
        };

        let negotiation = request_response::json::Behaviour::new(
            [(NEGOTIATION_PROTOCOL, request_response::ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(config.request_timeout),
        );

        Ok(Self {
            kademlia,
            identify,
            mdns,
            negotiation,
            stream: libp2p_stream::Behaviour::new(),
        })
    }

    /// Add a known address for a peer to the routing table
    pub fn add_address(&mut self, peer_id: &PeerId, addr: Multiaddr) {
        self.kademlia.add_address(peer_id, addr);
    }

    /// Store our capability record and become a provider for each workload
    pub fn announce_capabilities(
        &mut self,
        local_peer_id: &PeerId,
        record: &CapabilityRecord,
    ) -> std::result::Result<(), kad::store::Error> {
        let mut dht_record = kad::Record::new(peer_record_key(local_peer_id), record.to_bytes());
        dht_record.publisher = Some(*local_peer_id);
        self.kademlia.put_record(dht_record, kad::Quorum::One)?;

        for workload in &record.capabilities.workloads {
            self.kademlia.start_providing(capability_key(workload))?;
        }
        Ok(())
    }

    /// Start a provider lookup for a workload
    pub fn find_capability_providers(&mut self, workload: &str) -> kad::QueryId {
        self.kademlia.get_providers(capability_key(workload))
    }

    /// Fetch a provider's capability record
    pub fn fetch_peer_record(&mut self, peer_id: &PeerId) -> kad::QueryId {
        self.kademlia.get_record(peer_record_key(peer_id))
    }
}
