//! InferMesh Network
//!
//! libp2p transport for the coordination layer.
//!
//! ## Features
//!
//! - Capability discovery via Kademlia provider records
//! - Local discovery via mDNS
//! - Job negotiation over a JSON request-response protocol
//! - Token streaming over libp2p-stream
//! - Per-address dial backoff and deterministic disconnect
//! - An in-memory network with the same interface for tests and simulation

mod behaviour;
mod error;
pub mod memory;
mod network;
mod node;
mod protocol;
mod provider;
mod record;

pub use behaviour::{
    MeshBehaviour, MeshBehaviourEvent,
    KADEMLIA_PROTOCOL, IDENTIFY_PROTOCOL, NEGOTIATION_PROTOCOL, TOKEN_STREAM_PROTOCOL,
    CAPABILITY_KEY_PREFIX, PEER_RECORD_KEY_PREFIX,
    CAPABILITY_RECORD_TTL, CAPABILITY_REANNOUNCE_INTERVAL,
    capability_key, peer_record_key,
};
pub use error::{NetworkError, Result};
pub use memory::{MemoryNetwork, MemoryPeer, OfferScript};
pub use network::{PeerNetwork, ProviderHit};
pub use node::{build_swarm, parse_bootstrap_peer, NetworkConfig, TransportNode};
pub use protocol::{read_frame, write_frame, read_json_frame, write_json_frame, MAX_FRAME_SIZE};
pub use provider::{OfferEvaluator, OfferHandler, TokenSource};
pub use record::{CapabilityRecord, CAPABILITY_RECORD_VERSION};

// Re-export commonly used libp2p types
pub use libp2p::identity::Keypair;
pub use libp2p::{Multiaddr, PeerId};
