//! InferMesh Client
//!
//! Requester side of the coordination layer.
//!
//! ## Components
//!
//! - [`DiscoveryEngine`]: provider lookup, capability filtering, peer caches
//! - [`ReliabilityTracker`]: per-peer outcome history and blacklist
//! - [`NegotiationEngine`]: cascading and parallel job offers, settlement handoff
//! - [`StreamManager`]: resumable, pausable token streams
//! - [`MeshClient`]: everything above behind one handle

mod archive;
mod client;
mod discovery;
mod error;
mod negotiation;
mod reliability;
mod streaming;

pub use archive::{ConversationArchive, MemoryArchive, Transcript};
pub use client::{MeshClient, RequestOptions};
pub use discovery::{DiscoveryEngine, FindOptions, PeerFilter};
pub use error::{AttemptFailure, AttemptRecord, ClientError, Result};
pub use negotiation::{
    NegotiateOptions, NegotiationEngine, NegotiationOutcome, OfferTemplate, SettlementOutcome,
};
pub use reliability::{ReliabilityEvent, ReliabilityRecord, ReliabilityTracker};
pub use streaming::{SessionEvent, StreamManager, StreamMetrics, StreamSession};
