//! Capability records published in the DHT
//!
//! Each provider stores one record under `/infermesh/peers/<peer_id>` and
//! registers as a provider for every workload it serves. Requesters fetch
//! the record after a provider lookup. Records that fail to parse or
//! validate are dropped by the caller without surfacing an error.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use infermesh_core::{now_millis, Capabilities, PeerRecord};

use crate::PeerId;

/// Current capability record format
pub const CAPABILITY_RECORD_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRecord {
    pub version: u16,
    pub peer_id: String,
    /// Multiaddrs the provider listens on
    pub addresses: Vec<String>,
    pub capabilities: Capabilities,
    /// Unix millis when the record was published
    pub timestamp: u64,
}

impl CapabilityRecord {
    pub fn new(peer_id: &str, addresses: Vec<String>, capabilities: Capabilities) -> Self {
        Self {
            version: CAPABILITY_RECORD_VERSION,
            peer_id: peer_id.to_string(),
            addresses,
            capabilities,
            timestamp: now_millis(),
        }
    }

    /// Serialize to JSON bytes for the DHT
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse from JSON bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }

    /// Whether the record is well-formed enough to offer jobs to
    pub fn is_valid(&self) -> bool {
        self.version == CAPABILITY_RECORD_VERSION
            && PeerId::from_str(&self.peer_id).is_ok()
            && !self.capabilities.workloads.is_empty()
            && self.capabilities.max_units > 0
            && self.capabilities.max_concurrent > 0
    }

    /// Parse and validate a record fetched for `provider`.
    ///
    /// A record that claims a different peer id than the provider it was
    /// fetched for is rejected.
    pub fn parse_for(provider: &str, data: &[u8]) -> Option<Self> {
        let record = Self::from_bytes(data)?;
        if !record.is_valid() || record.peer_id != provider {
            return None;
        }
        Some(record)
    }

    /// Convert into the discovery engine's view of the peer
    pub fn into_peer_record(self, reputation: u8, last_seen: u64) -> PeerRecord {
        PeerRecord {
            peer_id: self.peer_id,
            addresses: self.addresses,
            capabilities: self.capabilities,
            latency_ms: None,
            reputation,
            last_seen,
        }
    }

    /// Refresh the publication timestamp before re-announcing
    pub fn refreshed(&self) -> Self {
        Self {
            timestamp: now_millis(),
            ..self.clone()
        }
    }
}
