//! Discovery engine
//!
//! Finds providers for a workload through the network's provider lookup,
//! parses their capability records and keeps two caches:
//!
//! - lookup results per workload, served for `cache_ttl`
//! - known peers by id, refreshed on every contact and evicted after
//!   `peer_ttl` without one
//!
//! Blacklisted peers are removed before anything else looks at the list.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info};

use infermesh_core::{now_millis, DiscoverySettings, PeerRecord};
use infermesh_network::{CapabilityRecord, PeerNetwork};

use crate::{ClientError, ReliabilityTracker, Result};

/// Constraints applied to discovered peers
#[derive(Debug, Clone, Default)]
pub struct PeerFilter {
    /// Peers with a measured latency above this are dropped; unmeasured pass
    pub max_latency_ms: Option<u32>,
    pub min_reputation: Option<u8>,
    /// Maximum price per unit
    pub max_price: Option<u64>,
    /// Preferred peers, sorted first in this order
    pub include: Vec<String>,
    pub exclude: HashSet<String>,
}

impl PeerFilter {
    pub fn prefer(mut self, peer_id: impl Into<String>) -> Self {
        self.include.push(peer_id.into());
        self
    }

    pub fn exclude(mut self, peer_id: impl Into<String>) -> Self {
        self.exclude.insert(peer_id.into());
        self
    }

    fn accepts(&self, peer: &PeerRecord) -> bool {
        if self.exclude.contains(&peer.peer_id) {
            return false;
        }
        if let (Some(max), Some(latency)) = (self.max_latency_ms, peer.latency_ms) {
            if latency > max {
                return false;
            }
        }
        if let Some(min) = self.min_reputation {
            if peer.reputation < min {
                return false;
            }
        }
        if let Some(max) = self.max_price {
            if peer.price() > max {
                return false;
            }
        }
        true
    }
}

/// Per-call lookup options
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Lookup timeout; the configured default when `None`
    pub timeout: Option<Duration>,
    /// Ignore cached results and query the network
    pub force_refresh: bool,
    /// Cap on returned peers; the configured maximum when `None`
    pub limit: Option<usize>,
}

struct CachedLookup {
    peer_ids: Vec<String>,
    fetched_at: Instant,
}

pub struct DiscoveryEngine {
    network: Arc<dyn PeerNetwork>,
    reliability: Arc<ReliabilityTracker>,
    settings: DiscoverySettings,
    lookups: DashMap<String, CachedLookup>,
    known: DashMap<String, PeerRecord>,
}

impl DiscoveryEngine {
    pub fn new(
        network: Arc<dyn PeerNetwork>,
        reliability: Arc<ReliabilityTracker>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            network,
            reliability,
            settings,
            lookups: DashMap::new(),
            known: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &DiscoverySettings {
        &self.settings
    }

    /// Find peers serving `workload`, filtered and sorted.
    ///
    /// Order: preferred peers first, then ascending price, then descending
    /// reliability, then peer id. A lookup that times out yields whatever
    /// was collected so far.
    pub async fn find_peers(
        &self,
        workload: &str,
        filter: &PeerFilter,
        options: &FindOptions,
    ) -> Result<Vec<PeerRecord>> {
        if !self.network.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.evict_stale();

        let peer_ids = match self.cached_lookup(workload, options.force_refresh) {
            Some(peer_ids) => {
                debug!("Serving {} peer(s) for {} from cache", peer_ids.len(), workload);
                peer_ids
            }
            None => self.lookup(workload, options).await?,
        };

        let now = now_millis();
        let cache_ttl = self.settings.cache_ttl();
        let mut peers: Vec<PeerRecord> = peer_ids
            .iter()
            .filter_map(|id| self.known.get(id).map(|p| p.clone()))
            .filter(|p| p.capabilities.supports(workload))
            .filter(|p| !p.is_stale(cache_ttl, now))
            .filter(|p| !self.reliability.is_blacklisted(&p.peer_id))
            .map(|mut p| {
                p.reputation = self.reliability.reputation(&p.peer_id);
                p
            })
            .filter(|p| filter.accepts(p))
            .collect();

        self.sort_peers(&mut peers, &filter.include);
        peers.truncate(options.limit.unwrap_or(self.settings.max_results));
        Ok(peers)
    }

    fn cached_lookup(&self, workload: &str, force_refresh: bool) -> Option<Vec<String>> {
        if force_refresh {
            return None;
        }
        let cached = self.lookups.get(workload)?;
        if cached.fetched_at.elapsed() > self.settings.cache_ttl() {
            return None;
        }
        Some(cached.peer_ids.clone())
    }

    async fn lookup(&self, workload: &str, options: &FindOptions) -> Result<Vec<String>> {
        let timeout = options.timeout.unwrap_or(self.settings.lookup_timeout());
        let deadline = Instant::now() + timeout;
        let local = self.network.local_peer_id();
        let mut hits = self.network.find_providers(workload).await?;

        let mut peer_ids = Vec::new();
        let mut seen = HashSet::new();
        let mut dropped = 0usize;
        let mut completed = true;

        loop {
            let hit = match tokio::time::timeout_at(deadline, hits.recv()).await {
                Ok(Some(hit)) => hit,
                Ok(None) => break,
                Err(_) => {
                    completed = false;
                    break;
                }
            };
            if hit.peer_id == local || !seen.insert(hit.peer_id.clone()) {
                continue;
            }
            let Some(record) = CapabilityRecord::parse_for(&hit.peer_id, &hit.record) else {
                dropped += 1;
                continue;
            };
            if !record.capabilities.supports(workload) {
                continue;
            }
            self.upsert(record);
            peer_ids.push(hit.peer_id);
        }

        if dropped > 0 {
            debug!("Dropped {} malformed capability record(s) for {}", dropped, workload);
        }
        if completed {
            self.lookups.insert(
                workload.to_string(),
                CachedLookup {
                    peer_ids: peer_ids.clone(),
                    fetched_at: Instant::now(),
                },
            );
        } else {
            info!(
                "Lookup for {} timed out after {:?} with {} peer(s)",
                workload,
                timeout,
                peer_ids.len()
            );
        }
        Ok(peer_ids)
    }

    /// Insert or refresh a peer from a fresh capability record, keeping the
    /// last measured latency
    fn upsert(&self, record: CapabilityRecord) {
        let reputation = self.reliability.reputation(&record.peer_id);
        let now = now_millis();
        self.known
            .entry(record.peer_id.clone())
            .and_modify(|p| {
                p.addresses = record.addresses.clone();
                p.capabilities = record.capabilities.clone();
                p.reputation = reputation;
                p.last_seen = now;
            })
            .or_insert_with(|| record.into_peer_record(reputation, now));
    }

    fn sort_peers(&self, peers: &mut [PeerRecord], preferred: &[String]) {
        let rank: HashMap<&str, usize> = preferred
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let scores: HashMap<String, f64> = peers
            .iter()
            .map(|p| (p.peer_id.clone(), self.reliability.score(&p.peer_id)))
            .collect();

        peers.sort_by(|a, b| {
            let ra = rank.get(a.peer_id.as_str()).copied().unwrap_or(usize::MAX);
            let rb = rank.get(b.peer_id.as_str()).copied().unwrap_or(usize::MAX);
            ra.cmp(&rb)
                .then(a.price().cmp(&b.price()))
                .then_with(|| {
                    let sa = scores.get(&a.peer_id).copied().unwrap_or_default();
                    let sb = scores.get(&b.peer_id).copied().unwrap_or_default();
                    sb.partial_cmp(&sa).unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
    }

    /// Record a successful contact with a peer
    pub fn touch(&self, peer_id: &str, latency_ms: Option<u32>) {
        if let Some(mut peer) = self.known.get_mut(peer_id) {
            peer.last_seen = now_millis();
            if latency_ms.is_some() {
                peer.latency_ms = latency_ms;
            }
        }
    }

    pub fn known_peer(&self, peer_id: &str) -> Option<PeerRecord> {
        self.known.get(peer_id).map(|p| p.clone())
    }

    pub fn known_peers(&self) -> Vec<PeerRecord> {
        self.known.iter().map(|p| p.clone()).collect()
    }

    /// Drop peers not contacted within the peer TTL
    pub fn evict_stale(&self) -> usize {
        let now = now_millis();
        let ttl = self.settings.peer_ttl();
        let before = self.known.len();
        self.known.retain(|_, peer| !peer.is_stale(ttl, now));
        let evicted = before.saturating_sub(self.known.len());
        if evicted > 0 {
            debug!("Evicted {} stale peer(s)", evicted);
        }
        evicted
    }

    /// Forget all cached lookups and known peers
    pub fn clear_cache(&self) {
        self.lookups.clear();
        self.known.clear();
        debug!("Discovery caches cleared");
    }

    pub fn cached_workloads(&self) -> Vec<String> {
        self.lookups.iter().map(|e| e.key().clone()).collect()
    }
}
