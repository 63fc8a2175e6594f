//! Configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{BackoffPolicy, Capabilities, ComputeClass, CoreError, Result};

/// Complete runtime configuration, one section per component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub negotiation: NegotiationSettings,

    #[serde(default)]
    pub reliability: ReliabilitySettings,

    #[serde(default)]
    pub streaming: StreamingSettings,

    #[serde(default)]
    pub settlement: SettlementSettings,

    /// Provider-side settings (only used when serving jobs)
    #[serde(default)]
    pub provider: ProviderSettings,
}

impl MeshConfig {
    /// Reject values no component can run with
    pub fn validate(&self) -> Result<()> {
        if self.negotiation.max_attempts == 0 {
            return Err(CoreError::InvalidConfig("negotiation.max_attempts is 0".to_string()));
        }
        if self.reliability.failure_threshold == 0 {
            return Err(CoreError::InvalidConfig(
                "reliability.failure_threshold is 0".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.reliability.alert_threshold) {
            return Err(CoreError::InvalidConfig(format!(
                "reliability.alert_threshold {} outside 0-100",
                self.reliability.alert_threshold
            )));
        }
        if self.settlement.submit_attempts == 0 {
            return Err(CoreError::InvalidConfig("settlement.submit_attempts is 0".to_string()));
        }
        if self.streaming.reorder_window == 0 {
            return Err(CoreError::InvalidConfig("streaming.reorder_window is 0".to_string()));
        }
        if self.streaming.metrics_interval_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "streaming.metrics_interval_ms is 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

/// Transport node settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Bootstrap peers (format: "peer_id@multiaddr")
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    /// Local peer discovery via mDNS
    #[serde(default = "default_true")]
    pub enable_mdns: bool,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Kademlia query timeout
    #[serde(default = "default_kad_query_timeout")]
    pub kad_query_timeout_secs: u64,

    #[serde(default = "default_dial_base_delay")]
    pub dial_base_delay_ms: u64,

    #[serde(default = "default_dial_max_delay")]
    pub dial_max_delay_ms: u64,

    /// Retries per address before it is given up on
    #[serde(default = "default_dial_max_retries")]
    pub dial_max_retries: u32,

    /// Identity keyfile path
    #[serde(default)]
    pub keyfile: Option<String>,
}

fn default_listen_addr() -> String {
    "/ip4/0.0.0.0/tcp/9400".to_string()
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_kad_query_timeout() -> u64 {
    60
}

fn default_dial_base_delay() -> u64 {
    500
}

fn default_dial_max_delay() -> u64 {
    30_000
}

fn default_dial_max_retries() -> u32 {
    5
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bootstrap_peers: Vec::new(),
            enable_mdns: true,
            idle_timeout_secs: default_idle_timeout(),
            kad_query_timeout_secs: default_kad_query_timeout(),
            dial_base_delay_ms: default_dial_base_delay(),
            dial_max_delay_ms: default_dial_max_delay(),
            dial_max_retries: default_dial_max_retries(),
            keyfile: None,
        }
    }
}

impl NetworkSettings {
    pub fn dial_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.dial_base_delay_ms),
            self.dial_max_retries,
        )
        .with_max_delay(Duration::from_millis(self.dial_max_delay_ms))
    }
}

/// Discovery engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Provider lookup timeout; partial results are returned when it fires
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_ms: u64,

    /// How long a capability lookup result is served from cache
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_ms: u64,

    /// Known peers not contacted for this long are evicted
    #[serde(default = "default_peer_ttl")]
    pub peer_ttl_ms: u64,

    /// Upper bound on peers returned per lookup
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

fn default_lookup_timeout() -> u64 {
    60_000
}

fn default_cache_ttl() -> u64 {
    60_000
}

fn default_peer_ttl() -> u64 {
    300_000
}

fn default_max_results() -> usize {
    32
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            lookup_timeout_ms: default_lookup_timeout(),
            cache_ttl_ms: default_cache_ttl(),
            peer_ttl_ms: default_peer_ttl(),
            max_results: default_max_results(),
        }
    }
}

impl DiscoverySettings {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_millis(self.peer_ttl_ms)
    }
}

/// How offers are sent to candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationMode {
    /// One candidate at a time; first acceptance wins
    #[default]
    Cascading,
    /// All candidates at once; best score before the deadline wins
    Parallel,
}

/// Negotiation engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationSettings {
    #[serde(default)]
    pub mode: NegotiationMode,

    /// Candidates tried per negotiation
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Per-offer response timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Shared deadline for parallel mode
    #[serde(default = "default_parallel_deadline")]
    pub parallel_deadline_ms: u64,
}

fn default_max_attempts() -> usize {
    3
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_parallel_deadline() -> u64 {
    15_000
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            mode: NegotiationMode::default(),
            max_attempts: default_max_attempts(),
            request_timeout_ms: default_request_timeout(),
            parallel_deadline_ms: default_parallel_deadline(),
        }
    }
}

impl NegotiationSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn parallel_deadline(&self) -> Duration {
        Duration::from_millis(self.parallel_deadline_ms)
    }
}

/// Reliability tracker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilitySettings {
    /// Consecutive failures that trigger a blacklist
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_blacklist_duration")]
    pub blacklist_duration_ms: u64,

    /// Failures further apart than this do not count as consecutive
    #[serde(default = "default_tracking_window")]
    pub tracking_window_ms: u64,

    /// Scores below this raise a degradation alert
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,

    #[serde(default = "default_success_weight")]
    pub success_weight: f64,

    #[serde(default = "default_response_weight")]
    pub response_weight: f64,

    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,

    /// Response time that halves the responsiveness component
    #[serde(default = "default_reference_response")]
    pub reference_response_ms: f64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_blacklist_duration() -> u64 {
    300_000
}

fn default_tracking_window() -> u64 {
    600_000
}

fn default_alert_threshold() -> f64 {
    70.0
}

fn default_success_weight() -> f64 {
    0.7
}

fn default_response_weight() -> f64 {
    0.2
}

fn default_recency_weight() -> f64 {
    0.1
}

fn default_reference_response() -> f64 {
    1_000.0
}

impl Default for ReliabilitySettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            blacklist_duration_ms: default_blacklist_duration(),
            tracking_window_ms: default_tracking_window(),
            alert_threshold: default_alert_threshold(),
            success_weight: default_success_weight(),
            response_weight: default_response_weight(),
            recency_weight: default_recency_weight(),
            reference_response_ms: default_reference_response(),
        }
    }
}

impl ReliabilitySettings {
    pub fn blacklist_duration(&self) -> Duration {
        Duration::from_millis(self.blacklist_duration_ms)
    }
}

/// Streaming transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingSettings {
    /// Interval between periodic metrics events
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_ms: u64,

    /// Out-of-order frames buffered before a gap is declared
    #[serde(default = "default_reorder_window")]
    pub reorder_window: usize,

    /// Token channel capacity towards the consumer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_metrics_interval() -> u64 {
    1_000
}

fn default_reorder_window() -> usize {
    256
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            metrics_interval_ms: default_metrics_interval(),
            reorder_window: default_reorder_window(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl StreamingSettings {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

/// Which ledger implementation to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LedgerMode {
    /// In-memory ledger for development and tests
    #[default]
    Mock,
    /// JSON-RPC settlement gateway
    Rpc,
}

/// Settlement and reconciliation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementSettings {
    #[serde(default)]
    pub mode: LedgerMode,

    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Confirmations after which a submission counts as final
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u64,

    /// Submission attempts, including the first
    #[serde(default = "default_submit_attempts")]
    pub submit_attempts: u32,

    #[serde(default = "default_submit_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_submit_max_delay")]
    pub max_delay_ms: u64,

    /// Keep a negotiated job as peer-only when submission fails
    #[serde(default = "default_true")]
    pub peer_only_fallback: bool,

    /// Poll interval for ledger events (RPC mode)
    #[serde(default = "default_event_poll_interval")]
    pub event_poll_interval_ms: u64,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_required_confirmations() -> u64 {
    3
}

fn default_submit_attempts() -> u32 {
    3
}

fn default_submit_base_delay() -> u64 {
    500
}

fn default_submit_max_delay() -> u64 {
    10_000
}

fn default_event_poll_interval() -> u64 {
    2_000
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self {
            mode: LedgerMode::default(),
            rpc_url: default_rpc_url(),
            required_confirmations: default_required_confirmations(),
            submit_attempts: default_submit_attempts(),
            base_delay_ms: default_submit_base_delay(),
            max_delay_ms: default_submit_max_delay(),
            peer_only_fallback: true,
            event_poll_interval_ms: default_event_poll_interval(),
        }
    }
}

impl SettlementSettings {
    /// Backoff for `attempts` total submission attempts
    pub fn submit_backoff(&self, attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            attempts.saturating_sub(1),
        )
        .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }
}

/// Provider-side settings for answering offers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Workloads served; empty means the node does not serve jobs
    #[serde(default)]
    pub workloads: Vec<String>,

    #[serde(default = "default_price_per_unit")]
    pub price_per_unit: u64,

    #[serde(default = "default_max_units")]
    pub max_units: u64,

    #[serde(default)]
    pub compute_class: ComputeClass,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    /// Estimated processing time per unit
    #[serde(default = "default_ms_per_unit")]
    pub ms_per_unit: u64,
}

fn default_price_per_unit() -> u64 {
    1
}

fn default_max_units() -> u64 {
    4_096
}

fn default_max_concurrent() -> u32 {
    4
}

fn default_ms_per_unit() -> u64 {
    20
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            workloads: Vec::new(),
            price_per_unit: default_price_per_unit(),
            max_units: default_max_units(),
            compute_class: ComputeClass::default(),
            max_concurrent: default_max_concurrent(),
            ms_per_unit: default_ms_per_unit(),
        }
    }
}

impl ProviderSettings {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            workloads: self.workloads.iter().cloned().collect(),
            max_units: self.max_units,
            price_per_unit: self.price_per_unit,
            compute_class: self.compute_class,
            max_concurrent: self.max_concurrent,
        }
    }
}
