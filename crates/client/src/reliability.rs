//! Per-peer reliability history and blacklist
//!
//! Records live in a `DashMap` keyed by peer id. An outcome is applied while
//! holding that peer's entry, so concurrent outcomes for one peer are
//! serialized and outcomes for different peers do not contend.
//!
//! Score (0-100):
//!
//! ```text
//! 100 * ( success_weight  * success_rate
//!       + response_weight * (latency + stability) / 2
//!       + recency_weight  * (last outcome was a success) )
//! latency   = 1 / (1 + avg_response_ms / reference_ms)
//! stability = 1 / (1 + stddev_response_ms / reference_ms)
//! ```
//!
//! A peer with no history scores [`DEFAULT_REPUTATION`].

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use infermesh_core::{now_millis, ReliabilitySettings, DEFAULT_REPUTATION};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReliabilityRecord {
    pub peer_id: String,
    pub total_jobs: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub average_response_time_ms: f64,
    /// Sum of squared deviations from the mean response time
    pub response_time_m2: f64,
    pub reliability_score: f64,
    pub consecutive_failures: u32,
    pub last_success_at: Option<u64>,
    pub last_failure_at: Option<u64>,
    pub blacklisted_until: Option<u64>,
    pub last_outcome_success: Option<bool>,
}

impl ReliabilityRecord {
    pub fn new(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            total_jobs: 0,
            successful_jobs: 0,
            failed_jobs: 0,
            average_response_time_ms: 0.0,
            response_time_m2: 0.0,
            reliability_score: DEFAULT_REPUTATION as f64,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            blacklisted_until: None,
            last_outcome_success: None,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_jobs == 0 {
            return 0.0;
        }
        self.successful_jobs as f64 / self.total_jobs as f64
    }

    pub fn response_time_stddev_ms(&self) -> f64 {
        if self.total_jobs < 2 {
            return 0.0;
        }
        (self.response_time_m2 / self.total_jobs as f64).sqrt()
    }

    pub fn is_blacklisted_at(&self, now: u64) -> bool {
        self.blacklisted_until.map(|until| now < until).unwrap_or(false)
    }

    fn score(&self, settings: &ReliabilitySettings) -> f64 {
        if self.total_jobs == 0 {
            return DEFAULT_REPUTATION as f64;
        }
        let reference = settings.reference_response_ms.max(1.0);
        let latency = 1.0 / (1.0 + self.average_response_time_ms / reference);
        let stability = 1.0 / (1.0 + self.response_time_stddev_ms() / reference);
        let recency = if self.last_outcome_success == Some(true) {
            1.0
        } else {
            0.0
        };
        let score = settings.success_weight * self.success_rate()
            + settings.response_weight * (latency + stability) / 2.0
            + settings.recency_weight * recency;
        (score * 100.0).clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReliabilityEvent {
    /// Score dropped below the alert threshold
    Degraded {
        peer_id: String,
        score: f64,
        threshold: f64,
    },
    /// Consecutive failures reached the threshold
    Blacklisted { peer_id: String, until: u64 },
}

pub struct ReliabilityTracker {
    settings: ReliabilitySettings,
    records: DashMap<String, ReliabilityRecord>,
    events: broadcast::Sender<ReliabilityEvent>,
}

impl ReliabilityTracker {
    pub fn new(settings: ReliabilitySettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings,
            records: DashMap::new(),
            events,
        }
    }

    pub fn settings(&self) -> &ReliabilitySettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReliabilityEvent> {
        self.events.subscribe()
    }

    pub fn record_outcome(&self, peer_id: &str, success: bool, response_time_ms: u64) -> ReliabilityRecord {
        self.record_outcome_at(peer_id, success, response_time_ms, now_millis())
    }

    /// Apply one outcome as of `now` (unix millis)
    pub fn record_outcome_at(
        &self,
        peer_id: &str,
        success: bool,
        response_time_ms: u64,
        now: u64,
    ) -> ReliabilityRecord {
        let mut events = Vec::new();

        let updated = {
            let mut entry = self
                .records
                .entry(peer_id.to_string())
                .or_insert_with(|| ReliabilityRecord::new(peer_id));
            let record = entry.value_mut();
            let had_history = record.total_jobs > 0;
            let previous_score = record.reliability_score;

            record.total_jobs += 1;
            let sample = response_time_ms as f64;
            let delta = sample - record.average_response_time_ms;
            record.average_response_time_ms += delta / record.total_jobs as f64;
            record.response_time_m2 += delta * (sample - record.average_response_time_ms);

            if success {
                record.successful_jobs += 1;
                record.consecutive_failures = 0;
                record.last_success_at = Some(now);
            } else {
                record.failed_jobs += 1;
                let window = self.settings.tracking_window_ms;
                let within_window = record
                    .last_failure_at
                    .map(|at| now.saturating_sub(at) <= window)
                    .unwrap_or(false);
                if !within_window {
                    record.consecutive_failures = 0;
                }
                record.consecutive_failures += 1;
                record.last_failure_at = Some(now);

                if record.consecutive_failures >= self.settings.failure_threshold
                    && !record.is_blacklisted_at(now)
                {
                    let until = now + self.settings.blacklist_duration_ms;
                    record.blacklisted_until = Some(until);
                    record.consecutive_failures = 0;
                    warn!("Peer {} blacklisted until {}", peer_id, until);
                    events.push(ReliabilityEvent::Blacklisted {
                        peer_id: peer_id.to_string(),
                        until,
                    });
                }
            }
            record.last_outcome_success = Some(success);
            record.reliability_score = record.score(&self.settings);

            let threshold = self.settings.alert_threshold;
            let crossed = record.reliability_score < threshold
                && (!had_history || previous_score >= threshold);
            if crossed {
                warn!(
                    "Peer {} reliability {:.1} below {:.1}",
                    peer_id, record.reliability_score, threshold
                );
                events.push(ReliabilityEvent::Degraded {
                    peer_id: peer_id.to_string(),
                    score: record.reliability_score,
                    threshold,
                });
            }

            debug!(
                "Peer {} outcome {}: {}/{} ok, score {:.1}",
                peer_id,
                if success { "success" } else { "failure" },
                record.successful_jobs,
                record.total_jobs,
                record.reliability_score
            );
            record.clone()
        };

        for event in events {
            let _ = self.events.send(event);
        }
        updated
    }

    pub fn reliability(&self, peer_id: &str) -> Option<ReliabilityRecord> {
        self.records.get(peer_id).map(|r| r.clone())
    }

    pub fn is_blacklisted(&self, peer_id: &str) -> bool {
        self.is_blacklisted_at(peer_id, now_millis())
    }

    pub fn is_blacklisted_at(&self, peer_id: &str, now: u64) -> bool {
        self.records
            .get(peer_id)
            .map(|r| r.is_blacklisted_at(now))
            .unwrap_or(false)
    }

    /// Score on the 0-100 scale, or the default for unknown peers
    pub fn score(&self, peer_id: &str) -> f64 {
        self.records
            .get(peer_id)
            .map(|r| r.reliability_score)
            .unwrap_or(DEFAULT_REPUTATION as f64)
    }

    /// Score rounded for [`infermesh_core::PeerRecord::reputation`]
    pub fn reputation(&self, peer_id: &str) -> u8 {
        self.score(peer_id).round().clamp(0.0, 100.0) as u8
    }

    /// All records, for persistence
    pub fn snapshot(&self) -> Vec<ReliabilityRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        records
    }

    /// Load records saved by [`ReliabilityTracker::snapshot`].
    ///
    /// Records whose counters do not add up are skipped.
    pub fn restore(&self, records: Vec<ReliabilityRecord>) -> usize {
        let mut restored = 0;
        for record in records {
            if record.total_jobs != record.successful_jobs + record.failed_jobs {
                warn!("Skipping inconsistent reliability record for {}", record.peer_id);
                continue;
            }
            self.records.insert(record.peer_id.clone(), record);
            restored += 1;
        }
        restored
    }

    pub fn forget(&self, peer_id: &str) -> bool {
        self.records.remove(peer_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tracker() -> ReliabilityTracker {
        ReliabilityTracker::new(ReliabilitySettings::default())
    }

    #[test]
    fn test_totals_always_add_up() {
        let t = tracker();
        let outcomes = [true, false, true, true, false, false, true, false, false, false];
        for (i, ok) in outcomes.iter().enumerate() {
            let r = t.record_outcome_at("p", *ok, 100, 1_000 + i as u64);
            assert_eq!(r.total_jobs, r.successful_jobs + r.failed_jobs);
        }
        assert_eq!(t.reliability("p").unwrap().total_jobs, outcomes.len() as u64);
    }

    #[test]
    fn test_three_consecutive_failures_blacklist_until_expiry() {
        let t = tracker();
        let now = 10_000;
        t.record_outcome_at("p", false, 100, now);
        t.record_outcome_at("p", false, 100, now + 1);
        assert!(!t.is_blacklisted_at("p", now + 2));
        t.record_outcome_at("p", false, 100, now + 2);
        assert!(t.is_blacklisted_at("p", now + 3));

        let until = t.reliability("p").unwrap().blacklisted_until.unwrap();
        assert_eq!(until, now + 2 + 300_000);
        assert!(t.is_blacklisted_at("p", until - 1));
        assert!(!t.is_blacklisted_at("p", until));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let t = tracker();
        t.record_outcome_at("p", false, 100, 1);
        t.record_outcome_at("p", false, 100, 2);
        t.record_outcome_at("p", true, 100, 3);
        t.record_outcome_at("p", false, 100, 4);
        t.record_outcome_at("p", false, 100, 5);
        assert!(!t.is_blacklisted_at("p", 6));
    }

    #[test]
    fn test_failures_outside_window_not_consecutive() {
        let t = tracker();
        t.record_outcome_at("p", false, 100, 0);
        t.record_outcome_at("p", false, 100, 1);
        t.record_outcome_at("p", false, 100, 1 + 600_001);
        assert!(!t.is_blacklisted_at("p", 1 + 600_002));
        assert_eq!(t.reliability("p").unwrap().consecutive_failures, 1);
    }

    #[test]
    fn test_single_failure_degrades_without_collapse() {
        let t = tracker();
        for i in 0..10 {
            t.record_outcome_at("p", true, 100, i);
        }
        let before = t.score("p");
        t.record_outcome_at("p", false, 100, 11);
        let after = t.score("p");
        assert!(after < before);
        assert!(after > before / 2.0, "score collapsed: {} -> {}", before, after);
        assert!(after > 70.0);
    }

    #[test]
    fn test_faster_and_steadier_scores_higher() {
        let t = tracker();
        for i in 0..5 {
            t.record_outcome_at("fast", true, 100, i);
            t.record_outcome_at("slow", true, 3_000, i);
            t.record_outcome_at("jittery", true, if i % 2 == 0 { 50 } else { 2_000 }, i);
        }
        assert!(t.score("fast") > t.score("slow"));
        assert!(t.score("fast") > t.score("jittery"));
    }

    #[test]
    fn test_unknown_peer_defaults() {
        let t = tracker();
        assert_eq!(t.reputation("nobody"), DEFAULT_REPUTATION);
        assert!(!t.is_blacklisted("nobody"));
        assert!(t.reliability("nobody").is_none());
    }

    #[test]
    fn test_reads_do_not_mutate() {
        let t = tracker();
        t.record_outcome_at("p", true, 100, 1);
        let before = t.reliability("p").unwrap();
        let _ = t.is_blacklisted("p");
        let _ = t.score("p");
        assert_eq!(t.reliability("p").unwrap(), before);
    }

    #[test]
    fn test_degraded_alert_on_crossing() {
        let t = tracker();
        let mut events = t.subscribe();
        for i in 0..5 {
            t.record_outcome_at("p", true, 100, i);
        }
        assert!(events.try_recv().is_err());

        let mut degraded = 0;
        for i in 5..9 {
            t.record_outcome_at("p", false, 100, i);
        }
        while let Ok(event) = events.try_recv() {
            if let ReliabilityEvent::Degraded { peer_id, score, threshold } = event {
                assert_eq!(peer_id, "p");
                assert!(score < threshold);
                assert_eq!(threshold, 70.0);
                degraded += 1;
            }
        }
        assert_eq!(degraded, 1);
    }

    #[test]
    fn test_blacklist_event() {
        let t = tracker();
        let mut events = t.subscribe();
        for i in 0..3 {
            t.record_outcome_at("p", false, 100, i);
        }
        let mut blacklisted = false;
        while let Ok(event) = events.try_recv() {
            if let ReliabilityEvent::Blacklisted { peer_id, until } = event {
                assert_eq!(peer_id, "p");
                assert_eq!(until, 2 + 300_000);
                blacklisted = true;
            }
        }
        assert!(blacklisted);
    }

    #[test]
    fn test_snapshot_restore() {
        let t = tracker();
        t.record_outcome_at("a", true, 100, 1);
        t.record_outcome_at("b", false, 200, 2);
        let snapshot = t.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();

        let restored = tracker();
        let records: Vec<ReliabilityRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.restore(records), 2);
        let b = restored.reliability("b").unwrap();
        assert_eq!((b.total_jobs, b.failed_jobs), (1, 1));
        assert_eq!(b.last_failure_at, Some(2));
        assert_eq!(restored.reputation("a"), t.reputation("a"));

        let mut bad = ReliabilityRecord::new("c");
        bad.total_jobs = 5;
        assert_eq!(restored.restore(vec![bad]), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_outcomes_for_one_peer() {
        let t = Arc::new(tracker());
        let mut handles = Vec::new();
        for task in 0..8 {
            let t = t.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..100 {
                    t.record_outcome("shared", (task + i) % 3 != 0, 50);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let r = t.reliability("shared").unwrap();
        assert_eq!(r.total_jobs, 800);
        assert_eq!(r.total_jobs, r.successful_jobs + r.failed_jobs);
    }
}
