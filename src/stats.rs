//! C12: statistics API.
//!
//! Atomic counters updated off the hot path without locking, a single
//! short-lived read lock for composing a point-in-time `Snapshot`, and a
//! broadcast channel for alert events — grounded on `dashboard.rs`'s
//! `DashboardStats`/`AtomicU64` fields and its `broadcast::Sender`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::broadcast;

use crate::error::{ErrorKind, Health};
use crate::{Action, ThreatLevel};

const ALERT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast event emitted whenever a threat at or above `Medium` is
/// classified, independent of what defensive action was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub source: std::net::IpAddr,
    pub level: ThreatLevel,
    pub action: Action,
    pub timestamp_secs: f64,
}

/// A single defensive outcome bucket, used both to record and to name the
/// `defense_outcomes` snapshot fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefenseOutcome {
    PermanentBlock,
    TempBlock,
    WarningBlock,
    Monitored,
}

#[derive(Default)]
struct Counters {
    packets_seen: AtomicU64,
    packets_dropped: AtomicU64,
    threats_detected: AtomicU64,
    blocks_applied: AtomicU64,
    rate_limits_applied: AtomicU64,
    training_steps: AtomicU64,
    threats_by_tier: [AtomicU64; 5],
    permanent_block: AtomicU64,
    temp_block: AtomicU64,
    warning_block: AtomicU64,
    monitored: AtomicU64,
    accumulated_blocks: AtomicU64,
    alerts: AtomicU64,
    ml_predictions: AtomicU64,
    ml_correct: AtomicU64,
    ml_updates: AtomicU64,
}

/// Per-tier threat counts, broken out by `ThreatLevel` variant name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatsByTier {
    pub safe: u64,
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
}

/// Counts of defensive outcomes actually reached, broken out by the final
/// block-state/action bucket rather than the action requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefenseOutcomes {
    pub permanent_block: u64,
    pub temp_block: u64,
    pub warning_block: u64,
    pub monitored: u64,
    pub alerts: u64,
    pub accumulated_blocks: u64,
}

/// Coarse running estimate of classifier/agent quality: `accuracy_estimate`
/// is the fraction of ML-driven predictions later deemed correct (e.g. a
/// block on traffic later confirmed malicious), not a held-out test score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlStats {
    pub predictions: u64,
    pub accuracy_estimate: f32,
    pub updates: u64,
}

/// Point-in-time snapshot returned by `Statistics::snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub packets_seen: u64,
    pub packets_dropped: u64,
    pub threats_detected: u64,
    pub blocks_applied: u64,
    pub rate_limits_applied: u64,
    pub training_steps: u64,
    pub queue_utilization: f32,
    pub cpu_percent: f32,
    pub rss_mb: f32,
    pub error_counts_by_kind: HashMap<String, u64>,
    pub health: Health,
    pub uptime_secs: f64,
    pub threats_by_tier: ThreatsByTier,
    pub defense_outcomes: DefenseOutcomes,
    pub ml_stats: MlStats,
}

/// Central statistics aggregator. Counters are lock-free; `error_counts`
/// uses a short-lived write lock only on increment and read lock only
/// during `snapshot()`.
pub struct Statistics {
    counters: Counters,
    error_counts: RwLock<HashMap<ErrorKind, u64>>,
    alerts: broadcast::Sender<AlertEvent>,
    started_at: Instant,
    system: RwLock<System>,
}

impl Statistics {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            counters: Counters::default(),
            error_counts: RwLock::new(HashMap::new()),
            alerts: tx,
            started_at: Instant::now(),
            system: RwLock::new(System::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts.subscribe()
    }

    pub fn record_packet_seen(&self) {
        self.counters.packets_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet_dropped(&self) {
        self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_threat_detected(&self) {
        self.counters.threats_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_applied(&self) {
        self.counters.blocks_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_applied(&self) {
        self.counters.rate_limits_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_training_step(&self) {
        self.counters.training_steps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: ErrorKind) {
        *self.error_counts.write().entry(kind).or_insert(0) += 1;
    }

    /// Record a classified threat's tier, independent of whatever
    /// defensive action was (or wasn't) taken against it.
    pub fn record_threat_tier(&self, level: ThreatLevel) {
        self.counters.threats_by_tier[level as u8 as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Record the defensive outcome actually reached for a packet, for
    /// the `defense_outcomes` breakdown.
    pub fn record_defense_outcome(&self, outcome: DefenseOutcome) {
        let counter = match outcome {
            DefenseOutcome::PermanentBlock => &self.counters.permanent_block,
            DefenseOutcome::TempBlock => &self.counters.temp_block,
            DefenseOutcome::WarningBlock => &self.counters.warning_block,
            DefenseOutcome::Monitored => &self.counters.monitored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a block driven by the accumulation tracker's own
    /// fixed-tier escalation, distinct from the RL/direct per-packet path.
    pub fn record_accumulated_block(&self) {
        self.counters.accumulated_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a single ML-driven prediction outcome for the running
    /// accuracy estimate.
    pub fn record_ml_prediction(&self, correct: bool) {
        self.counters.ml_predictions.fetch_add(1, Ordering::Relaxed);
        if correct {
            self.counters.ml_correct.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_ml_update(&self) {
        self.counters.ml_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish an alert to subscribers. A send error means there are no
    /// subscribers currently listening, which is not itself a failure.
    pub fn publish_alert(&self, event: AlertEvent) {
        self.counters.alerts.fetch_add(1, Ordering::Relaxed);
        let _ = self.alerts.send(event);
    }

    /// Derive process health from the recent error mix: any `Fatal`
    /// observed is `Failing`; any `Transient`/`Recoverable` activity with
    /// no `Fatal` is `Degraded`; no errors at all is `Healthy`.
    fn derive_health(errors: &HashMap<ErrorKind, u64>) -> Health {
        if errors.get(&ErrorKind::Fatal).copied().unwrap_or(0) > 0 {
            Health::Failing
        } else if errors.values().any(|&c| c > 0) {
            Health::Degraded
        } else {
            Health::Healthy
        }
    }

    /// Compose a point-in-time snapshot. Takes one short read lock on the
    /// error-count map and one on the `sysinfo::System` refresh; no other
    /// state is locked.
    pub fn snapshot(&self, queue_utilization: f32) -> Snapshot {
        let errors = self.error_counts.read();
        let error_counts_by_kind: HashMap<String, u64> = errors
            .iter()
            .map(|(k, v)| (format!("{k:?}"), *v))
            .collect();
        let health = Self::derive_health(&errors);
        drop(errors);

        let (cpu_percent, rss_mb) = {
            let mut system = self.system.write();
            system.refresh_cpu();
            system.refresh_memory();
            let pid = sysinfo::get_current_pid().ok();
            let rss = pid
                .and_then(|p| {
                    system.refresh_process(p);
                    system.process(p)
                })
                .map(|proc| proc.memory() as f32 / (1024.0 * 1024.0))
                .unwrap_or(0.0);
            let cpu = system.cpus().first().map(|c| c.cpu_usage()).unwrap_or(0.0);
            (cpu, rss)
        };

        let predictions = self.counters.ml_predictions.load(Ordering::Relaxed);
        let correct = self.counters.ml_correct.load(Ordering::Relaxed);
        let accuracy_estimate = if predictions > 0 {
            correct as f32 / predictions as f32
        } else {
            0.0
        };

        Snapshot {
            packets_seen: self.counters.packets_seen.load(Ordering::Relaxed),
            packets_dropped: self.counters.packets_dropped.load(Ordering::Relaxed),
            threats_detected: self.counters.threats_detected.load(Ordering::Relaxed),
            blocks_applied: self.counters.blocks_applied.load(Ordering::Relaxed),
            rate_limits_applied: self.counters.rate_limits_applied.load(Ordering::Relaxed),
            training_steps: self.counters.training_steps.load(Ordering::Relaxed),
            queue_utilization,
            cpu_percent,
            rss_mb,
            error_counts_by_kind,
            health,
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
            threats_by_tier: ThreatsByTier {
                safe: self.counters.threats_by_tier[ThreatLevel::Safe as usize].load(Ordering::Relaxed),
                low: self.counters.threats_by_tier[ThreatLevel::Low as usize].load(Ordering::Relaxed),
                medium: self.counters.threats_by_tier[ThreatLevel::Medium as usize].load(Ordering::Relaxed),
                high: self.counters.threats_by_tier[ThreatLevel::High as usize].load(Ordering::Relaxed),
                critical: self.counters.threats_by_tier[ThreatLevel::Critical as usize].load(Ordering::Relaxed),
            },
            defense_outcomes: DefenseOutcomes {
                permanent_block: self.counters.permanent_block.load(Ordering::Relaxed),
                temp_block: self.counters.temp_block.load(Ordering::Relaxed),
                warning_block: self.counters.warning_block.load(Ordering::Relaxed),
                monitored: self.counters.monitored.load(Ordering::Relaxed),
                alerts: self.counters.alerts.load(Ordering::Relaxed),
                accumulated_blocks: self.counters.accumulated_blocks.load(Ordering::Relaxed),
            },
            ml_stats: MlStats {
                predictions,
                accuracy_estimate,
                updates: self.counters.ml_updates.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_appear_in_snapshot() {
        let stats = Statistics::new();
        stats.record_packet_seen();
        stats.record_packet_seen();
        stats.record_threat_detected();
        let snap = stats.snapshot(0.1);
        assert_eq!(snap.packets_seen, 2);
        assert_eq!(snap.threats_detected, 1);
        assert_eq!(snap.health, Health::Healthy);
    }

    #[test]
    fn fatal_error_marks_failing_health() {
        let stats = Statistics::new();
        stats.record_error(ErrorKind::Transient);
        assert_eq!(stats.snapshot(0.0).health, Health::Degraded);
        stats.record_error(ErrorKind::Fatal);
        assert_eq!(stats.snapshot(0.0).health, Health::Failing);
    }

    #[test]
    fn granular_breakdowns_track_tier_and_outcome_buckets() {
        let stats = Statistics::new();
        stats.record_threat_tier(ThreatLevel::Critical);
        stats.record_threat_tier(ThreatLevel::Medium);
        stats.record_defense_outcome(DefenseOutcome::TempBlock);
        stats.record_defense_outcome(DefenseOutcome::PermanentBlock);
        stats.record_accumulated_block();
        stats.record_ml_prediction(true);
        stats.record_ml_prediction(false);
        stats.record_ml_update();

        let snap = stats.snapshot(0.0);
        assert_eq!(snap.threats_by_tier.critical, 1);
        assert_eq!(snap.threats_by_tier.medium, 1);
        assert_eq!(snap.defense_outcomes.temp_block, 1);
        assert_eq!(snap.defense_outcomes.permanent_block, 1);
        assert_eq!(snap.defense_outcomes.accumulated_blocks, 1);
        assert_eq!(snap.ml_stats.predictions, 2);
        assert_eq!(snap.ml_stats.updates, 1);
        assert!((snap.ml_stats.accuracy_estimate - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn subscribers_receive_published_alerts() {
        let stats = Statistics::new();
        let mut rx = stats.subscribe();
        stats.publish_alert(AlertEvent {
            source: "10.0.0.1".parse().unwrap(),
            level: ThreatLevel::High,
            action: Action::BlockTemp,
            timestamp_secs: 0.0,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.level, ThreatLevel::High);
    }
}
