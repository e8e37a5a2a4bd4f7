//! C11: pipeline orchestrator.
//!
//! Wires capture -> queue -> features -> classifier -> threat level ->
//! {defense direct path, RL agent path} -> defense executor, recording
//! experiences into the replay buffer as it goes. Adaptive intake batch
//! sizing follows the original's queue-utilization/CPU/RSS-driven
//! backpressure; per-address ordering is preserved by draining the queue
//! in arrival order and never reordering work for the same source.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::accumulation::{AccumulationTracker, Escalation};
use crate::capture::CaptureAdapter;
use crate::classifier::ThreatClassifier;
use crate::defense::{BlockState, DefenseExecutor};
use crate::error::IpsResult;
use crate::persistence::{DefenseActionEntry, DefenseActionsHistory};
use crate::queue::{PacketPool, PacketQueue};
use crate::rl::OnlineTrainer;
use crate::stats::{AlertEvent, DefenseOutcome, Statistics};
use crate::{Action, Experience, ExperienceMeta, OperatingMode, RLState, ThreatLevel};

/// Minimum spacing between logged queue-overflow warnings, so a sustained
/// overflow doesn't flood the log at packet rate.
const OVERFLOW_WARNING_THROTTLE: Duration = Duration::from_secs(10);

/// Queue-utilization bands driving adaptive intake batch size, lifted
/// from the original's `ADAPTIVE_PROCESS_*` constants.
const UTILIZATION_HIGH: f32 = 0.8;
const UTILIZATION_MEDIUM: f32 = 0.5;
const BATCH_MAX: usize = 1500;
const BATCH_MEDIUM: usize = 800;
const BATCH_NORMAL: usize = 150;
const BATCH_MIN: usize = 50;

const INTAKE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Memory-ceiling compaction sweep cadence and threshold (spec §6:
/// "workers perform an explicit compaction sweep every 30s if RSS >
/// 150 MB"). Sweeping drops stale accumulation-tracker windows and
/// shrinks the packet pool's free list.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
const RSS_CEILING_MB: f32 = 150.0;

/// Reward shaping constants for recorded experiences, lifted from the
/// original's defense-policy cost model.
mod reward {
    pub const ATTACK_PREVENTION_VALUE: f32 = 100.0;
    pub const FALSE_POSITIVE_COST: f32 = 20.0;
    pub const SYSTEM_IMPACT_PENALTY: f32 = 10.0;
    pub const LATENCY_PENALTY: f32 = 5.0;
    pub const SERVICE_DISRUPTION_COST: f32 = 50.0;
}

/// Compute the reward for taking `action` given the observed threat
/// level, penalizing both false positives (blocking clean traffic) and
/// false negatives (allowing a high/critical threat through).
fn compute_reward(level: ThreatLevel, action: Action) -> f32 {
    let is_blocking = matches!(
        action,
        Action::BlockTemp | Action::BlockPerm | Action::Isolate
    );
    let is_malicious = level >= ThreatLevel::Medium;

    let base = match (is_malicious, is_blocking) {
        (true, true) => reward::ATTACK_PREVENTION_VALUE - reward::LATENCY_PENALTY,
        (true, false) => -reward::ATTACK_PREVENTION_VALUE,
        (false, true) => -reward::FALSE_POSITIVE_COST - reward::SERVICE_DISRUPTION_COST,
        (false, false) => 0.0,
    };

    // Isolate is the most disruptive action available (it also suspends
    // rate limiting for the address), so it always carries the system
    // impact penalty on top of the block/no-block base reward.
    if action == Action::Isolate {
        base - reward::SYSTEM_IMPACT_PENALTY
    } else {
        base
    }
}

/// Adaptive intake batch size from current queue utilization, mirroring
/// the original's tiered backpressure.
fn adaptive_batch_size(utilization: f32) -> usize {
    if utilization >= UTILIZATION_HIGH {
        BATCH_MAX
    } else if utilization >= UTILIZATION_MEDIUM {
        BATCH_MEDIUM
    } else if utilization > 0.0 {
        BATCH_NORMAL
    } else {
        BATCH_MIN
    }
}

/// Build the 10-lane RL state from classifier output, threat level, and
/// current system load. `active_threats`/`blocked_ips` are normalized by
/// the orchestrator against rolling maxima so the lanes stay in `[0, 1]`.
#[allow(clippy::too_many_arguments)]
fn build_rl_state(
    p_malicious: f32,
    confidence: f32,
    attack_kind_code: f32,
    level: ThreatLevel,
    cpu_load: f32,
    mem_load: f32,
    active_threats_norm: f32,
    blocked_ips_norm: f32,
    hour_norm: f32,
    service_criticality: f32,
) -> RLState {
    RLState::new(
        p_malicious,
        confidence,
        attack_kind_code,
        level as u8 as f32 / 4.0,
        cpu_load,
        mem_load,
        active_threats_norm,
        blocked_ips_norm,
        hour_norm,
        service_criticality,
    )
}

/// Direct, non-learned action for a threat tier: the path taken when RL
/// mode is disabled. Mirrors the fixed tier thresholds the accumulation
/// tracker and defense executor already use, so both paths converge on
/// the same tiers even though only the RL path adapts over time.
fn direct_action_for_tier(level: ThreatLevel) -> Action {
    match level {
        ThreatLevel::Safe | ThreatLevel::Low => Action::Allow,
        ThreatLevel::Medium => Action::RateLimit,
        ThreatLevel::High => Action::BlockTemp,
        ThreatLevel::Critical => Action::BlockPerm,
    }
}

/// Owns the wiring between all pipeline components and runs the main
/// intake loop.
pub struct Orchestrator {
    queue: Arc<PacketQueue>,
    pool: Arc<PacketPool>,
    classifier: ThreatClassifier,
    accumulation: AccumulationTracker,
    defense: Arc<DefenseExecutor>,
    trainer: Arc<OnlineTrainer>,
    stats: Arc<Statistics>,
    mode: OperatingMode,
    running: AtomicBool,
    /// When true (the default), the RL agent chooses each packet's
    /// action; when false, the direct RF-threshold path
    /// (`direct_action_for_tier`) is used instead. Both paths still
    /// persist their experience for learning.
    rl_enabled: AtomicBool,
    /// Stop the intake loop after processing this many packets; 0 means
    /// unbounded.
    max_packets: AtomicU64,
    processed: AtomicU64,
    last_overflow_warning: Mutex<Option<Instant>>,
    /// In-memory accrual of `defense_actions_history.json` (spec §6); kept
    /// as a plain `Vec`-backed cap, never written to disk on the hot path
    /// — `bin/ips.rs` flushes it via `drain_action_history`/`save` on its
    /// own periodic/shutdown schedule.
    action_history: Mutex<DefenseActionsHistory>,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<PacketQueue>,
        pool: Arc<PacketPool>,
        classifier: ThreatClassifier,
        defense: Arc<DefenseExecutor>,
        trainer: Arc<OnlineTrainer>,
        stats: Arc<Statistics>,
        mode: OperatingMode,
    ) -> Self {
        Self {
            queue,
            pool,
            classifier,
            accumulation: AccumulationTracker::new(),
            defense,
            trainer,
            stats,
            mode,
            running: AtomicBool::new(false),
            rl_enabled: AtomicBool::new(true),
            max_packets: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            last_overflow_warning: Mutex::new(None),
            action_history: Mutex::new(DefenseActionsHistory::default()),
        }
    }

    /// Snapshot and clear the accrued defense-action history, for the
    /// caller to persist to `defense_actions_history.json` on its own
    /// schedule (the orchestrator itself never touches the filesystem).
    pub fn drain_action_history(&self) -> DefenseActionsHistory {
        std::mem::take(&mut *self.action_history.lock())
    }

    /// Disable (or re-enable) the RL agent path at runtime, falling back
    /// to/from the direct tier-threshold action path.
    pub fn set_rl_enabled(&self, enabled: bool) {
        self.rl_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn rl_enabled(&self) -> bool {
        self.rl_enabled.load(Ordering::SeqCst)
    }

    /// Bound the intake loop to stop after `max_packets` packets (0 =
    /// unbounded). Intended for offline replay/test runs.
    pub fn set_max_packets(&self, max_packets: u64) {
        self.max_packets.store(max_packets, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Process a single captured packet end to end. Returns the action
    /// actually taken, for tests and for the caller's own logging.
    pub async fn process_one(
        &self,
        record: crate::PacketRecord,
        cpu_load: f32,
        mem_load: f32,
    ) -> IpsResult<Action> {
        self.stats.record_packet_seen();
        let source = record.source.addr;

        let fv = crate::features::extract(&record, self.mode);
        let classifier_output = self.classifier.classify(&record, &fv);
        let level = crate::threat_level::classify(&classifier_output);

        self.stats.record_threat_tier(level);
        if level >= ThreatLevel::Low {
            self.stats.record_threat_detected();
        }

        // The accumulation tracker drives its own fixed-tier escalation
        // independent of the RL agent, for sustained low-grade activity
        // that never individually crosses the per-packet action
        // threshold.
        match self.accumulation.record(source, level) {
            Escalation::ToWarn => {
                if let Ok(Some(state)) = self.defense.escalate(source, BlockState::Warn).await {
                    self.stats.record_accumulated_block();
                    info!(%source, ?state, "accumulation escalated to warn");
                }
            }
            Escalation::ToTemp => {
                if let Ok(Some(state)) = self.defense.escalate(source, BlockState::Temp).await {
                    self.stats.record_accumulated_block();
                    info!(%source, ?state, "accumulation escalated to temp");
                }
            }
            Escalation::None => {}
        }

        let active_threats_norm = (self.accumulation.tracked_count() as f32 / 1000.0).min(1.0);
        let blocked_ips_norm = (self.defense.blocked_count() as f32 / 1000.0).min(1.0);
        let hour_norm = (record.timestamp.rem_euclid(86400.0) / 86400.0) as f32;

        let state = build_rl_state(
            classifier_output.p_malicious,
            classifier_output.confidence,
            classifier_output.attack_kind.code_norm(),
            level,
            cpu_load,
            mem_load,
            active_threats_norm,
            blocked_ips_norm,
            hour_norm,
            0.5,
        );

        let rl_mode = self.rl_enabled.load(Ordering::SeqCst);
        let action = if rl_mode {
            self.trainer.act(&state, true)
        } else {
            direct_action_for_tier(level)
        };
        let exec_result = self.defense.execute(source, action, level).await;

        let applied_action = match &exec_result {
            Ok(_) => action,
            Err(e @ crate::error::IpsError::Protected(_)) => {
                self.stats.record_error(e.kind());
                Action::Allow
            }
            Err(e) => {
                self.stats.record_error(e.kind());
                warn!(%source, ?action, "defense execution failed, treating as allow");
                Action::Allow
            }
        };

        match applied_action {
            Action::BlockTemp | Action::BlockPerm | Action::Isolate => {
                self.stats.record_block_applied();
            }
            Action::RateLimit => self.stats.record_rate_limit_applied(),
            _ => {}
        }

        if rl_mode {
            let acted_correctly = (level >= ThreatLevel::Medium)
                == matches!(
                    applied_action,
                    Action::BlockTemp | Action::BlockPerm | Action::Isolate | Action::RateLimit
                );
            self.stats.record_ml_prediction(acted_correctly);
        }

        if let Ok(resulting_state) = &exec_result {
            let outcome = match resulting_state {
                BlockState::Perm => Some(DefenseOutcome::PermanentBlock),
                BlockState::Temp => Some(DefenseOutcome::TempBlock),
                BlockState::Warn => Some(DefenseOutcome::WarningBlock),
                BlockState::Unknown => {
                    matches!(applied_action, Action::Allow | Action::DeepInspect)
                        .then_some(DefenseOutcome::Monitored)
                }
            };
            if let Some(outcome) = outcome {
                self.stats.record_defense_outcome(outcome);
            }
        }

        let reward = compute_reward(level, applied_action);

        // Cheaper than a fresh `stats::Snapshot` round-trip: approximate the
        // post-action state by relaxing the active-threat-count lane when a
        // block actually landed, rather than recomputing every lane from
        // scratch inside the per-packet hot path.
        let mut next_state = state;
        if matches!(
            applied_action,
            Action::BlockTemp | Action::BlockPerm | Action::Isolate
        ) {
            next_state.0[6] = (next_state.0[6] - (1.0 / 1000.0)).max(0.0);
        }

        self.trainer.record_experience(Experience {
            state,
            action: applied_action,
            reward,
            next_state,
            done: true,
            meta: ExperienceMeta {
                is_malicious: level >= ThreatLevel::Medium,
                attack_kind: classifier_output.attack_kind,
                timestamp: record.timestamp,
            },
        });

        if level >= ThreatLevel::Medium {
            self.stats.publish_alert(AlertEvent {
                source,
                level,
                action: applied_action,
                timestamp_secs: record.timestamp,
            });
        }

        self.action_history.lock().record(DefenseActionEntry {
            address: source,
            protocol: record.protocol,
            action: applied_action,
            threat_level: level,
            confidence: classifier_output.confidence,
            timestamp_secs: record.timestamp,
        });

        self.pool.release(record);
        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(applied_action)
    }

    /// Emit a queue-overflow warning, throttled to at most one per
    /// `OVERFLOW_WARNING_THROTTLE` so a sustained overflow doesn't flood
    /// the log at packet rate.
    fn warn_on_overflow(&self) {
        let now = Instant::now();
        let mut last = self.last_overflow_warning.lock();
        let should_warn = last.map(|t| now.duration_since(t) >= OVERFLOW_WARNING_THROTTLE).unwrap_or(true);
        if should_warn {
            warn!(
                dropped = self.queue.dropped_count(),
                capacity = self.queue.capacity(),
                "packet queue overflow, dropping oldest packets"
            );
            *last = Some(now);
        }
    }

    /// Run one memory-ceiling check and, if RSS exceeds `RSS_CEILING_MB`,
    /// prune stale accumulation-tracker windows and shrink the packet
    /// pool's free list back down.
    fn maintenance_sweep(&self) {
        let rss_mb = self.stats.snapshot(self.queue.utilization()).rss_mb;
        if rss_mb > RSS_CEILING_MB {
            info!(rss_mb, ceiling_mb = RSS_CEILING_MB, "memory ceiling exceeded, running compaction sweep");
            self.accumulation.sweep();
            self.pool.compact();
        }
    }

    /// Spawn the periodic maintenance task. `shutdown` is a watch channel;
    /// setting it to `true` requests a cooperative stop.
    pub fn spawn_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
                self.maintenance_sweep();
            }
        })
    }

    /// Run the intake loop against a capture adapter until told to stop.
    /// Drains the queue in arrival order (FIFO), preserving per-address
    /// ordering since a single queue only ever pops its head.
    pub async fn run(
        self: Arc<Self>,
        capture: Arc<dyn CaptureAdapter>,
        mut shutdown: watch::Receiver<bool>,
    ) -> IpsResult<()> {
        self.running.store(true, Ordering::SeqCst);
        capture.start().await?;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let max_packets = self.max_packets.load(Ordering::SeqCst);
            if max_packets > 0 && self.processed.load(Ordering::Relaxed) >= max_packets {
                info!(max_packets, "reached packet processing limit, stopping");
                break;
            }

            match capture.next_packet().await {
                Ok(Some(record)) => {
                    let dropped = self.queue.push(record);
                    if dropped {
                        self.stats.record_packet_dropped();
                        self.warn_on_overflow();
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(INTAKE_POLL_INTERVAL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "capture error");
                }
            }

            let utilization = self.queue.utilization();
            let batch_size = adaptive_batch_size(utilization);
            let batch = self.queue.pop_batch(batch_size);
            for record in batch {
                if let Err(e) = self.process_one(record, 0.5, 0.5).await {
                    warn!(error = %e, "pipeline step failed");
                }
                if max_packets > 0 && self.processed.load(Ordering::Relaxed) >= max_packets {
                    break;
                }
            }
        }

        capture.stop().await?;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ReplayAdapter;
    use crate::defense::firewall::FirewallAdapter;
    use crate::rl::{CqlAgent, ReplayBuffer};
    use crate::{Endpoint, PacketRecord, Protocol};
    use async_trait::async_trait;
    use std::net::IpAddr;

    struct AllowAllFirewall;

    #[async_trait]
    impl FirewallAdapter for AllowAllFirewall {
        async fn block(&self, _addr: IpAddr) -> IpsResult<()> {
            Ok(())
        }
        async fn unblock(&self, _addr: IpAddr) -> IpsResult<()> {
            Ok(())
        }
        async fn rate_limit(&self, _addr: IpAddr, _pps: u32) -> IpsResult<()> {
            Ok(())
        }
        async fn verify_blocked(&self, _addr: IpAddr) -> IpsResult<bool> {
            Ok(true)
        }
    }

    fn build_orchestrator() -> Arc<Orchestrator> {
        let queue = Arc::new(PacketQueue::new(100));
        let pool = Arc::new(PacketPool::new());
        let classifier = ThreatClassifier::new();
        let defense = Arc::new(DefenseExecutor::new(Arc::new(AllowAllFirewall)));
        let trainer = OnlineTrainer::new(CqlAgent::new(), ReplayBuffer::new(1000, 0.3));
        let stats = Arc::new(Statistics::new());
        Arc::new(Orchestrator::new(
            queue,
            pool,
            classifier,
            defense,
            trainer,
            stats,
            OperatingMode::Lightweight,
        ))
    }

    fn big_ddos_packet() -> PacketRecord {
        PacketRecord {
            source: Endpoint::new(IpAddr::from([203, 0, 113, 9]), Some(12345)),
            destination: Endpoint::new(IpAddr::from([198, 51, 100, 1]), Some(80)),
            protocol: Protocol::Tcp,
            length: 9000,
            ttl: 64,
            flags: 2,
            info: String::new(),
            timestamp: 0.0,
        }
    }

    #[tokio::test]
    async fn processed_packets_accrue_into_drainable_action_history() {
        let orch = build_orchestrator();
        orch.process_one(big_ddos_packet(), 0.5, 0.5).await.unwrap();
        orch.process_one(big_ddos_packet(), 0.5, 0.5).await.unwrap();
        let drained = orch.drain_action_history();
        assert_eq!(drained.entries.len(), 2);
        // Draining clears the in-memory accrual.
        assert!(orch.drain_action_history().entries.is_empty());
    }

    #[tokio::test]
    async fn repeated_critical_traffic_escalates_to_a_block() {
        let orch = build_orchestrator();
        let addr = big_ddos_packet().source.addr;
        // Three Critical-level hits from the same source inside the
        // accumulation window escalate to a temp block via the
        // accumulation tracker, independent of whatever per-packet action
        // the untrained (randomly initialized) RL agent happens to pick.
        for _ in 0..3 {
            orch.process_one(big_ddos_packet(), 0.5, 0.5).await.unwrap();
        }
        assert_ne!(orch.defense.state_of(addr), crate::defense::BlockState::Unknown);
    }

    #[tokio::test]
    async fn private_source_is_never_blocked_even_under_attack() {
        let orch = build_orchestrator();
        let mut packet = big_ddos_packet();
        packet.source = Endpoint::new(IpAddr::from([192, 168, 1, 50]), Some(12345));
        let action = orch.process_one(packet, 0.5, 0.5).await.unwrap();
        assert!(!matches!(
            action,
            Action::BlockTemp | Action::BlockPerm | Action::Isolate
        ));
    }

    #[tokio::test]
    async fn protected_range_attempt_increments_protected_error_count() {
        let orch = build_orchestrator();
        // Direct path on a Critical-tier packet deterministically picks
        // BlockPerm, guaranteeing the defense executor's protected-range
        // guard actually fires (the RL path's untrained action choice
        // would make this assertion flaky).
        orch.set_rl_enabled(false);
        let mut packet = big_ddos_packet();
        packet.source = Endpoint::new(IpAddr::from([192, 168, 1, 50]), Some(12345));
        orch.process_one(packet, 0.5, 0.5).await.unwrap();
        let snap = orch.stats.snapshot(0.0);
        assert_eq!(
            snap.error_counts_by_kind.get("Protected").copied().unwrap_or(0),
            1
        );
    }

    #[tokio::test]
    async fn queue_overflow_increments_drop_counter() {
        let orch = build_orchestrator();
        for _ in 0..150 {
            let dropped = orch.queue.push(big_ddos_packet());
            if dropped {
                orch.stats.record_packet_dropped();
            }
        }
        assert!(orch.stats.snapshot(0.0).packets_dropped > 0);
    }

    #[tokio::test]
    async fn direct_path_is_used_when_rl_mode_disabled() {
        let orch = build_orchestrator();
        orch.set_rl_enabled(false);
        let mut packet = big_ddos_packet();
        packet.source = Endpoint::new(IpAddr::from([203, 0, 113, 77]), Some(12345));
        let action = orch.process_one(packet, 0.5, 0.5).await.unwrap();
        // A single Critical-tier packet on the direct path maps straight
        // to BlockPerm, no accumulation needed.
        assert_eq!(action, Action::BlockPerm);
    }

    #[tokio::test]
    async fn run_loop_stops_after_max_packets() {
        let orch = build_orchestrator();
        orch.set_max_packets(2);
        let adapter = Arc::new(ReplayAdapter::new(vec![
            big_ddos_packet(),
            big_ddos_packet(),
            big_ddos_packet(),
        ]));
        let (_tx, rx) = watch::channel(false);
        let result = tokio::time::timeout(Duration::from_secs(2), orch.clone().run(adapter, rx)).await;
        assert!(result.is_ok(), "run loop did not stop at max_packets");
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn run_loop_drains_replay_adapter_and_stops_on_shutdown() {
        let orch = build_orchestrator();
        let adapter = Arc::new(ReplayAdapter::new(vec![big_ddos_packet(), big_ddos_packet()]));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(orch.clone().run(adapter.clone(), rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(!orch.is_running());
    }

    #[test]
    fn maintenance_sweep_is_a_no_op_below_the_rss_ceiling() {
        let orch = build_orchestrator();
        // A fresh test process sits well under the 150 MB ceiling; the
        // sweep should return without touching the accumulation tracker
        // or pool.
        orch.maintenance_sweep();
        assert_eq!(orch.accumulation.tracked_count(), 0);
    }

    #[tokio::test]
    async fn maintenance_task_stops_on_shutdown() {
        let orch = build_orchestrator();
        let (tx, rx) = watch::channel(false);
        let handle = orch.clone().spawn_maintenance(rx);
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok());
    }
}
