//! C7: defense executor.
//!
//! Owns the per-address block state machine (`Unknown -> Warn -> Temp ->
//! Perm`), the private-range safety guard, and the firewall adapter that
//! actually applies/retracts rules. Grounded on the original's
//! `defense_mechanism.py` threat-response tiers and TTL scheduling
//! (`time.sleep(1800)`/`time.sleep(600)` for temp/warn unblocks, here
//! modeled as scheduled async tasks that can be cancelled on promotion),
//! and on the corpus's `mitigator.rs` strategy-dispatch shape.

pub mod firewall;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{IpsError, IpsResult};
use crate::persistence::{BlockEvent, BlockHistoryEntry};
use crate::{Action, ThreatLevel};
use firewall::FirewallAdapter;

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

const WARN_DURATION: Duration = Duration::from_secs(10 * 60);
const TEMP_DURATION: Duration = Duration::from_secs(30 * 60);

/// Block state for a single source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BlockState {
    Unknown,
    Warn,
    Temp,
    Perm,
}

impl BlockState {
    /// Whether `next` is a valid escalation from `self`. The machine only
    /// moves forward; demotions happen implicitly via TTL expiry back to
    /// `Unknown`, never through `promote`.
    pub fn can_promote_to(self, next: BlockState) -> bool {
        use BlockState::*;
        matches!(
            (self, next),
            (Unknown, Warn) | (Unknown, Temp) | (Unknown, Perm) | (Warn, Temp) | (Warn, Perm) | (Temp, Perm)
        )
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockRecord {
    pub address: IpAddr,
    pub state: BlockState,
    #[serde(skip, default = "Instant::now")]
    pub since: Instant,
    /// Set once the firewall has confirmed the rule is actually present.
    /// `promote` never inserts a record with this false; it either
    /// verifies successfully or retracts and returns an error.
    pub verified: bool,
    /// Platform rule names backing this block (inbound/outbound pair),
    /// kept so `unblock` and reconciliation can recognize them.
    pub rule_ids: Vec<String>,
}

/// Private/reserved ranges that must never be blocked, regardless of
/// accumulated threat score. Matches the original's `_is_private_ip`
/// guard plus loopback and link-local.
fn protected_ranges() -> &'static [IpNetwork] {
    use std::sync::OnceLock;
    static RANGES: OnceLock<Vec<IpNetwork>> = OnceLock::new();
    RANGES.get_or_init(|| {
        [
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "127.0.0.0/8",
            "169.254.0.0/16",
            "::1/128",
            "fc00::/7",
            "fe80::/10",
        ]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect()
    })
}

/// Whether `addr` falls inside a protected range and must never be
/// blocked by this module.
pub fn is_protected(addr: IpAddr) -> bool {
    protected_ranges().iter().any(|net| net.contains(addr))
}

/// Pending TTL-driven unblock, holding a cancellation sender so a
/// promotion to a stronger state can cancel the weaker state's expiry.
struct ScheduledUnblock {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Executes defensive responses and owns the block-state machine.
pub struct DefenseExecutor {
    firewall: Arc<dyn FirewallAdapter>,
    records: RwLock<HashMap<IpAddr, BlockRecord>>,
    scheduled: RwLock<HashMap<IpAddr, ScheduledUnblock>>,
    /// Live accrual of block/unblock events, drained by the process entry
    /// point and merged into `blocked_ips_history.json` the same way
    /// `Orchestrator::drain_action_history` feeds the action-history file
    /// (spec §6: the history is an append log, not a point-in-time dump).
    history: RwLock<Vec<BlockHistoryEntry>>,
}

impl DefenseExecutor {
    pub fn new(firewall: Arc<dyn FirewallAdapter>) -> Self {
        Self {
            firewall,
            records: RwLock::new(HashMap::new()),
            scheduled: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Drain the in-memory block/unblock event log accrued since the last
    /// drain. Intended to be merged into the persisted JSON history on a
    /// timer or at shutdown.
    pub fn drain_history(&self) -> Vec<BlockHistoryEntry> {
        std::mem::take(&mut *self.history.write())
    }

    fn record_event(&self, address: IpAddr, state: BlockState, event: BlockEvent, success: bool) {
        self.history.write().push(BlockHistoryEntry {
            address,
            state,
            event,
            success,
            timestamp_secs: now_secs(),
        });
    }

    pub fn state_of(&self, addr: IpAddr) -> BlockState {
        self.records
            .read()
            .get(&addr)
            .map(|r| r.state)
            .unwrap_or(BlockState::Unknown)
    }

    /// Execute the action chosen for `addr` at the given threat level.
    /// Returns the resulting block state. Actions against a protected
    /// address are suppressed and reported as a `Protected` error rather
    /// than silently ignored, so callers can count/alert on the attempt.
    pub async fn execute(
        self: &Arc<Self>,
        addr: IpAddr,
        action: Action,
        level: ThreatLevel,
    ) -> IpsResult<BlockState> {
        if is_protected(addr) && !matches!(action, Action::Allow | Action::DeepInspect) {
            warn!(%addr, ?action, "suppressed action against protected range");
            return Err(IpsError::protected(format!(
                "refused to act on protected address {addr}"
            )));
        }

        match action {
            Action::Allow | Action::DeepInspect => Ok(self.state_of(addr)),
            Action::RateLimit => {
                self.firewall.rate_limit(addr, 100).await?;
                Ok(self.state_of(addr))
            }
            Action::BlockTemp => Ok(self
                .promote(addr, BlockState::Temp, Some(TEMP_DURATION))
                .await?
                .unwrap_or_else(|| self.state_of(addr))),
            Action::BlockPerm => Ok(self
                .promote(addr, BlockState::Perm, None)
                .await?
                .unwrap_or_else(|| self.state_of(addr))),
            Action::Isolate => {
                self.promote(addr, BlockState::Perm, None).await?;
                self.firewall.rate_limit(addr, 0).await.ok();
                Ok(BlockState::Perm)
            }
        }
        .map(|state| {
            if level >= ThreatLevel::Medium {
                info!(%addr, ?action, ?level, ?state, "defensive action applied");
            }
            state
        })
    }

    /// Record the accumulation tracker's escalation signal directly,
    /// bypassing the RL/action path for the fixed warn/temp tiers the
    /// accumulation tracker (C6) drives on its own.
    /// Returns `Ok(None)` when the address was already at or above
    /// `target` — the accumulation tracker's own signal, not an actual
    /// state change, so callers must not count it as a new block.
    pub async fn escalate(self: &Arc<Self>, addr: IpAddr, target: BlockState) -> IpsResult<Option<BlockState>> {
        if is_protected(addr) {
            return Err(IpsError::protected(format!(
                "refused to escalate protected address {addr}"
            )));
        }
        let duration = match target {
            BlockState::Warn => Some(WARN_DURATION),
            BlockState::Temp => Some(TEMP_DURATION),
            BlockState::Perm => None,
            BlockState::Unknown => return Ok(None),
        };
        self.promote(addr, target, duration).await
    }

    /// Returns `Ok(None)` when `addr` was already at or above `target` —
    /// a no-op, not a promotion.
    async fn promote(
        self: &Arc<Self>,
        addr: IpAddr,
        target: BlockState,
        ttl: Option<Duration>,
    ) -> IpsResult<Option<BlockState>> {
        let current = self.state_of(addr);
        if current == target {
            return Ok(None);
        }
        if current != BlockState::Unknown && !current.can_promote_to(target) {
            // Already at or above the requested tier; nothing to do.
            return Ok(None);
        }

        self.firewall.block(addr).await?;
        if !self.verify(addr).await? {
            // The firewall call reported success but the rule isn't
            // actually present. Retract whatever half-applied state might
            // exist and fail the promotion rather than record a block
            // that isn't real.
            self.firewall.unblock(addr).await.ok();
            self.record_event(addr, target, BlockEvent::Block, false);
            return Err(IpsError::recoverable(format!(
                "APPLY_FAILED: block rule for {addr} did not verify after apply"
            )));
        }

        self.records.write().insert(
            addr,
            BlockRecord {
                address: addr,
                state: target,
                since: Instant::now(),
                verified: true,
                rule_ids: vec![firewall::rule_name(addr)],
            },
        );
        self.record_event(addr, target, BlockEvent::Block, true);

        // Cancel any previously scheduled unblock for this address (e.g.
        // a warn-tier expiry) since the new tier supersedes it.
        if let Some(prev) = self.scheduled.write().remove(&addr) {
            let _ = prev.cancel.send(());
            prev.handle.abort();
        }

        if let Some(duration) = ttl {
            self.schedule_unblock(addr, duration);
        }

        Ok(Some(target))
    }

    fn schedule_unblock(self: &Arc<Self>, addr: IpAddr, duration: Duration) {
        let (tx, mut rx) = oneshot::channel();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    if let Err(e) = this.unblock(addr).await {
                        warn!(%addr, error = %e, "scheduled unblock failed");
                    }
                }
                _ = &mut rx => {}
            }
        });
        self.scheduled
            .write()
            .insert(addr, ScheduledUnblock { cancel: tx, handle });
    }

    /// Retract a block, returning the address to `Unknown`.
    pub async fn unblock(self: &Arc<Self>, addr: IpAddr) -> IpsResult<()> {
        let prior_state = self.state_of(addr);
        if let Err(e) = self.firewall.unblock(addr).await {
            self.record_event(addr, prior_state, BlockEvent::Unblock, false);
            return Err(e);
        }
        self.records.write().remove(&addr);
        if let Some(prev) = self.scheduled.write().remove(&addr) {
            let _ = prev.cancel.send(());
            prev.handle.abort();
        }
        self.record_event(addr, prior_state, BlockEvent::Unblock, true);
        Ok(())
    }

    /// Confirm the firewall actually reflects the in-memory state.
    pub async fn verify(&self, addr: IpAddr) -> IpsResult<bool> {
        self.firewall.verify_blocked(addr).await
    }

    pub fn active_blocks(&self) -> Vec<BlockRecord> {
        self.records.read().values().cloned().collect()
    }

    pub fn blocked_count(&self) -> usize {
        self.records.read().len()
    }

    /// Reconcile in-memory state at startup with a persisted history and
    /// a live firewall scan, taking the union per spec: an address counts
    /// as blocked if either source says so. Persisted entries missing
    /// from the firewall are re-applied once; addresses the firewall
    /// reports but which aren't in the provided history are adopted as
    /// `Perm` (the conservative assumption for an unknown origin).
    pub async fn reconcile(self: &Arc<Self>, persisted: &[(IpAddr, BlockState)]) -> IpsResult<()> {
        let scanned = self.firewall.scan_blocked().await.unwrap_or_default();
        let scanned: std::collections::HashSet<IpAddr> = scanned.into_iter().collect();

        for &(addr, state) in persisted {
            if is_protected(addr) {
                continue;
            }
            if scanned.contains(&addr) {
                self.records.write().insert(
                    addr,
                    BlockRecord {
                        address: addr,
                        state,
                        since: Instant::now(),
                        verified: true,
                        rule_ids: vec![firewall::rule_name(addr)],
                    },
                );
            } else {
                // Known-blocked in history but absent from the live
                // ruleset: re-apply once.
                if let Err(e) = self.promote(addr, state, None).await {
                    warn!(%addr, error = %e, "failed to reconcile persisted block");
                }
            }
        }

        for addr in scanned {
            if !self.records.read().contains_key(&addr) && !is_protected(addr) {
                self.records.write().insert(
                    addr,
                    BlockRecord {
                        address: addr,
                        state: BlockState::Perm,
                        since: Instant::now(),
                        verified: true,
                        rule_ids: vec![firewall::rule_name(addr)],
                    },
                );
            }
        }

        Ok(())
    }

    /// Periodically re-verify every recorded block is still reflected in
    /// the firewall. If an external actor removed the rule, re-apply it
    /// once; if the re-apply itself fails to verify, demote the address
    /// back to `Unknown` and log the loss as `Recoverable` rather than
    /// silently drifting out of sync.
    pub async fn verify_sweep(self: &Arc<Self>) {
        let addrs: Vec<IpAddr> = self.records.read().keys().copied().collect();
        for addr in addrs {
            match self.verify(addr).await {
                Ok(true) => {}
                Ok(false) => {
                    let state = self.state_of(addr);
                    if self.firewall.block(addr).await.is_err() || !self.verify(addr).await.unwrap_or(false) {
                        warn!(%addr, ?state, "externally removed block could not be reapplied, demoting to unknown");
                        self.records.write().remove(&addr);
                        self.record_event(addr, state, BlockEvent::Unblock, true);
                    }
                }
                Err(e) => {
                    warn!(%addr, error = %e, "verify sweep failed to check firewall state");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockFirewall {
        blocked: parking_lot::Mutex<std::collections::HashSet<IpAddr>>,
        block_calls: AtomicUsize,
        fail_next: AtomicBool,
    }

    impl MockFirewall {
        fn new() -> Self {
            Self {
                blocked: parking_lot::Mutex::new(Default::default()),
                block_calls: AtomicUsize::new(0),
                fail_next: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl firewall::FirewallAdapter for MockFirewall {
        async fn block(&self, addr: IpAddr) -> IpsResult<()> {
            self.block_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(IpsError::transient("mock failure"));
            }
            self.blocked.lock().insert(addr);
            Ok(())
        }
        async fn unblock(&self, addr: IpAddr) -> IpsResult<()> {
            self.blocked.lock().remove(&addr);
            Ok(())
        }
        async fn rate_limit(&self, _addr: IpAddr, _pps: u32) -> IpsResult<()> {
            Ok(())
        }
        async fn verify_blocked(&self, addr: IpAddr) -> IpsResult<bool> {
            Ok(self.blocked.lock().contains(&addr))
        }
    }

    fn public_addr() -> IpAddr {
        "203.0.113.5".parse().unwrap()
    }

    #[test]
    fn private_ranges_are_protected() {
        assert!(is_protected("10.1.2.3".parse().unwrap()));
        assert!(is_protected("192.168.1.1".parse().unwrap()));
        assert!(is_protected("127.0.0.1".parse().unwrap()));
        assert!(!is_protected(public_addr()));
    }

    #[test]
    fn state_machine_promotion_rules() {
        assert!(BlockState::Unknown.can_promote_to(BlockState::Warn));
        assert!(BlockState::Warn.can_promote_to(BlockState::Perm));
        assert!(!BlockState::Perm.can_promote_to(BlockState::Warn));
        assert!(!BlockState::Temp.can_promote_to(BlockState::Warn));
    }

    #[tokio::test]
    async fn execute_refuses_protected_address() {
        let fw = Arc::new(MockFirewall::new());
        let exec = Arc::new(DefenseExecutor::new(fw));
        let result = exec
            .execute("192.168.1.1".parse().unwrap(), Action::BlockPerm, ThreatLevel::Critical)
            .await;
        assert!(matches!(result, Err(IpsError::Protected(_))));
    }

    #[tokio::test]
    async fn execute_block_perm_applies_and_verifies() {
        let fw = Arc::new(MockFirewall::new());
        let exec = Arc::new(DefenseExecutor::new(fw));
        let addr = public_addr();
        let state = exec
            .execute(addr, Action::BlockPerm, ThreatLevel::Critical)
            .await
            .unwrap();
        assert_eq!(state, BlockState::Perm);
        assert_eq!(exec.state_of(addr), BlockState::Perm);
        assert!(exec.verify(addr).await.unwrap());
    }

    #[tokio::test]
    async fn allow_action_never_touches_firewall() {
        let fw = Arc::new(MockFirewall::new());
        let exec = Arc::new(DefenseExecutor::new(fw.clone()));
        let addr = public_addr();
        exec.execute(addr, Action::Allow, ThreatLevel::Safe).await.unwrap();
        assert_eq!(fw.block_calls.load(Ordering::SeqCst), 0);
    }

    struct UnverifiableFirewall;

    #[async_trait::async_trait]
    impl firewall::FirewallAdapter for UnverifiableFirewall {
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
            Ok(false)
        }
    }

    #[tokio::test]
    async fn promote_fails_and_does_not_record_when_verify_reports_absent() {
        let exec = Arc::new(DefenseExecutor::new(Arc::new(UnverifiableFirewall)));
        let addr = public_addr();
        let result = exec.execute(addr, Action::BlockPerm, ThreatLevel::Critical).await;
        assert!(result.is_err());
        assert_eq!(exec.state_of(addr), BlockState::Unknown);
    }

    #[tokio::test]
    async fn reconcile_adopts_scanned_rules_and_reapplies_missing_history() {
        let fw = Arc::new(MockFirewall::new());
        let already_live = "203.0.113.77".parse().unwrap();
        fw.blocked.lock().insert(already_live);
        let exec = Arc::new(DefenseExecutor::new(fw));

        let missing_from_firewall = public_addr();
        exec.reconcile(&[(missing_from_firewall, BlockState::Temp)])
            .await
            .unwrap();

        assert_eq!(exec.state_of(missing_from_firewall), BlockState::Temp);
    }

    #[tokio::test]
    async fn block_and_unblock_accrue_into_drainable_history() {
        let fw = Arc::new(MockFirewall::new());
        let exec = Arc::new(DefenseExecutor::new(fw));
        let addr = public_addr();
        exec.execute(addr, Action::BlockPerm, ThreatLevel::Critical).await.unwrap();
        exec.unblock(addr).await.unwrap();

        let history = exec.drain_history();
        assert_eq!(history.len(), 2);
        assert!(matches!(history[0].event, BlockEvent::Block));
        assert!(history[0].success);
        assert!(matches!(history[1].event, BlockEvent::Unblock));
        assert!(history[1].success);
        assert!(exec.drain_history().is_empty());
    }

    #[tokio::test]
    async fn escalate_to_warn_then_promote_to_perm_cancels_ttl() {
        let fw = Arc::new(MockFirewall::new());
        let exec = Arc::new(DefenseExecutor::new(fw));
        let addr = public_addr();
        exec.escalate(addr, BlockState::Warn).await.unwrap();
        assert_eq!(exec.state_of(addr), BlockState::Warn);
        exec.execute(addr, Action::BlockPerm, ThreatLevel::Critical)
            .await
            .unwrap();
        assert_eq!(exec.state_of(addr), BlockState::Perm);
    }
}
