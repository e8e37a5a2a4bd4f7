//! C1: capture adapters.
//!
//! The IPS itself never touches a NIC driver or socket API directly — it
//! depends on a small `CaptureAdapter` trait so the pipeline is testable
//! without root and portable across capture backends. The only adapter
//! shipped here is a deterministic replay adapter used by tests and by
//! `--mode` offline analysis; a real deployment wires in a libpcap/AF_PACKET
//! adapter behind the same trait (out of scope for this crate, see
//! Non-goals).

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::IpsResult;
use crate::PacketRecord;

/// Capture backend contract. `start`/`stop` must be idempotent: calling
/// either twice in a row is a no-op, not an error.
#[async_trait]
pub trait CaptureAdapter: Send + Sync {
    /// Begin producing packets. No-op if already started.
    async fn start(&self) -> IpsResult<()>;

    /// Stop producing packets. No-op if already stopped.
    async fn stop(&self) -> IpsResult<()>;

    /// Fetch the next packet, or `None` if the source is exhausted (replay
    /// adapters) or currently empty (live adapters should instead await
    /// internally and only return `None` once stopped).
    async fn next_packet(&self) -> IpsResult<Option<PacketRecord>>;

    fn is_running(&self) -> bool;
}

/// One entry of the platform adapter's `list_interfaces()` contract
/// (§6): everything the selection rule needs to know about a host
/// network interface, without this crate ever touching an OS socket API
/// itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub is_up: bool,
    pub has_ipv4: bool,
    pub is_loopback: bool,
}

/// Selects a capture interface by the documented rule: prefer the first
/// up, non-loopback adapter with an IPv4 address; otherwise the first
/// up, non-loopback adapter; otherwise `None` (the caller treats this as
/// a `Fatal` "missing capture capability" condition). The platform
/// contract has no default-route signal, so "has an IPv4 address" is
/// this core's stand-in for "has a default route" (see DESIGN.md).
pub fn select_interface(candidates: &[InterfaceInfo]) -> Option<String> {
    candidates
        .iter()
        .find(|i| i.is_up && !i.is_loopback && i.has_ipv4)
        .or_else(|| candidates.iter().find(|i| i.is_up && !i.is_loopback))
        .map(|i| i.name.clone())
}

/// Deterministic in-memory capture adapter: replays a fixed list of
/// packets, then reports exhaustion. Used by integration tests and by
/// `--mode replay` operation.
pub struct ReplayAdapter {
    packets: parking_lot::Mutex<std::collections::VecDeque<PacketRecord>>,
    running: AtomicBool,
    emitted: AtomicUsize,
}

impl ReplayAdapter {
    pub fn new(packets: Vec<PacketRecord>) -> Self {
        Self {
            packets: parking_lot::Mutex::new(packets.into()),
            running: AtomicBool::new(false),
            emitted: AtomicUsize::new(0),
        }
    }

    pub fn emitted_count(&self) -> usize {
        self.emitted.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CaptureAdapter for ReplayAdapter {
    async fn start(&self) -> IpsResult<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> IpsResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn next_packet(&self) -> IpsResult<Option<PacketRecord>> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let item = self.packets.lock().pop_front();
        if item.is_some() {
            self.emitted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(item)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, is_up: bool, has_ipv4: bool, is_loopback: bool) -> InterfaceInfo {
        InterfaceInfo {
            name: name.to_string(),
            is_up,
            has_ipv4,
            is_loopback,
        }
    }

    #[test]
    fn interface_selection_prefers_up_ipv4_non_loopback() {
        let candidates = vec![
            iface("lo", true, true, true),
            iface("docker0", true, false, false),
            iface("eth0", true, true, false),
        ];
        assert_eq!(select_interface(&candidates), Some("eth0".to_string()));
    }

    #[test]
    fn interface_selection_falls_back_to_non_ipv4_up_adapter() {
        let candidates = vec![iface("lo", true, true, true), iface("eth0", true, false, false)];
        assert_eq!(select_interface(&candidates), Some("eth0".to_string()));
    }

    #[test]
    fn interface_selection_fails_when_only_loopback_is_up() {
        let candidates = vec![iface("lo", true, true, true), iface("eth1", false, true, false)];
        assert_eq!(select_interface(&candidates), None);
    }

    #[tokio::test]
    async fn replay_adapter_is_idempotent_and_exhausts() {
        let adapter = ReplayAdapter::new(vec![PacketRecord::default(), PacketRecord::default()]);
        adapter.start().await.unwrap();
        adapter.start().await.unwrap();
        assert!(adapter.is_running());

        assert!(adapter.next_packet().await.unwrap().is_some());
        assert!(adapter.next_packet().await.unwrap().is_some());
        assert!(adapter.next_packet().await.unwrap().is_none());
        assert_eq!(adapter.emitted_count(), 2);

        adapter.stop().await.unwrap();
        adapter.stop().await.unwrap();
        assert!(!adapter.is_running());
    }
}
