//! C3: feature extraction.
//!
//! Pure `PacketRecord -> FeatureVector` mapping, no shared state and no
//! I/O, so it can run on the hot path without contention. Lightweight mode
//! emits 7 lanes; performance mode emits 12, adding the address-hash lanes
//! used by the deeper classifier model.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use crate::{FeatureVector, OperatingMode, PacketRecord, Protocol};

fn neutral(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn protocol_code(p: Protocol) -> f32 {
    match p {
        Protocol::Tcp => 0.0,
        Protocol::Udp => 1.0,
        Protocol::Icmp => 2.0,
        Protocol::Arp => 3.0,
        Protocol::Other => 4.0,
    }
}

/// Stable hash of an address into `[0, 1)`, used as a cheap positional
/// feature without leaking the raw address into the model inputs.
fn addr_hash_norm(addr: IpAddr) -> f32 {
    let mut hasher = DefaultHasher::new();
    addr.hash(&mut hasher);
    (hasher.finish() % 1_000_003) as f32 / 1_000_003.0
}

/// Normalize a packet length against the spec's critical-size bucket so
/// the lane stays within `[0, 1]` for the overwhelming majority of traffic.
fn size_norm(length: u32) -> f32 {
    (length as f32 / 8000.0).min(1.0)
}

fn port_norm(port: Option<u16>) -> f32 {
    port.map(|p| p as f32 / 65535.0).unwrap_or(0.0)
}

fn ttl_norm(ttl: u8) -> f32 {
    ttl as f32 / 255.0
}

/// Suspicious ports seen in known backdoor/botnet C2 traffic; used as a
/// binary lane in performance mode.
const SUSPICIOUS_PORTS: [u16; 5] = [4444, 31337, 1337, 6667, 6666];

fn is_suspicious_port(port: Option<u16>) -> f32 {
    match port {
        Some(p) if SUSPICIOUS_PORTS.contains(&p) => 1.0,
        _ => 0.0,
    }
}

/// Extract a fixed-width feature vector from a packet record. Never fails:
/// any non-finite input is neutralized rather than propagated.
pub fn extract(record: &PacketRecord, mode: OperatingMode) -> FeatureVector {
    let mut fv = FeatureVector::new(mode);

    fv.lanes[0] = neutral(size_norm(record.length));
    fv.lanes[1] = neutral(protocol_code(record.protocol) / 4.0);
    fv.lanes[2] = neutral(ttl_norm(record.ttl));
    fv.lanes[3] = neutral(port_norm(record.source.port));
    fv.lanes[4] = neutral(port_norm(record.destination.port));
    fv.lanes[5] = neutral((record.flags as f32 / 63.0).min(1.0));
    fv.lanes[6] = neutral(if record.info.is_empty() { 0.0 } else { 1.0 });

    if mode == OperatingMode::Performance {
        fv.lanes[7] = neutral(addr_hash_norm(record.source.addr));
        fv.lanes[8] = neutral(addr_hash_norm(record.destination.addr));
        fv.lanes[9] = neutral(is_suspicious_port(record.source.port).max(is_suspicious_port(
            record.destination.port,
        )));
        fv.lanes[10] = neutral(if record.source.addr.is_ipv6() { 1.0 } else { 0.0 });
        fv.lanes[11] = neutral((record.timestamp.rem_euclid(86400.0) / 86400.0) as f32);
    }

    for lane in &mut fv.lanes {
        *lane = neutral(*lane).clamp(0.0, 1.0);
    }

    fv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Endpoint;

    fn packet(length: u32, port: Option<u16>) -> PacketRecord {
        PacketRecord {
            source: Endpoint::new(IpAddr::from([10, 0, 0, 5]), port),
            destination: Endpoint::new(IpAddr::from([10, 0, 0, 6]), Some(80)),
            protocol: Protocol::Tcp,
            length,
            ttl: 64,
            flags: 2,
            info: String::new(),
            timestamp: 100.0,
        }
    }

    #[test]
    fn lightweight_mode_has_seven_finite_lanes() {
        let fv = extract(&packet(1200, Some(443)), OperatingMode::Lightweight);
        assert_eq!(fv.width(), 7);
        assert!(fv.lanes.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn performance_mode_has_twelve_lanes_and_flags_suspicious_port() {
        let fv = extract(&packet(1200, Some(4444)), OperatingMode::Performance);
        assert_eq!(fv.width(), 12);
        assert_eq!(fv.lanes[9], 1.0);
    }

    #[test]
    fn nan_and_inf_inputs_are_neutralized() {
        assert_eq!(neutral(f32::NAN), 0.0);
        assert_eq!(neutral(f32::INFINITY), 0.0);
        assert_eq!(neutral(1.5), 1.5);
    }

    #[test]
    fn oversized_packet_clamps_to_one() {
        let fv = extract(&packet(50_000, None), OperatingMode::Lightweight);
        assert_eq!(fv.lanes[0], 1.0);
    }

    #[test]
    fn address_hash_is_stable_across_calls() {
        let addr = IpAddr::from([192, 168, 1, 1]);
        assert_eq!(addr_hash_norm(addr), addr_hash_norm(addr));
    }
}
