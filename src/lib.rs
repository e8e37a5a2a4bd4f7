//! IPS Core — host-based intrusion prevention core loop.
//!
//! Captures traffic, classifies it, picks a defensive response, and applies
//! that response to the host firewall, improving the response policy online
//! from the outcomes it observes.
//!
//! # Data flow
//! `capture -> queue -> features -> classifier -> threat_level ->
//! {defense direct path, rl agent path} -> defense -> replay buffer -> trainer`

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

pub mod accumulation;
pub mod capture;
pub mod classifier;
pub mod config;
pub mod defense;
pub mod error;
pub mod features;
pub mod ope;
pub mod orchestrator;
pub mod persistence;
pub mod queue;
pub mod rl;
pub mod stats;
pub mod threat_level;

// =============================================================================
// Network primitives
// =============================================================================

/// Transport/network protocol observed on a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Arp,
    Other,
}

/// A network endpoint: address plus an optional port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: Option<u16>,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: Option<u16>) -> Self {
        Self { addr, port }
    }
}

// =============================================================================
// PacketRecord — C1 output
// =============================================================================

/// Normalized packet observation produced by the capture adapter.
///
/// Immutable after the capture adapter emits it. Ownership passes
/// exclusively to the pipeline; when reclaimed it is cleared and returned
/// to the object pool (see `queue::PacketPool`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketRecord {
    pub source: Endpoint,
    pub destination: Endpoint,
    pub protocol: Protocol,
    pub length: u32,
    pub ttl: u8,
    pub flags: u16,
    /// Short opaque hint from the capture layer (e.g. `"syn"`, a URI
    /// fragment). Never authoritative — only the classifier's output
    /// drives decisions.
    pub info: String,
    /// Monotonic seconds since process start.
    pub timestamp: f64,
}

impl PacketRecord {
    /// Reset all fields to their zero/empty value so the record can be
    /// returned to an object pool.
    pub fn clear(&mut self) {
        self.source = Endpoint::new(IpAddr::from([0, 0, 0, 0]), None);
        self.destination = Endpoint::new(IpAddr::from([0, 0, 0, 0]), None);
        self.protocol = Protocol::Other;
        self.length = 0;
        self.ttl = 0;
        self.flags = 0;
        self.info.clear();
        self.timestamp = 0.0;
    }
}

impl Default for PacketRecord {
    fn default() -> Self {
        Self {
            source: Endpoint::new(IpAddr::from([0, 0, 0, 0]), None),
            destination: Endpoint::new(IpAddr::from([0, 0, 0, 0]), None),
            protocol: Protocol::Other,
            length: 0,
            ttl: 0,
            flags: 0,
            info: String::new(),
            timestamp: 0.0,
        }
    }
}

// =============================================================================
// FeatureVector — C3 output
// =============================================================================

/// Operating mode selected at startup; determines feature width and
/// whether auxiliary rule-engine lanes are populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    Lightweight,
    Performance,
}

impl OperatingMode {
    /// Fixed feature width for this mode (F=7 lightweight, F=12 performance).
    pub const fn feature_width(self) -> usize {
        match self {
            OperatingMode::Lightweight => 7,
            OperatingMode::Performance => 12,
        }
    }
}

/// Fixed-width normalized feature vector. All lanes are finite; NaN/Inf
/// inputs are replaced with a neutral element before storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub lanes: Vec<f32>,
    pub mode: OperatingMode,
}

impl FeatureVector {
    pub fn new(mode: OperatingMode) -> Self {
        Self {
            lanes: vec![0.0; mode.feature_width()],
            mode,
        }
    }

    pub fn width(&self) -> usize {
        self.lanes.len()
    }
}

// =============================================================================
// ClassifierOutput — C4 output
// =============================================================================

/// Category assigned to a classified flow/packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttackKind {
    Normal,
    Ddos,
    PortScan,
    BruteForce,
    WebAttack,
    Botnet,
    Unknown,
}

impl AttackKind {
    /// Stable numeric code for RL state encoding, normalized to [0, 1].
    pub fn code_norm(self) -> f32 {
        let code = match self {
            AttackKind::Normal => 0,
            AttackKind::Ddos => 1,
            AttackKind::PortScan => 2,
            AttackKind::BruteForce => 3,
            AttackKind::WebAttack => 4,
            AttackKind::Botnet => 5,
            AttackKind::Unknown => 6,
        };
        code as f32 / 6.0
    }
}

/// Output of the threat classifier: malicious probability, confidence,
/// and an attack-kind label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierOutput {
    pub p_malicious: f32,
    pub confidence: f32,
    pub attack_kind: AttackKind,
}

impl ClassifierOutput {
    pub fn new(p_malicious: f32, confidence: f32, attack_kind: AttackKind) -> Self {
        Self {
            p_malicious: p_malicious.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            attack_kind,
        }
    }
}

// =============================================================================
// ThreatLevel — C5 output
// =============================================================================

/// Discretized severity. Total order `Safe < Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ThreatLevel {
    Safe = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

// =============================================================================
// RLState / Action — C8 inputs/outputs
// =============================================================================

/// 10-D state vector for the response-policy agent, all lanes in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RLState(pub [f32; 10]);

impl RLState {
    /// Lane order: `[p_malicious, confidence, attack_kind_code,
    /// severity_code, cpu_load, mem_load, active_threats_norm,
    /// blocked_ips_norm, hour_of_day/24, service_criticality]`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        p_malicious: f32,
        confidence: f32,
        attack_kind_code: f32,
        severity_code: f32,
        cpu_load: f32,
        mem_load: f32,
        active_threats_norm: f32,
        blocked_ips_norm: f32,
        hour_norm: f32,
        service_criticality: f32,
    ) -> Self {
        Self([
            p_malicious.clamp(0.0, 1.0),
            confidence.clamp(0.0, 1.0),
            attack_kind_code.clamp(0.0, 1.0),
            severity_code.clamp(0.0, 1.0),
            cpu_load.clamp(0.0, 1.0),
            mem_load.clamp(0.0, 1.0),
            active_threats_norm.clamp(0.0, 1.0),
            blocked_ips_norm.clamp(0.0, 1.0),
            hour_norm.clamp(0.0, 1.0),
            service_criticality.clamp(0.0, 1.0),
        ])
    }

    pub const DIM: usize = 10;

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// Discrete defensive response the policy agent may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Action {
    Allow = 0,
    BlockTemp = 1,
    BlockPerm = 2,
    RateLimit = 3,
    DeepInspect = 4,
    Isolate = 5,
}

impl Action {
    pub const COUNT: usize = 6;

    pub const ALL: [Action; 6] = [
        Action::Allow,
        Action::BlockTemp,
        Action::BlockPerm,
        Action::RateLimit,
        Action::DeepInspect,
        Action::Isolate,
    ];

    /// Conservative actions favored during ε-greedy exploration.
    pub const CONSERVATIVE: [Action; 3] = [Action::Allow, Action::RateLimit, Action::DeepInspect];
}

impl TryFrom<usize> for Action {
    type Error = error::IpsError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Action::Allow),
            1 => Ok(Action::BlockTemp),
            2 => Ok(Action::BlockPerm),
            3 => Ok(Action::RateLimit),
            4 => Ok(Action::DeepInspect),
            5 => Ok(Action::Isolate),
            other => Err(error::IpsError::recoverable(format!(
                "invalid action index {other}"
            ))),
        }
    }
}

// =============================================================================
// Experience — C9 record
// =============================================================================

/// Metadata attached to a recorded transition, carried through to the
/// replay buffer for IDS-aware retention and statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceMeta {
    pub is_malicious: bool,
    pub attack_kind: AttackKind,
    pub timestamp: f64,
}

/// A single recorded transition: state, action taken, observed reward,
/// resulting state, and whether the episode ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub state: RLState,
    pub action: Action,
    pub reward: f32,
    pub next_state: RLState,
    pub done: bool,
    pub meta: ExperienceMeta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threat_level_total_order() {
        assert!(ThreatLevel::Safe < ThreatLevel::Low);
        assert!(ThreatLevel::Low < ThreatLevel::Medium);
        assert!(ThreatLevel::Medium < ThreatLevel::High);
        assert!(ThreatLevel::High < ThreatLevel::Critical);
    }

    #[test]
    fn feature_width_by_mode() {
        assert_eq!(OperatingMode::Lightweight.feature_width(), 7);
        assert_eq!(OperatingMode::Performance.feature_width(), 12);
    }

    #[test]
    fn action_round_trips_through_index() {
        for (i, a) in Action::ALL.iter().enumerate() {
            assert_eq!(Action::try_from(i).unwrap(), *a);
        }
        assert!(Action::try_from(6).is_err());
    }

    #[test]
    fn packet_record_clear_resets_fields() {
        let mut p = PacketRecord {
            info: "syn".into(),
            length: 64,
            ..Default::default()
        };
        p.clear();
        assert_eq!(p.length, 0);
        assert!(p.info.is_empty());
    }
}
