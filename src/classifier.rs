//! C4: threat classifier.
//!
//! Two-tier design mirroring the corpus's `AttackClassifier` +
//! `classify_by_metrics` split: a tabular model scores a feature vector
//! when one has been loaded, falling back to the fixed heuristic rule set
//! below otherwise (fresh install, artifact version mismatch, or load
//! failure — all `Recoverable`, never fatal).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IpsError, IpsResult};
use crate::{AttackKind, ClassifierOutput, FeatureVector, PacketRecord};

/// Packet-size buckets from the original heuristic thresholds.
mod size_buckets {
    pub const CRITICAL: u32 = 8000;
    pub const HIGH: u32 = 5000;
    pub const MEDIUM: u32 = 3000;
    pub const NORMAL: u32 = 1500;
}

/// Ports associated with known backdoors/botnet C2 channels.
const SUSPICIOUS_PORTS: [u16; 5] = [4444, 31337, 1337, 6667, 6666];

/// A single tabular decision node: `feature_index >= threshold ? go_high :
/// go_low`, terminating in a leaf `(p_malicious, attack_kind)` pair. This
/// is a deliberately small hand-rolled structure (a handful of nodes),
/// matching the complexity of the corpus's own decision-tree classifier
/// rather than pulling in an ML framework for what is a cheap lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub feature_index: usize,
    pub threshold: f32,
    pub low: Box<TreeLeafOrNode>,
    pub high: Box<TreeLeafOrNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TreeLeafOrNode {
    Leaf {
        p_malicious: f32,
        attack_kind: AttackKind,
    },
    Node(TreeNode),
}

/// Versioned, serializable tabular classifier artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierArtifact {
    pub version: u32,
    pub expected_feature_width: usize,
    pub root: TreeLeafOrNode,
}

/// Current artifact schema version; a load whose `version` doesn't match
/// is treated as incompatible and rejected (`Recoverable`, falls back to
/// heuristics).
pub const ARTIFACT_VERSION: u32 = 1;

impl ClassifierArtifact {
    pub fn load(path: impl AsRef<Path>) -> IpsResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let artifact: ClassifierArtifact = bincode::deserialize(&bytes)
            .map_err(|e| IpsError::recoverable(format!("classifier artifact decode error: {e}")))?;
        if artifact.version != ARTIFACT_VERSION {
            return Err(IpsError::recoverable(format!(
                "classifier artifact version mismatch: expected {}, found {}",
                ARTIFACT_VERSION, artifact.version
            )));
        }
        Ok(artifact)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> IpsResult<()> {
        let bytes = bincode::serialize(self)
            .map_err(|e| IpsError::Serde(format!("classifier artifact encode error: {e}")))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn eval_node(node: &TreeLeafOrNode, lanes: &[f32]) -> (f32, AttackKind) {
        match node {
            TreeLeafOrNode::Leaf {
                p_malicious,
                attack_kind,
            } => (*p_malicious, *attack_kind),
            TreeLeafOrNode::Node(n) => {
                let value = lanes.get(n.feature_index).copied().unwrap_or(0.0);
                if value >= n.threshold {
                    Self::eval_node(&n.high, lanes)
                } else {
                    Self::eval_node(&n.low, lanes)
                }
            }
        }
    }

    fn predict(&self, fv: &FeatureVector) -> ClassifierOutput {
        let (p_malicious, attack_kind) = Self::eval_node(&self.root, &fv.lanes);
        ClassifierOutput::new(p_malicious, 0.75, attack_kind)
    }
}

/// Fixed heuristic fallback: packet-size buckets and suspicious-port
/// matching, no model required. Grounded on the original's
/// `_check_basic_heuristics` and the corpus's `classify_by_metrics`.
pub fn classify_heuristic(record: &PacketRecord) -> ClassifierOutput {
    let suspicious_port = record
        .source
        .port
        .map(|p| SUSPICIOUS_PORTS.contains(&p))
        .unwrap_or(false)
        || record
            .destination
            .port
            .map(|p| SUSPICIOUS_PORTS.contains(&p))
            .unwrap_or(false);

    let (mut p_malicious, mut attack_kind) = if record.length >= size_buckets::CRITICAL {
        (0.9, AttackKind::Ddos)
    } else if record.length >= size_buckets::HIGH {
        (0.75, AttackKind::Ddos)
    } else if record.length >= size_buckets::MEDIUM {
        (0.55, AttackKind::PortScan)
    } else if record.length < size_buckets::NORMAL / 10 {
        // Tiny packets repeated rapidly are the classic port-scan signature;
        // the accumulation tracker (C6) is what actually detects the
        // repetition, this only nudges the single-packet score.
        (0.35, AttackKind::PortScan)
    } else {
        (0.05, AttackKind::Normal)
    };

    if suspicious_port {
        p_malicious = p_malicious.max(0.8);
        attack_kind = AttackKind::Botnet;
    }

    if !record.info.is_empty() {
        let info_lower = record.info.to_lowercase();
        if info_lower.contains("union select")
            || info_lower.contains("' or ")
            || info_lower.contains("<script")
        {
            p_malicious = p_malicious.max(0.9);
            attack_kind = AttackKind::WebAttack;
        } else if record.protocol == crate::Protocol::Tcp && info_lower.contains("syn") {
            p_malicious = p_malicious.max(0.8);
            attack_kind = AttackKind::Ddos;
        } else if info_lower.contains("syn flood")
            || info_lower.contains("ddos")
            || info_lower.contains("attack")
        {
            p_malicious = p_malicious.max(0.8);
            if attack_kind == AttackKind::Normal || attack_kind == AttackKind::PortScan {
                attack_kind = AttackKind::Ddos;
            }
        } else if info_lower.contains("login") || info_lower.contains("auth") {
            p_malicious = p_malicious.max(0.4);
        }
    }

    let confidence = if attack_kind == AttackKind::Normal { 0.6 } else { 0.55 };
    ClassifierOutput::new(p_malicious, confidence, attack_kind)
}

/// Threat classifier service: holds an optional loaded artifact and the
/// operating mode it was trained for, falling back to heuristics whenever
/// no artifact is loaded or its feature width doesn't match the current
/// mode.
pub struct ThreatClassifier {
    artifact: Option<ClassifierArtifact>,
}

impl ThreatClassifier {
    pub fn new() -> Self {
        Self { artifact: None }
    }

    pub fn with_artifact(artifact: ClassifierArtifact) -> Self {
        Self {
            artifact: Some(artifact),
        }
    }

    pub fn load_artifact(&mut self, path: impl AsRef<Path>) -> IpsResult<()> {
        self.artifact = Some(ClassifierArtifact::load(path)?);
        Ok(())
    }

    /// Classify from both the raw packet (for the heuristic path) and its
    /// extracted feature vector (for the model path), falling back
    /// automatically when the model disagrees on feature width.
    pub fn classify(&self, record: &PacketRecord, fv: &FeatureVector) -> ClassifierOutput {
        match &self.artifact {
            Some(artifact) if artifact.expected_feature_width == fv.width() => {
                artifact.predict(fv)
            }
            _ => classify_heuristic(record),
        }
    }
}

impl Default for ThreatClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Endpoint, OperatingMode, Protocol};
    use std::net::IpAddr;

    fn packet(length: u32, port: Option<u16>, info: &str) -> PacketRecord {
        PacketRecord {
            source: Endpoint::new(IpAddr::from([10, 0, 0, 5]), port),
            destination: Endpoint::new(IpAddr::from([10, 0, 0, 6]), Some(80)),
            protocol: Protocol::Tcp,
            length,
            ttl: 64,
            flags: 2,
            info: info.to_string(),
            timestamp: 0.0,
        }
    }

    #[test]
    fn large_packet_classified_as_ddos() {
        let out = classify_heuristic(&packet(9000, None, ""));
        assert_eq!(out.attack_kind, AttackKind::Ddos);
        assert!(out.p_malicious >= 0.8);
    }

    #[test]
    fn small_syn_packet_is_flagged_as_high_confidence_ddos() {
        let out = classify_heuristic(&packet(64, None, "syn"));
        assert_eq!(out.attack_kind, AttackKind::Ddos);
        assert!(out.p_malicious >= 0.8);
    }

    #[test]
    fn generic_attack_keyword_raises_score_without_overriding_web_attack() {
        let out = classify_heuristic(&packet(600, Some(80), "possible ddos attempt"));
        assert_eq!(out.attack_kind, AttackKind::Ddos);
        assert!(out.p_malicious >= 0.8);
    }

    #[test]
    fn suspicious_port_forces_botnet() {
        let out = classify_heuristic(&packet(800, Some(4444), ""));
        assert_eq!(out.attack_kind, AttackKind::Botnet);
    }

    #[test]
    fn sql_injection_pattern_forces_web_attack() {
        let out = classify_heuristic(&packet(600, Some(80), "' OR 1=1 union select"));
        assert_eq!(out.attack_kind, AttackKind::WebAttack);
        assert!(out.p_malicious >= 0.9);
    }

    #[test]
    fn plain_packet_classified_as_normal() {
        let out = classify_heuristic(&packet(1400, Some(443), ""));
        assert_eq!(out.attack_kind, AttackKind::Normal);
    }

    #[test]
    fn falls_back_to_heuristic_without_artifact() {
        let classifier = ThreatClassifier::new();
        let record = packet(9000, None, "");
        let fv = crate::features::extract(&record, OperatingMode::Lightweight);
        let out = classifier.classify(&record, &fv);
        assert_eq!(out.attack_kind, AttackKind::Ddos);
    }

    #[test]
    fn falls_back_when_artifact_width_mismatches_mode() {
        let artifact = ClassifierArtifact {
            version: ARTIFACT_VERSION,
            expected_feature_width: 12,
            root: TreeLeafOrNode::Leaf {
                p_malicious: 0.99,
                attack_kind: AttackKind::Ddos,
            },
        };
        let classifier = ThreatClassifier::with_artifact(artifact);
        let record = packet(100, Some(443), "");
        let fv = crate::features::extract(&record, OperatingMode::Lightweight);
        let out = classifier.classify(&record, &fv);
        assert_eq!(out.attack_kind, AttackKind::Normal);
    }
}
