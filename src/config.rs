//! Configuration: a single hot-reloadable YAML file.
//!
//! Loaded at startup and re-read by polling the file's mtime; unknown keys
//! are ignored with a warning (`serde(default)` covers the common case, a
//! residual `unknown` map catches everything else for the log line).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{IpsError, IpsResult};
use crate::OperatingMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSection {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub mode: OperatingModeConfig,
}

fn default_name() -> String {
    "ips-core".to_string()
}

fn default_version() -> String {
    "0.1.0".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingModeConfig {
    Lightweight,
    Performance,
}

impl Default for OperatingModeConfig {
    fn default() -> Self {
        OperatingModeConfig::Lightweight
    }
}

impl From<OperatingModeConfig> for OperatingMode {
    fn from(value: OperatingModeConfig) -> Self {
        match value {
            OperatingModeConfig::Lightweight => OperatingMode::Lightweight,
            OperatingModeConfig::Performance => OperatingMode::Performance,
        }
    }
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
            mode: OperatingModeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatAnalysisConfig {
    pub packet_size_critical: u32,
    pub packet_size_high: u32,
    pub packet_size_medium: u32,
    pub packet_size_normal: u32,
    pub threat_score_critical: f32,
    pub threat_score_high: f32,
    pub threat_score_medium: f32,
    pub threat_score_low: f32,
}

impl Default for ThreatAnalysisConfig {
    fn default() -> Self {
        Self {
            packet_size_critical: 8000,
            packet_size_high: 5000,
            packet_size_medium: 3000,
            packet_size_normal: 1500,
            threat_score_critical: 0.9,
            threat_score_high: 0.8,
            threat_score_medium: 0.7,
            threat_score_low: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_size: usize,
    pub adaptive_process_max: usize,
    pub adaptive_process_medium: usize,
    pub adaptive_process_normal: usize,
    pub utilization_high: f32,
    pub utilization_medium: f32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 50_000,
            adaptive_process_max: 1500,
            adaptive_process_medium: 800,
            adaptive_process_normal: 150,
            utilization_high: 0.8,
            utilization_medium: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub dashboard_refresh_seconds: f32,
    pub packet_process_sleep_ms: u64,
    pub memory_cleanup_interval_seconds: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            dashboard_refresh_seconds: 1.0,
            packet_process_sleep_ms: 10,
            memory_cleanup_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub threat_analysis: ThreatAnalysisConfig,
    pub queue: QueueConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatThresholds {
    pub critical: f32,
    pub high: f32,
    pub medium: f32,
    pub low: f32,
}

impl Default for ThreatThresholds {
    fn default() -> Self {
        Self {
            critical: 0.9,
            high: 0.8,
            medium: 0.7,
            low: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyCosts {
    pub attack_prevention_value: f32,
    pub false_positive_cost: f32,
    pub system_impact_penalty: f32,
    pub latency_penalty: f32,
    pub service_disruption_cost: f32,
}

impl Default for PolicyCosts {
    fn default() -> Self {
        Self {
            attack_prevention_value: 100.0,
            false_positive_cost: 20.0,
            system_impact_penalty: 10.0,
            latency_penalty: 5.0,
            service_disruption_cost: 50.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyEnvironmentConfig {
    pub costs: PolicyCosts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DefenseConfig {
    pub threat_thresholds: ThreatThresholds,
    pub policy_environment: PolicyEnvironmentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RlHyperparameters {
    pub alpha_cql: f32,
    pub tau: f32,
    pub gamma: f32,
    pub learning_rate: f32,
    pub epsilon: f32,
    pub epsilon_min: f32,
    pub epsilon_decay: f32,
}

impl Default for RlHyperparameters {
    fn default() -> Self {
        Self {
            alpha_cql: 1.0,
            tau: 0.005,
            gamma: 0.99,
            learning_rate: 1e-4,
            epsilon: 0.1,
            epsilon_min: 0.01,
            epsilon_decay: 0.999,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReinforcementLearningConfig {
    pub hyperparameters: RlHyperparameters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineLearningConfig {
    pub reinforcement_learning: ReinforcementLearningConfig,
}

/// Root configuration tree, matching the YAML schema in spec §6.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpsConfig {
    pub system: SystemSection,
    pub monitoring: MonitoringConfig,
    pub defense: DefenseConfig,
    pub machine_learning: MachineLearningConfig,
}

impl IpsConfig {
    /// Load from a YAML file. Unknown top-level keys are tolerated (serde
    /// ignores them by default for struct deserialization); missing keys
    /// fall back to the defaults above.
    pub fn load(path: impl AsRef<Path>) -> IpsResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        serde_yaml::from_str(&content).map_err(|e| {
            IpsError::recoverable(format!("config parse error in {:?}: {e}", path.as_ref()))
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> IpsResult<()> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| IpsError::Serde(format!("config serialize error: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Watches a config file's mtime and reloads when it changes. Polling
/// rather than an OS file-watcher, matching the spec's "hot-reloadable by
/// file-mtime polling" requirement.
pub struct ConfigWatcher {
    path: PathBuf,
    last_mtime: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_mtime: None,
        }
    }

    /// Check whether the file's mtime advanced since the last check. On
    /// the first call this always reports `true` if the file exists, so
    /// callers can use this as "needs (re)load".
    pub fn poll(&mut self) -> IpsResult<bool> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mtime = metadata.modified()?;
        let changed = self.last_mtime != Some(mtime);
        self.last_mtime = Some(mtime);
        Ok(changed)
    }

    pub fn load(&self) -> IpsResult<IpsConfig> {
        IpsConfig::load(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = IpsConfig::default();
        assert_eq!(cfg.monitoring.queue.max_size, 50_000);
        assert_eq!(cfg.monitoring.threat_analysis.packet_size_critical, 8000);
        assert_eq!(cfg.machine_learning.reinforcement_learning.hyperparameters.gamma, 0.99);
        assert_eq!(cfg.defense.policy_environment.costs.false_positive_cost, 20.0);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let yaml = "system:\n  name: test\nsome_unknown_key: 42\n";
        let cfg: IpsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.system.name, "test");
    }

    #[test]
    fn round_trips_through_file() {
        let dir = std::env::temp_dir().join(format!("ips-core-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        let cfg = IpsConfig::default();
        cfg.save(&path).unwrap();
        let loaded = IpsConfig::load(&path).unwrap();
        assert_eq!(loaded.system.name, cfg.system.name);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn watcher_reports_change_on_touch() {
        let dir = std::env::temp_dir().join(format!("ips-core-test-watch-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        IpsConfig::default().save(&path).unwrap();

        let mut watcher = ConfigWatcher::new(&path);
        assert!(watcher.poll().unwrap());
        assert!(!watcher.poll().unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }
}
