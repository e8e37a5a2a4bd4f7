//! Persistence: JSON action/block histories, CSV packet export, and the
//! atomic-rename binary save helper shared by the RL agent and replay
//! buffer. Grounded on the original's `_save_action_history`/
//! `_load_block_history` and on `edge/src/config.rs`'s load/save-via-serde
//! pattern (format switched from JSON-config to JSON-history here, binary
//! artifacts use `bincode` instead).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::defense::BlockState;
use crate::error::IpsResult;
use crate::PacketRecord;

/// `blocked_ips_history.json` is append-style and never truncated — the
/// effective blocked set is derived by netting block/unblock events, not
/// by capping the log (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockEvent {
    Block,
    Unblock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHistoryEntry {
    pub address: std::net::IpAddr,
    pub state: BlockState,
    pub event: BlockEvent,
    pub success: bool,
    pub timestamp_secs: f64,
}

/// `defense_actions_history.json` is capped at 1000 entries; once the cap
/// is exceeded the oldest 20% are dropped in one batch before save,
/// per spec §6 (not a one-in-one-out FIFO).
const DEFENSE_ACTION_HISTORY_CAP: usize = 1000;
const DEFENSE_ACTION_HISTORY_TRIM_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefenseActionEntry {
    pub address: std::net::IpAddr,
    pub protocol: crate::Protocol,
    pub action: crate::Action,
    pub threat_level: crate::ThreatLevel,
    pub confidence: f32,
    pub timestamp_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockedIpsHistory {
    pub entries: Vec<BlockHistoryEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefenseActionsHistory {
    pub entries: std::collections::VecDeque<DefenseActionEntry>,
}

impl BlockedIpsHistory {
    pub fn load(path: impl AsRef<Path>) -> IpsResult<Self> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> IpsResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn record(&mut self, entry: BlockHistoryEntry) {
        self.entries.push(entry);
    }

    /// Net the event log per address: the most recent successful event
    /// decides whether an address is currently blocked, and under which
    /// state. Used to seed `DefenseExecutor::reconcile` at startup.
    pub fn effective_blocked_set(&self) -> Vec<(std::net::IpAddr, BlockState)> {
        let mut net: std::collections::HashMap<std::net::IpAddr, Option<BlockState>> =
            std::collections::HashMap::new();
        for entry in &self.entries {
            if !entry.success {
                continue;
            }
            match entry.event {
                BlockEvent::Block => {
                    net.insert(entry.address, Some(entry.state));
                }
                BlockEvent::Unblock => {
                    net.insert(entry.address, None);
                }
            }
        }
        net.into_iter()
            .filter_map(|(addr, state)| state.map(|s| (addr, s)))
            .collect()
    }
}

impl DefenseActionsHistory {
    pub fn load(path: impl AsRef<Path>) -> IpsResult<Self> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> IpsResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Append an entry, dropping the oldest 20% in one batch whenever the
    /// cap is exceeded rather than evicting one-for-one.
    pub fn record(&mut self, entry: DefenseActionEntry) {
        self.entries.push_back(entry);
        if self.entries.len() > DEFENSE_ACTION_HISTORY_CAP {
            let drop_count =
                (self.entries.len() as f64 * DEFENSE_ACTION_HISTORY_TRIM_FRACTION).ceil() as usize;
            for _ in 0..drop_count.min(self.entries.len()) {
                self.entries.pop_front();
            }
        }
    }
}

/// Export a batch of packet records to a timestamped CSV file under
/// `dir`, returning the path written. Filename and column set match spec
/// §6 exactly (`source, destination, protocol, length, ttl, flags`,
/// `length` as int32 and `ttl` as uint8); endpoint ports are folded into
/// the address column the way the original's capture-export writes a bare
/// address string rather than a separate port field.
pub fn export_packets_csv(dir: impl AsRef<Path>, records: &[PacketRecord], now_secs: f64) -> IpsResult<PathBuf> {
    std::fs::create_dir_all(dir.as_ref())?;
    let timestamp = chrono::DateTime::from_timestamp(now_secs as i64, 0)
        .unwrap_or_default()
        .format("%Y%m%d_%H%M%S");
    let filename = format!("captured_packets_{timestamp}.csv");
    let path = dir.as_ref().join(filename);

    let mut content = String::from("source,destination,protocol,length,ttl,flags\n");
    for r in records {
        content.push_str(&format!(
            "{},{},{:?},{},{},{}\n",
            r.source.addr, r.destination.addr, r.protocol, r.length as i32, r.ttl, r.flags
        ));
    }
    std::fs::write(&path, content)?;
    Ok(path)
}

/// Write `bytes` via a temp file + atomic rename, so a crash mid-write
/// never leaves a corrupt artifact at `path`.
pub fn atomic_write(path: impl AsRef<Path>, bytes: &[u8]) -> IpsResult<()> {
    let tmp = path.as_ref().with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
