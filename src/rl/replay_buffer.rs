//! C9: prioritized experience replay buffer.
//!
//! Sum-tree priority sampling (α=0.6), importance-sampling weights (β
//! annealed to 1.0), plus an IDS-aware retention floor that refuses to
//! evict malicious experiences below a configured fraction of capacity.
//! Directly grounded on the original's `SumTree` / `PrioritizedExperience
//! ReplayBuffer` / `IDSExperienceReplayBuffer` trio.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{IpsError, IpsResult};
use crate::Experience;

const ALPHA: f32 = 0.6;
const BETA_START: f32 = 0.4;
const BETA_INCREMENT: f32 = 0.001;
const PRIORITY_EPSILON: f32 = 1e-6;

/// Binary sum-tree over sampling priorities, array-backed per the
/// original's implementation rather than a pointer tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SumTree {
    capacity: usize,
    tree: Vec<f32>,
    write_cursor: usize,
    size: usize,
}

impl SumTree {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tree: vec![0.0; 2 * capacity - 1],
            write_cursor: 0,
            size: 0,
        }
    }

    fn total(&self) -> f32 {
        self.tree[0]
    }

    fn update_leaf(&mut self, data_index: usize, priority: f32) {
        let tree_index = data_index + self.capacity - 1;
        let change = priority - self.tree[tree_index];
        self.tree[tree_index] = priority;
        self.propagate(tree_index, change);
    }

    fn propagate(&mut self, tree_index: usize, change: f32) {
        let mut idx = tree_index;
        while idx != 0 {
            idx = (idx - 1) / 2;
            self.tree[idx] += change;
        }
    }

    fn insert(&mut self, priority: f32) -> usize {
        let data_index = self.write_cursor;
        self.update_leaf(data_index, priority);
        self.write_cursor = (self.write_cursor + 1) % self.capacity;
        self.size = (self.size + 1).min(self.capacity);
        data_index
    }

    /// Locate the data index whose cumulative priority range contains `value`.
    fn get(&self, value: f32) -> (usize, f32) {
        let mut idx = 0usize;
        let mut remaining = value;
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            if left >= self.tree.len() {
                break;
            }
            if remaining <= self.tree[left] {
                idx = left;
            } else {
                remaining -= self.tree[left];
                idx = right;
            }
        }
        let data_index = idx + 1 - self.capacity;
        (data_index, self.tree[idx])
    }
}

/// Record stored in the ring buffer alongside its experience, tracking
/// whether it is protected by the malicious-retention floor.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot {
    experience: Experience,
}

impl Slot {
    #[allow(dead_code)]
    fn is_malicious(&self) -> bool {
        self.experience.meta.is_malicious
    }
}

/// Prioritized, IDS-aware replay buffer.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplayBuffer {
    capacity: usize,
    malicious_preserve_ratio: f32,
    tree: SumTree,
    slots: Vec<Option<Slot>>,
    beta: f32,
    max_priority: f32,
}

/// A sampled minibatch: experience indices (for priority updates),
/// importance-sampling weights, and the experiences themselves.
pub struct Batch {
    pub indices: Vec<usize>,
    pub weights: Vec<f32>,
    pub experiences: Vec<Experience>,
}

impl ReplayBuffer {
    /// `malicious_preserve_ratio` is the fraction of capacity (rounded up)
    /// reserved for malicious experiences once the buffer is full; default
    /// per spec is 0.3.
    pub fn new(capacity: usize, malicious_preserve_ratio: f32) -> Self {
        Self {
            capacity,
            malicious_preserve_ratio,
            tree: SumTree::new(capacity),
            slots: vec![None; capacity],
            beta: BETA_START,
            max_priority: 1.0,
        }
    }

    pub fn len(&self) -> usize {
        self.tree.size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn malicious_floor(&self) -> usize {
        (self.capacity as f32 * self.malicious_preserve_ratio).ceil() as usize
    }

    fn malicious_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|s| s.experience.meta.is_malicious)
            .count()
    }

    /// Push a new experience, using maximum observed priority so freshly
    /// added experiences are sampled at least once before their priority
    /// is corrected by a TD-error update.
    ///
    /// If the buffer is full and the slot about to be overwritten holds a
    /// malicious experience while the floor has not yet been met, find a
    /// non-malicious victim slot instead (the original's
    /// `_make_space_for_malicious`); if every slot is malicious the new
    /// experience is simply not admitted.
    pub fn push(&mut self, experience: Experience) {
        if self.len() < self.capacity {
            let idx = self.tree.insert(self.max_priority);
            self.slots[idx] = Some(Slot { experience });
            return;
        }

        let victim = self.tree.write_cursor;
        let victim_is_malicious = self.slots[victim]
            .as_ref()
            .map(|s| s.experience.meta.is_malicious)
            .unwrap_or(false);

        if victim_is_malicious && self.malicious_count() <= self.malicious_floor() {
            if let Some(non_malicious_idx) = self
                .slots
                .iter()
                .position(|s| s.as_ref().map(|s| !s.experience.meta.is_malicious).unwrap_or(false))
            {
                self.tree.update_leaf(non_malicious_idx, self.max_priority);
                self.slots[non_malicious_idx] = Some(Slot { experience });
                return;
            }
            // Every slot is malicious and we're below the floor already;
            // admit nothing rather than evict protected experiences.
            return;
        }

        let idx = self.tree.insert(self.max_priority);
        self.slots[idx] = Some(Slot { experience });
    }

    /// Sample a minibatch of `batch_size`, annealing β toward 1.0 on every
    /// call.
    pub fn sample(&mut self, batch_size: usize) -> IpsResult<Batch> {
        if self.len() < batch_size {
            return Err(IpsError::recoverable(format!(
                "cannot sample {batch_size} experiences from buffer of size {}",
                self.len()
            )));
        }

        self.beta = (self.beta + BETA_INCREMENT).min(1.0);
        let total = self.tree.total();
        let segment = total / batch_size as f32;

        let mut indices = Vec::with_capacity(batch_size);
        let mut experiences = Vec::with_capacity(batch_size);
        let mut raw_priorities = Vec::with_capacity(batch_size);

        for i in 0..batch_size {
            let lo = segment * i as f32;
            let hi = segment * (i + 1) as f32;
            let value = lo + rand::random::<f32>() * (hi - lo).max(1e-9);
            let (data_index, priority) = self.tree.get(value.min(total - 1e-6).max(0.0));
            let slot = self.slots[data_index]
                .as_ref()
                .ok_or_else(|| IpsError::recoverable("sampled empty replay slot"))?;
            indices.push(data_index);
            experiences.push(slot.experience.clone());
            raw_priorities.push(priority.max(PRIORITY_EPSILON));
        }

        let min_prob = raw_priorities
            .iter()
            .cloned()
            .fold(f32::INFINITY, f32::min)
            / total;
        let max_weight = (min_prob * self.len() as f32).powf(-self.beta).max(1.0);

        let weights = raw_priorities
            .iter()
            .map(|&p| {
                let prob = p / total;
                ((prob * self.len() as f32).powf(-self.beta)) / max_weight
            })
            .collect();

        Ok(Batch {
            indices,
            weights,
            experiences,
        })
    }

    /// Update priorities for the given indices from freshly computed
    /// TD-errors (`|delta| + epsilon`, raised to α).
    pub fn update_priorities(&mut self, indices: &[usize], td_errors: &[f32]) {
        for (&idx, &td_error) in indices.iter().zip(td_errors) {
            let priority = (td_error.abs() + PRIORITY_EPSILON).powf(ALPHA);
            self.max_priority = self.max_priority.max(priority);
            self.tree.update_leaf(idx, priority);
        }
    }

    pub fn attack_statistics(&self) -> std::collections::HashMap<crate::AttackKind, usize> {
        let mut map = std::collections::HashMap::new();
        for slot in self.slots.iter().flatten() {
            *map.entry(slot.experience.meta.attack_kind).or_insert(0) += 1;
        }
        map
    }

    pub fn save(&self, path: impl AsRef<Path>) -> IpsResult<()> {
        let bytes = bincode::serialize(self)
            .map_err(|e| IpsError::Serde(format!("replay buffer encode error: {e}")))?;
        let tmp = path.as_ref().with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> IpsResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        bincode::deserialize(&bytes)
            .map_err(|e| IpsError::recoverable(format!("replay buffer decode error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, AttackKind, ExperienceMeta, RLState};

    fn experience(is_malicious: bool) -> Experience {
        Experience {
            state: RLState([0.0; 10]),
            action: Action::Allow,
            reward: 1.0,
            next_state: RLState([0.0; 10]),
            done: false,
            meta: ExperienceMeta {
                is_malicious,
                attack_kind: if is_malicious {
                    AttackKind::Ddos
                } else {
                    AttackKind::Normal
                },
                timestamp: 0.0,
            },
        }
    }

    #[test]
    fn push_and_sample_round_trip() {
        let mut buffer = ReplayBuffer::new(16, 0.3);
        for _ in 0..16 {
            buffer.push(experience(false));
        }
        let batch = buffer.sample(4).unwrap();
        assert_eq!(batch.experiences.len(), 4);
        assert_eq!(batch.weights.len(), 4);
        assert!(batch.weights.iter().all(|w| *w > 0.0 && w.is_finite()));
    }

    #[test]
    fn sampling_below_size_errors() {
        let mut buffer = ReplayBuffer::new(16, 0.3);
        buffer.push(experience(false));
        assert!(buffer.sample(4).is_err());
    }

    #[test]
    fn malicious_retention_floor_is_respected_under_pressure() {
        let mut buffer = ReplayBuffer::new(10, 0.3);
        // Fill with malicious experiences up to the floor (ceil(0.3*10)=3),
        // then flood with non-malicious — malicious slots should survive.
        for _ in 0..3 {
            buffer.push(experience(true));
        }
        for _ in 0..20 {
            buffer.push(experience(false));
        }
        let stats = buffer.attack_statistics();
        let malicious = stats.get(&AttackKind::Ddos).copied().unwrap_or(0);
        assert!(malicious >= 3, "expected at least 3 malicious experiences retained, found {malicious}");
    }

    #[test]
    fn priority_updates_affect_future_sampling_distribution() {
        let mut buffer = ReplayBuffer::new(8, 0.3);
        for _ in 0..8 {
            buffer.push(experience(false));
        }
        let batch = buffer.sample(4).unwrap();
        buffer.update_priorities(&batch.indices, &vec![5.0; batch.indices.len()]);
        assert!(buffer.tree.total() > 0.0);
    }

    #[test]
    fn save_and_load_round_trip() {
        let mut buffer = ReplayBuffer::new(8, 0.3);
        for _ in 0..8 {
            buffer.push(experience(false));
        }
        let dir = std::env::temp_dir().join(format!("ips-core-replay-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rl_buffer.bin");
        buffer.save(&path).unwrap();
        let loaded = ReplayBuffer::load(&path).unwrap();
        assert_eq!(loaded.len(), buffer.len());
        std::fs::remove_dir_all(&dir).ok();
    }
}
