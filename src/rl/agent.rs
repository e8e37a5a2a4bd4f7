//! C8: conservative Q-learning response-policy agent.
//!
//! No ML framework: a small dense network with manual forward/backward,
//! matching the corpus's own preference for hand-rolled numeric code over
//! a heavy dependency (`candle-core`/`ort` sit in the workspace's
//! dependency table but are unused even by the crate that nominally
//! wants them — see DESIGN.md). Hyperparameters are lifted directly from
//! the original's `ConservativeRLAgent.__init__`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{IpsError, IpsResult};
use crate::{Action, OperatingMode, RLState};

pub const STATE_SIZE: usize = RLState::DIM;
pub const ACTION_SIZE: usize = Action::COUNT;
const HIDDEN1_SIZE: usize = 64;
const HIDDEN2_SIZE: usize = 64;

const ALPHA_CQL: f32 = 1.0;
const TAU: f32 = 0.005;
const GAMMA: f32 = 0.99;
const LEARNING_RATE: f32 = 1e-4;
const EPSILON_START: f32 = 0.1;
const EPSILON_MIN: f32 = 0.01;
const EPSILON_DECAY: f32 = 0.999;
const GRAD_CLIP_NORM: f32 = 1.0;

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPS: f32 = 1e-8;

/// Hidden-layer nonlinearity, fixed per agent at construction time by its
/// `OperatingMode` (spec: "two layers ~64 units, tanh/ReLU, depending on
/// mode"). Lightweight hosts get ReLU (cheaper per-packet forward pass);
/// performance mode affords the smoother `tanh` Q-surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Activation {
    Relu,
    Tanh,
}

impl Activation {
    fn for_mode(mode: OperatingMode) -> Self {
        match mode {
            OperatingMode::Lightweight => Activation::Relu,
            OperatingMode::Performance => Activation::Tanh,
        }
    }

    fn apply(self, pre: f32) -> f32 {
        match self {
            Activation::Relu => pre.max(0.0),
            Activation::Tanh => pre.tanh(),
        }
    }

    /// Derivative expressed in terms of the layer's own pre/post
    /// activations, avoiding a second pass over raw inputs.
    fn grad(self, pre: f32, post: f32) -> f32 {
        match self {
            Activation::Relu => {
                if pre > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Tanh => 1.0 - post * post,
        }
    }
}

/// Dense three-layer network: `state -> hidden1 -> hidden2 -> Q(state, ·)`.
/// Weights are stored row-major, `out[i] = sum_j w[i][j] * in[j] + b[i]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DenseNet {
    w1: Vec<Vec<f32>>, // HIDDEN1_SIZE x STATE_SIZE
    b1: Vec<f32>,
    w2: Vec<Vec<f32>>, // HIDDEN2_SIZE x HIDDEN1_SIZE
    b2: Vec<f32>,
    w3: Vec<Vec<f32>>, // ACTION_SIZE x HIDDEN2_SIZE
    b3: Vec<f32>,
}

/// Forward-pass intermediates needed for backprop: pre-activations of
/// both hidden layers plus the output.
struct Forward {
    h1_pre: Vec<f32>,
    h1: Vec<f32>,
    h2_pre: Vec<f32>,
    h2: Vec<f32>,
    q: Vec<f32>,
}

impl DenseNet {
    fn random(rng: &mut impl Rng) -> Self {
        let scale1 = (2.0 / STATE_SIZE as f32).sqrt();
        let scale2 = (2.0 / HIDDEN1_SIZE as f32).sqrt();
        let scale3 = (2.0 / HIDDEN2_SIZE as f32).sqrt();
        Self {
            w1: (0..HIDDEN1_SIZE)
                .map(|_| (0..STATE_SIZE).map(|_| rng.gen_range(-1.0..1.0) * scale1).collect())
                .collect(),
            b1: vec![0.0; HIDDEN1_SIZE],
            w2: (0..HIDDEN2_SIZE)
                .map(|_| (0..HIDDEN1_SIZE).map(|_| rng.gen_range(-1.0..1.0) * scale2).collect())
                .collect(),
            b2: vec![0.0; HIDDEN2_SIZE],
            w3: (0..ACTION_SIZE)
                .map(|_| (0..HIDDEN2_SIZE).map(|_| rng.gen_range(-1.0..1.0) * scale3).collect())
                .collect(),
            b3: vec![0.0; ACTION_SIZE],
        }
    }

    fn forward(&self, state: &[f32], act: Activation) -> Forward {
        let h1_pre: Vec<f32> = (0..HIDDEN1_SIZE)
            .map(|i| {
                self.w1[i].iter().zip(state).map(|(w, s)| w * s).sum::<f32>() + self.b1[i]
            })
            .collect();
        let h1: Vec<f32> = h1_pre.iter().map(|&x| act.apply(x)).collect();

        let h2_pre: Vec<f32> = (0..HIDDEN2_SIZE)
            .map(|i| {
                self.w2[i].iter().zip(&h1).map(|(w, h)| w * h).sum::<f32>() + self.b2[i]
            })
            .collect();
        let h2: Vec<f32> = h2_pre.iter().map(|&x| act.apply(x)).collect();

        let q: Vec<f32> = (0..ACTION_SIZE)
            .map(|i| {
                self.w3[i].iter().zip(&h2).map(|(w, h)| w * h).sum::<f32>() + self.b3[i]
            })
            .collect();

        Forward { h1_pre, h1, h2_pre, h2, q }
    }

    fn q_values(&self, state: &[f32], act: Activation) -> Vec<f32> {
        self.forward(state, act).q
    }
}

/// Adam optimizer moment state, one entry per parameter tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AdamState {
    m_w1: Vec<Vec<f32>>,
    v_w1: Vec<Vec<f32>>,
    m_b1: Vec<f32>,
    v_b1: Vec<f32>,
    m_w2: Vec<Vec<f32>>,
    v_w2: Vec<Vec<f32>>,
    m_b2: Vec<f32>,
    v_b2: Vec<f32>,
    m_w3: Vec<Vec<f32>>,
    v_w3: Vec<Vec<f32>>,
    m_b3: Vec<f32>,
    v_b3: Vec<f32>,
    step: u64,
}

impl AdamState {
    fn zeros() -> Self {
        Self {
            m_w1: vec![vec![0.0; STATE_SIZE]; HIDDEN1_SIZE],
            v_w1: vec![vec![0.0; STATE_SIZE]; HIDDEN1_SIZE],
            m_b1: vec![0.0; HIDDEN1_SIZE],
            v_b1: vec![0.0; HIDDEN1_SIZE],
            m_w2: vec![vec![0.0; HIDDEN1_SIZE]; HIDDEN2_SIZE],
            v_w2: vec![vec![0.0; HIDDEN1_SIZE]; HIDDEN2_SIZE],
            m_b2: vec![0.0; HIDDEN2_SIZE],
            v_b2: vec![0.0; HIDDEN2_SIZE],
            m_w3: vec![vec![0.0; HIDDEN2_SIZE]; ACTION_SIZE],
            v_w3: vec![vec![0.0; HIDDEN2_SIZE]; ACTION_SIZE],
            m_b3: vec![0.0; ACTION_SIZE],
            v_b3: vec![0.0; ACTION_SIZE],
            step: 0,
        }
    }
}

fn adam_update(param: &mut f32, grad: f32, m: &mut f32, v: &mut f32, step: u64) {
    *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * grad;
    *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * grad * grad;
    let m_hat = *m / (1.0 - ADAM_BETA1.powi(step as i32));
    let v_hat = *v / (1.0 - ADAM_BETA2.powi(step as i32));
    *param -= LEARNING_RATE * m_hat / (v_hat.sqrt() + ADAM_EPS);
}

fn logsumexp(values: &[f32]) -> f32 {
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

fn clip_grad_norm(grads: &mut [f32], max_norm: f32) {
    let norm = grads.iter().map(|g| g * g).sum::<f32>().sqrt();
    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        for g in grads.iter_mut() {
            *g *= scale;
        }
    }
}

/// Conservative Q-learning agent with a soft-updated target network and
/// ε-greedy exploration biased toward conservative actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CqlAgent {
    online: DenseNet,
    target: DenseNet,
    activation: Activation,
    #[serde(skip, default = "AdamState::zeros")]
    adam: AdamState,
    pub epsilon: f32,
    pub train_steps: u64,
}

/// Outcome of a single training step, reported to the trainer's bounded
/// loss history.
#[derive(Debug, Clone, Copy)]
pub struct TrainStepReport {
    pub td_loss: f32,
    pub cql_penalty: f32,
    pub total_loss: f32,
}

impl CqlAgent {
    /// Builds a fresh agent for `mode`, which fixes the hidden-layer
    /// activation for the agent's lifetime.
    pub fn for_mode(mode: OperatingMode) -> Self {
        let mut rng = rand::thread_rng();
        let online = DenseNet::random(&mut rng);
        Self {
            target: online.clone(),
            online,
            activation: Activation::for_mode(mode),
            adam: AdamState::zeros(),
            epsilon: EPSILON_START,
            train_steps: 0,
        }
    }

    pub fn new() -> Self {
        Self::for_mode(OperatingMode::Lightweight)
    }

    /// Select an action for `state`. During exploration (probability
    /// `epsilon`) the choice is restricted to `Action::CONSERVATIVE`
    /// rather than a uniform random action, per the original's bias
    /// toward safe actions while still exploring.
    pub fn act(&self, state: &RLState, explore: bool) -> Action {
        if explore && rand::random::<f32>() < self.epsilon {
            let idx = rand::thread_rng().gen_range(0..Action::CONSERVATIVE.len());
            return Action::CONSERVATIVE[idx];
        }
        let q = self.online.q_values(state.as_slice(), self.activation);
        let best = q
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap_or(0);
        Action::try_from(best).unwrap_or(Action::Allow)
    }

    pub fn decay_epsilon(&mut self) {
        self.epsilon = (self.epsilon * EPSILON_DECAY).max(EPSILON_MIN);
    }

    /// One gradient step over a minibatch using Double-DQN targets plus a
    /// CQL conservative penalty, with importance-sampling weights from the
    /// prioritized replay buffer. Returns the per-sample TD-errors (for
    /// priority updates) and a loss report.
    pub fn train_step(
        &mut self,
        states: &[RLState],
        actions: &[Action],
        rewards: &[f32],
        next_states: &[RLState],
        dones: &[bool],
        is_weights: &[f32],
    ) -> IpsResult<(Vec<f32>, TrainStepReport)> {
        let n = states.len();
        if n == 0 {
            return Err(IpsError::recoverable("train_step called with empty batch"));
        }

        self.adam.step += 1;
        let mut td_errors = Vec::with_capacity(n);
        let mut td_loss_sum = 0.0f32;
        let mut cql_penalty_sum = 0.0f32;

        let mut grad_w1 = vec![vec![0.0f32; STATE_SIZE]; HIDDEN1_SIZE];
        let mut grad_b1 = vec![0.0f32; HIDDEN1_SIZE];
        let mut grad_w2 = vec![vec![0.0f32; HIDDEN1_SIZE]; HIDDEN2_SIZE];
        let mut grad_b2 = vec![0.0f32; HIDDEN2_SIZE];
        let mut grad_w3 = vec![vec![0.0f32; HIDDEN2_SIZE]; ACTION_SIZE];
        let mut grad_b3 = vec![0.0f32; ACTION_SIZE];

        for i in 0..n {
            let fwd = self.online.forward(states[i].as_slice(), self.activation);

            // Double DQN target: online network selects the action,
            // target network evaluates it.
            let next_q_online = self.online.q_values(next_states[i].as_slice(), self.activation);
            let best_next = next_q_online
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(idx, _)| idx)
                .unwrap_or(0);
            let next_q_target = self.target.q_values(next_states[i].as_slice(), self.activation);
            let target_value = if dones[i] {
                rewards[i]
            } else {
                rewards[i] + GAMMA * next_q_target[best_next]
            };

            let action_idx = actions[i] as usize;
            let td_error = (target_value - fwd.q[action_idx]) * is_weights[i];
            td_errors.push(td_error);
            td_loss_sum += 0.5 * td_error * td_error;

            // CQL conservative penalty: logsumexp(Q) - Q(chosen action),
            // pushing down over-estimated out-of-distribution actions.
            let lse = logsumexp(&fwd.q);
            let penalty = lse - fwd.q[action_idx];
            cql_penalty_sum += penalty;

            // d(total_loss)/d(q[a]) for a == action_idx combines the TD
            // term and the CQL term; for other actions only the CQL
            // softmax term contributes.
            let softmax_denom: f32 = fwd.q.iter().map(|&q| (q - lse).exp()).sum();
            let mut dq = vec![0.0f32; ACTION_SIZE];
            for a in 0..ACTION_SIZE {
                let softmax_a = (fwd.q[a] - lse).exp() / softmax_denom.max(1e-9);
                let cql_grad = ALPHA_CQL * (softmax_a - if a == action_idx { 1.0 } else { 0.0 });
                let td_grad = if a == action_idx { -td_error } else { 0.0 };
                dq[a] = td_grad + cql_grad;
            }

            // Layer 3 (output): dq -> grad_w3/grad_b3, backprop into h2.
            let mut dh2 = vec![0.0f32; HIDDEN2_SIZE];
            for a in 0..ACTION_SIZE {
                for h in 0..HIDDEN2_SIZE {
                    grad_w3[a][h] += dq[a] * fwd.h2[h];
                    dh2[h] += dq[a] * self.online.w3[a][h];
                }
                grad_b3[a] += dq[a];
            }

            // Layer 2 (second hidden): dh2 -> dh2_pre via activation
            // derivative -> grad_w2/grad_b2, backprop into h1.
            let mut dh1 = vec![0.0f32; HIDDEN1_SIZE];
            let mut dh2_pre = vec![0.0f32; HIDDEN2_SIZE];
            for h in 0..HIDDEN2_SIZE {
                dh2_pre[h] = dh2[h] * self.activation.grad(fwd.h2_pre[h], fwd.h2[h]);
                for k in 0..HIDDEN1_SIZE {
                    grad_w2[h][k] += dh2_pre[h] * fwd.h1[k];
                    dh1[k] += dh2_pre[h] * self.online.w2[h][k];
                }
                grad_b2[h] += dh2_pre[h];
            }

            // Layer 1 (first hidden): dh1 -> dh1_pre -> grad_w1/grad_b1.
            for k in 0..HIDDEN1_SIZE {
                let dh1_pre = dh1[k] * self.activation.grad(fwd.h1_pre[k], fwd.h1[k]);
                for s in 0..STATE_SIZE {
                    grad_w1[k][s] += dh1_pre * states[i].as_slice()[s];
                }
                grad_b1[k] += dh1_pre;
            }
        }

        let inv_n = 1.0 / n as f32;
        let mut flat_grads: Vec<f32> = Vec::new();
        for row in grad_w1.iter_mut() {
            for g in row.iter_mut() {
                *g *= inv_n;
                flat_grads.push(*g);
            }
        }
        for g in grad_b1.iter_mut() {
            *g *= inv_n;
            flat_grads.push(*g);
        }
        for row in grad_w2.iter_mut() {
            for g in row.iter_mut() {
                *g *= inv_n;
                flat_grads.push(*g);
            }
        }
        for g in grad_b2.iter_mut() {
            *g *= inv_n;
            flat_grads.push(*g);
        }
        for row in grad_w3.iter_mut() {
            for g in row.iter_mut() {
                *g *= inv_n;
                flat_grads.push(*g);
            }
        }
        for g in grad_b3.iter_mut() {
            *g *= inv_n;
            flat_grads.push(*g);
        }
        clip_grad_norm(&mut flat_grads, GRAD_CLIP_NORM);

        // Re-walk the same flattened order to apply clipped gradients via Adam.
        let mut cursor = 0;
        let step = self.adam.step;
        for h in 0..HIDDEN1_SIZE {
            for s in 0..STATE_SIZE {
                adam_update(
                    &mut self.online.w1[h][s],
                    flat_grads[cursor],
                    &mut self.adam.m_w1[h][s],
                    &mut self.adam.v_w1[h][s],
                    step,
                );
                cursor += 1;
            }
        }
        for h in 0..HIDDEN1_SIZE {
            adam_update(
                &mut self.online.b1[h],
                flat_grads[cursor],
                &mut self.adam.m_b1[h],
                &mut self.adam.v_b1[h],
                step,
            );
            cursor += 1;
        }
        for h in 0..HIDDEN2_SIZE {
            for k in 0..HIDDEN1_SIZE {
                adam_update(
                    &mut self.online.w2[h][k],
                    flat_grads[cursor],
                    &mut self.adam.m_w2[h][k],
                    &mut self.adam.v_w2[h][k],
                    step,
                );
                cursor += 1;
            }
        }
        for h in 0..HIDDEN2_SIZE {
            adam_update(
                &mut self.online.b2[h],
                flat_grads[cursor],
                &mut self.adam.m_b2[h],
                &mut self.adam.v_b2[h],
                step,
            );
            cursor += 1;
        }
        for a in 0..ACTION_SIZE {
            for h in 0..HIDDEN2_SIZE {
                adam_update(
                    &mut self.online.w3[a][h],
                    flat_grads[cursor],
                    &mut self.adam.m_w3[a][h],
                    &mut self.adam.v_w3[a][h],
                    step,
                );
                cursor += 1;
            }
        }
        for a in 0..ACTION_SIZE {
            adam_update(
                &mut self.online.b3[a],
                flat_grads[cursor],
                &mut self.adam.m_b3[a],
                &mut self.adam.v_b3[a],
                step,
            );
            cursor += 1;
        }

        self.soft_update_target();
        self.train_steps += 1;
        self.decay_epsilon();

        let report = TrainStepReport {
            td_loss: td_loss_sum / n as f32,
            cql_penalty: cql_penalty_sum / n as f32,
            total_loss: (td_loss_sum + ALPHA_CQL * cql_penalty_sum) / n as f32,
        };

        Ok((td_errors, report))
    }

    /// Polyak-average the target network toward the online network:
    /// `target = tau * online + (1 - tau) * target`.
    fn soft_update_target(&mut self) {
        for h in 0..HIDDEN1_SIZE {
            for s in 0..STATE_SIZE {
                self.target.w1[h][s] =
                    TAU * self.online.w1[h][s] + (1.0 - TAU) * self.target.w1[h][s];
            }
            self.target.b1[h] = TAU * self.online.b1[h] + (1.0 - TAU) * self.target.b1[h];
        }
        for h in 0..HIDDEN2_SIZE {
            for k in 0..HIDDEN1_SIZE {
                self.target.w2[h][k] =
                    TAU * self.online.w2[h][k] + (1.0 - TAU) * self.target.w2[h][k];
            }
            self.target.b2[h] = TAU * self.online.b2[h] + (1.0 - TAU) * self.target.b2[h];
        }
        for a in 0..ACTION_SIZE {
            for h in 0..HIDDEN2_SIZE {
                self.target.w3[a][h] =
                    TAU * self.online.w3[a][h] + (1.0 - TAU) * self.target.w3[a][h];
            }
            self.target.b3[a] = TAU * self.online.b3[a] + (1.0 - TAU) * self.target.b3[a];
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> IpsResult<()> {
        let bytes = bincode::serialize(self)
            .map_err(|e| IpsError::Serde(format!("agent encode error: {e}")))?;
        let tmp = path.as_ref().with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load an agent, validating that the stored architecture matches the
    /// compiled-in `STATE_SIZE`/`ACTION_SIZE`. A mismatch is a
    /// `Recoverable` error — callers should fall back to a fresh agent.
    pub fn load(path: impl AsRef<Path>) -> IpsResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let agent: CqlAgent = bincode::deserialize(&bytes)
            .map_err(|e| IpsError::recoverable(format!("agent decode error: {e}")))?;
        if agent.online.w1[0].len() != STATE_SIZE || agent.online.w3.len() != ACTION_SIZE {
            return Err(IpsError::recoverable(
                "agent artifact state/action size mismatch",
            ));
        }
        Ok(agent)
    }
}

impl Default for CqlAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RLState {
        RLState([0.5; 10])
    }

    #[test]
    fn explore_picks_only_conservative_actions() {
        let mut agent = CqlAgent::new();
        agent.epsilon = 1.0;
        for _ in 0..50 {
            let action = agent.act(&state(), true);
            assert!(Action::CONSERVATIVE.contains(&action));
        }
    }

    #[test]
    fn exploit_is_deterministic_for_fixed_weights() {
        let agent = CqlAgent::new();
        let a1 = agent.act(&state(), false);
        let a2 = agent.act(&state(), false);
        assert_eq!(a1, a2);
    }

    #[test]
    fn epsilon_decays_toward_floor() {
        let mut agent = CqlAgent::new();
        for _ in 0..10_000 {
            agent.decay_epsilon();
        }
        assert!(agent.epsilon >= EPSILON_MIN);
        assert!(agent.epsilon < EPSILON_START);
    }

    #[test]
    fn train_step_reduces_loss_over_iterations_on_fixed_batch() {
        let mut agent = CqlAgent::new();
        let states = vec![state(); 8];
        let actions = vec![Action::RateLimit; 8];
        let rewards = vec![1.0; 8];
        let next_states = vec![state(); 8];
        let dones = vec![false; 8];
        let weights = vec![1.0; 8];

        let (_, first) = agent
            .train_step(&states, &actions, &rewards, &next_states, &dones, &weights)
            .unwrap();
        for _ in 0..20 {
            agent
                .train_step(&states, &actions, &rewards, &next_states, &dones, &weights)
                .unwrap();
        }
        let (_, last) = agent
            .train_step(&states, &actions, &rewards, &next_states, &dones, &weights)
            .unwrap();
        assert!(last.td_loss <= first.td_loss + 1e-3);
    }

    #[test]
    fn empty_batch_is_rejected() {
        let mut agent = CqlAgent::new();
        let result = agent.train_step(&[], &[], &[], &[], &[], &[]);
        assert!(result.is_err());
    }

    #[test]
    fn save_and_load_round_trip_preserves_architecture() {
        let agent = CqlAgent::new();
        let dir = std::env::temp_dir().join(format!("ips-core-agent-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rl_model.bin");
        agent.save(&path).unwrap();
        let loaded = CqlAgent::load(&path).unwrap();
        assert_eq!(loaded.train_steps, agent.train_steps);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn performance_mode_uses_tanh_activation() {
        let agent = CqlAgent::for_mode(OperatingMode::Performance);
        assert_eq!(agent.activation, Activation::Tanh);
        let lightweight = CqlAgent::for_mode(OperatingMode::Lightweight);
        assert_eq!(lightweight.activation, Activation::Relu);
    }

    #[test]
    fn clip_grad_norm_shrinks_large_gradients_only() {
        let mut small = vec![0.1, 0.1];
        clip_grad_norm(&mut small, 1.0);
        assert_eq!(small, vec![0.1, 0.1]);

        let mut large = vec![10.0, 10.0];
        clip_grad_norm(&mut large, 1.0);
        let norm = (large[0] * large[0] + large[1] * large[1]).sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
