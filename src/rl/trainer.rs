//! C10: online trainer.
//!
//! A background task that periodically draws a minibatch from the replay
//! buffer and takes one gradient step, keeping a bounded history of
//! recent losses for the statistics API. Grounded on the original's
//! `online_rl_trainer.py` wake/retry loop.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info};

use super::agent::{CqlAgent, TrainStepReport};
use super::replay_buffer::ReplayBuffer;
use crate::error::IpsResult;
use crate::stats::Statistics;

const WAKE_INTERVAL: Duration = Duration::from_secs(10);
const MIN_BATCH_SIZE: usize = 32;
const LOSS_HISTORY_CAP: usize = 100;
const RETRY_BACKOFF: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Bounded ring of recent training reports for the statistics snapshot.
pub struct LossHistory {
    reports: Mutex<std::collections::VecDeque<TrainStepReport>>,
}

impl LossHistory {
    fn new() -> Self {
        Self {
            reports: Mutex::new(std::collections::VecDeque::with_capacity(LOSS_HISTORY_CAP)),
        }
    }

    fn push(&self, report: TrainStepReport) {
        let mut guard = self.reports.lock();
        if guard.len() >= LOSS_HISTORY_CAP {
            guard.pop_front();
        }
        guard.push_back(report);
    }

    pub fn recent(&self) -> Vec<TrainStepReport> {
        self.reports.lock().iter().cloned().collect()
    }

    pub fn mean_total_loss(&self) -> Option<f32> {
        let guard = self.reports.lock();
        if guard.is_empty() {
            None
        } else {
            Some(guard.iter().map(|r| r.total_loss).sum::<f32>() / guard.len() as f32)
        }
    }
}

/// Runs the background training loop. Owns the agent and replay buffer
/// jointly so it can hold them across awaits without external locking
/// races; callers access both only through `OnlineTrainer`'s methods.
pub struct OnlineTrainer {
    agent: Mutex<CqlAgent>,
    buffer: Mutex<ReplayBuffer>,
    history: LossHistory,
}

impl OnlineTrainer {
    pub fn new(agent: CqlAgent, buffer: ReplayBuffer) -> Arc<Self> {
        Arc::new(Self {
            agent: Mutex::new(agent),
            buffer: Mutex::new(buffer),
            history: LossHistory::new(),
        })
    }

    pub fn loss_history(&self) -> &LossHistory {
        &self.history
    }

    pub fn record_experience(&self, experience: crate::Experience) {
        self.buffer.lock().push(experience);
    }

    pub fn act(&self, state: &crate::RLState, explore: bool) -> crate::Action {
        self.agent.lock().act(state, explore)
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Persist the agent and replay buffer to disk via their own
    /// atomic-rename save helpers. Intended for shutdown and periodic
    /// checkpointing.
    pub fn save(&self, agent_path: impl AsRef<std::path::Path>, buffer_path: impl AsRef<std::path::Path>) -> IpsResult<()> {
        self.agent.lock().save(agent_path)?;
        self.buffer.lock().save(buffer_path)?;
        Ok(())
    }

    /// Run one training step if enough experiences are available.
    /// Returns `Ok(None)` rather than erroring when the precondition
    /// isn't met — an empty buffer is an expected startup state, not a
    /// failure.
    fn try_train_once(&self) -> IpsResult<Option<TrainStepReport>> {
        let mut buffer = self.buffer.lock();
        if buffer.len() < MIN_BATCH_SIZE {
            return Ok(None);
        }
        let batch = buffer.sample(MIN_BATCH_SIZE)?;
        drop(buffer);

        let states: Vec<_> = batch.experiences.iter().map(|e| e.state).collect();
        let actions: Vec<_> = batch.experiences.iter().map(|e| e.action).collect();
        let rewards: Vec<_> = batch.experiences.iter().map(|e| e.reward).collect();
        let next_states: Vec<_> = batch.experiences.iter().map(|e| e.next_state).collect();
        let dones: Vec<_> = batch.experiences.iter().map(|e| e.done).collect();

        let (td_errors, report) = {
            let mut agent = self.agent.lock();
            agent.train_step(&states, &actions, &rewards, &next_states, &dones, &batch.weights)?
        };

        self.buffer.lock().update_priorities(&batch.indices, &td_errors);
        Ok(Some(report))
    }

    /// Spawn the background training loop. `shutdown` is a watch channel;
    /// setting it to `true` requests a cooperative stop, and the loop
    /// drains within `SHUTDOWN_GRACE` before returning. `stats`, if
    /// given, receives a `record_training_step`/`record_ml_update` call
    /// for every completed gradient step.
    pub fn spawn(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        stats: Option<Arc<Statistics>>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = Duration::ZERO;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(WAKE_INTERVAL + backoff) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }

                if *shutdown.borrow() {
                    break;
                }

                match self.try_train_once() {
                    Ok(Some(report)) => {
                        backoff = Duration::ZERO;
                        self.history.push(report);
                        if let Some(stats) = &stats {
                            stats.record_training_step();
                            stats.record_ml_update();
                        }
                        info!(
                            td_loss = report.td_loss,
                            cql_penalty = report.cql_penalty,
                            "online trainer step complete"
                        );
                    }
                    Ok(None) => {
                        backoff = Duration::ZERO;
                    }
                    Err(e) => {
                        error!(error = %e, "online trainer step failed, backing off");
                        backoff = RETRY_BACKOFF;
                    }
                }
            }

            // Drain: take one last training step over whatever landed in
            // the buffer since the previous wake, bounded so shutdown
            // never blocks indefinitely on a stuck batch.
            let this = self.clone();
            match tokio::time::timeout(
                SHUTDOWN_GRACE,
                tokio::task::spawn_blocking(move || this.try_train_once()),
            )
            .await
            {
                Ok(Ok(Ok(Some(report)))) => {
                    self.history.push(report);
                    if let Some(stats) = &stats {
                        stats.record_training_step();
                        stats.record_ml_update();
                    }
                    info!("drained a final training step before shutdown");
                }
                Ok(Ok(Ok(None))) => {}
                Ok(Ok(Err(e))) => {
                    error!(error = %e, "final drain training step failed during shutdown");
                }
                Ok(Err(e)) => {
                    error!(error = %e, "final drain task panicked during shutdown");
                }
                Err(_) => {
                    error!(seconds = SHUTDOWN_GRACE.as_secs(), "shutdown drain timed out");
                }
            }
        })
    }
}
