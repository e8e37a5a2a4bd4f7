//! Process entry point: CLI parsing, tracing bootstrap, and pipeline
//! wiring. Grounded on `edge/src/main.rs`'s `tracing_subscriber` bootstrap
//! and `cli/src/main.rs`'s `clap::Parser` derive usage.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{fmt, EnvFilter};

use ips_core::capture::ReplayAdapter;
use ips_core::classifier::{ClassifierArtifact, ThreatClassifier};
use ips_core::config::IpsConfig;
use ips_core::defense::firewall::IptablesAdapter;
use ips_core::defense::DefenseExecutor;
use ips_core::error::ErrorKind;
use ips_core::orchestrator::Orchestrator;
use ips_core::persistence::{BlockedIpsHistory, DefenseActionsHistory};
use ips_core::queue::{PacketPool, PacketQueue};
use ips_core::rl::{CqlAgent, OnlineTrainer, ReplayBuffer};
use ips_core::stats::Statistics;
use ips_core::OperatingMode;

#[derive(Parser, Debug)]
#[command(name = "ips-core", version, about = "Host-based intrusion prevention core")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "IPS_CONFIG_PATH", default_value = "config.yaml")]
    config: PathBuf,

    /// Operating mode override; falls back to the config file's value.
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Stop after processing this many packets (0 = unbounded). Intended
    /// for offline replay/test runs, not live deployment.
    #[arg(long, default_value_t = 0)]
    max_packets: u64,

    /// Enable debug-level tracing regardless of `RUST_LOG`.
    #[arg(long)]
    debug: bool,

    /// Directory holding persisted state: `classifier_artifact.bin`,
    /// `rl_model.bin`, `rl_buffer.bin`, `blocked_ips_history.json`,
    /// `defense_actions_history.json` (spec §6).
    #[arg(long, default_value = "state")]
    state_dir: PathBuf,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ModeArg {
    Lightweight,
    Performance,
}

impl From<ModeArg> for OperatingMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Lightweight => OperatingMode::Lightweight,
            ModeArg::Performance => OperatingMode::Performance,
        }
    }
}

const EXIT_OK: i32 = 0;
const EXIT_MISSING_CAPTURE: i32 = 2;
const EXIT_FATAL: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = match IpsConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, path = ?cli.config, "failed to load config, using defaults");
            IpsConfig::default()
        }
    };

    let mode: OperatingMode = cli
        .mode
        .map(Into::into)
        .unwrap_or_else(|| config.system.mode.into());

    info!(?mode, config_path = ?cli.config, "starting ips-core");

    if let Err(e) = std::fs::create_dir_all(&cli.state_dir) {
        error!(error = %e, dir = ?cli.state_dir, "could not create state directory, continuing with in-memory state only");
    }
    let artifact_path = cli.state_dir.join("classifier_artifact.bin");
    let agent_path = cli.state_dir.join("rl_model.bin");
    let buffer_path = cli.state_dir.join("rl_buffer.bin");
    let block_history_path = cli.state_dir.join("blocked_ips_history.json");
    let action_history_path = cli.state_dir.join("defense_actions_history.json");

    // A missing artifact is a fresh install (fall back to the heuristic
    // path below); a *present-but-unloadable* one is the "classifier
    // artifact load failure" exit case from spec §6/§7 — the orchestrator
    // is the sole arbiter that escalates this to Fatal.
    let mut classifier = ThreatClassifier::new();
    if artifact_path.exists() {
        match ClassifierArtifact::load(&artifact_path) {
            Ok(artifact) => classifier = ThreatClassifier::with_artifact(artifact),
            Err(e) => {
                error!(error = %e, path = ?artifact_path, "classifier artifact present but failed to load");
                std::process::exit(EXIT_FATAL);
            }
        }
    } else {
        info!("no classifier artifact found, running on heuristic fallback only");
    }

    let firewall = Arc::new(IptablesAdapter::default());
    let defense = Arc::new(DefenseExecutor::new(firewall));

    let agent = CqlAgent::load(&agent_path).unwrap_or_else(|e| {
        if agent_path.exists() {
            error!(error = %e, path = ?agent_path, "rl model artifact failed to load, starting from a fresh agent");
        }
        CqlAgent::for_mode(mode)
    });
    let buffer = ReplayBuffer::load(&buffer_path).unwrap_or_else(|e| {
        if buffer_path.exists() {
            error!(error = %e, path = ?buffer_path, "replay buffer artifact failed to load, starting from an empty buffer");
        }
        ReplayBuffer::new(10_000, 0.3)
    });
    let trainer = OnlineTrainer::new(agent, buffer);
    let stats = Arc::new(Statistics::new());

    // Reconcile in-memory block state with the persisted history and a
    // live firewall scan before accepting traffic (spec §4.7).
    let history = BlockedIpsHistory::load(&block_history_path).unwrap_or_else(|e| {
        error!(error = %e, path = ?block_history_path, "block history failed to load, starting with no persisted blocks");
        BlockedIpsHistory::default()
    });
    if let Err(e) = defense.reconcile(&history.effective_blocked_set()).await {
        error!(error = %e, "startup block-state reconciliation failed");
    }

    let orchestrator = Arc::new(Orchestrator::new(
        queue_from(&config),
        Arc::new(PacketPool::new()),
        classifier,
        defense.clone(),
        trainer.clone(),
        stats.clone(),
        mode,
    ));
    orchestrator.set_max_packets(cli.max_packets);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (train_shutdown_tx, train_shutdown_rx) = watch::channel(false);
    let trainer_handle = trainer.clone().spawn(train_shutdown_rx, Some(stats.clone()));
    let maintenance_handle = orchestrator.clone().spawn_maintenance(shutdown_rx.clone());

    // No live capture backend ships in this crate (see Non-goals); the
    // replay adapter here processes an empty packet set and idles until
    // shutdown, matching the shape a real libpcap/AF_PACKET adapter would
    // take behind the same `CaptureAdapter` trait.
    let capture = Arc::new(ReplayAdapter::new(Vec::new()));

    let ctrl_c = tokio::signal::ctrl_c();
    let run_handle = tokio::spawn(orchestrator.clone().run(capture, shutdown_rx));

    tokio::select! {
        result = run_handle => {
            let exit_code = match result {
                Ok(Ok(())) => EXIT_OK,
                Ok(Err(e)) => {
                    error!(error = %e, "pipeline exited with error");
                    if e.kind() == ErrorKind::Fatal && e.to_string().contains("capture") {
                        EXIT_MISSING_CAPTURE
                    } else {
                        EXIT_FATAL
                    }
                }
                Err(e) => {
                    error!(error = %e, "pipeline task panicked");
                    EXIT_FATAL
                }
            };
            train_shutdown_tx.send(true).ok();
            shutdown_tx.send(true).ok();
            let _ = trainer_handle.await;
            let _ = maintenance_handle.await;
            save_state(&trainer, &agent_path, &buffer_path);
            flush_action_history(&orchestrator, &action_history_path);
            flush_block_history(&defense, &block_history_path);
            std::process::exit(exit_code);
        }
        _ = ctrl_c => {
            info!("received interrupt, shutting down");
            shutdown_tx.send(true).ok();
            train_shutdown_tx.send(true).ok();
            let _ = trainer_handle.await;
            let _ = maintenance_handle.await;
            save_state(&trainer, &agent_path, &buffer_path);
            flush_action_history(&orchestrator, &action_history_path);
            flush_block_history(&defense, &block_history_path);
            std::process::exit(EXIT_INTERRUPTED);
        }
    }
}

fn queue_from(config: &IpsConfig) -> Arc<PacketQueue> {
    Arc::new(PacketQueue::new(config.monitoring.queue.max_size))
}

/// Merge the orchestrator's in-memory action history into
/// `defense_actions_history.json` on disk, applying the same 1000-entry/
/// 20%-drop cap on the combined set. Best-effort: a failure here is
/// `Recoverable`, logged rather than escalated.
fn flush_action_history(orchestrator: &Arc<Orchestrator>, path: &PathBuf) {
    let mut on_disk = DefenseActionsHistory::load(path).unwrap_or_else(|e| {
        error!(error = %e, path = ?path, "defense action history failed to load, starting fresh");
        DefenseActionsHistory::default()
    });
    for entry in orchestrator.drain_action_history().entries {
        on_disk.record(entry);
    }
    if let Err(e) = on_disk.save(path) {
        error!(error = %e, path = ?path, "failed to persist defense action history");
    }
}

/// Merge the defense executor's in-memory block/unblock event log into
/// `blocked_ips_history.json` on disk. The file is append-style and never
/// capped (spec §6) — unlike the action history, entries are never
/// dropped, since the effective blocked set is derived by netting the
/// full log rather than by inspecting only the most recent N entries.
fn flush_block_history(defense: &Arc<DefenseExecutor>, path: &PathBuf) {
    let mut on_disk = BlockedIpsHistory::load(path).unwrap_or_else(|e| {
        error!(error = %e, path = ?path, "block history failed to load, starting fresh");
        BlockedIpsHistory::default()
    });
    for entry in defense.drain_history() {
        on_disk.record(entry);
    }
    if let Err(e) = on_disk.save(path) {
        error!(error = %e, path = ?path, "failed to persist block history");
    }
}

/// Best-effort checkpoint of the RL agent and replay buffer on shutdown;
/// a failure here is `Recoverable` (logged, not fatal) per spec §7.
fn save_state(trainer: &Arc<OnlineTrainer>, agent_path: &PathBuf, buffer_path: &PathBuf) {
    if let Err(e) = trainer.save(agent_path, buffer_path) {
        error!(error = %e, "failed to persist rl model/buffer on shutdown");
    }
}
