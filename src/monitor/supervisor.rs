//! Per-server process supervision.
//!
//! Every server record owns one [`Supervisor`]. The handle is cheap to clone
//! and only talks to a dedicated task through channels; the task owns the
//! child process for the record's whole lifetime.
//!
//! ```text
//!            recover                 spawn ok
//! Awaiting ───────────> Starting ─────────────> Up
//!    ^                     │  ^                  │
//!    │  start failed /     │  │ crash, backoff   │ kill / clean exit
//!    │  restart storm      │  │ allows restart   │
//!    └─────────────────────┘  └──────────────────┤
//!    ^                                           │
//!    └───────────────────────────────────────────┘
//!
//!  Up ── permanent kill ──> TerminatedPermanently
//! ```

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::bridge::{self, InputEvent, LOG_QUEUE_CAPACITY, LogSink, Pipe};
use super::installer::Installer;
use super::models::LogRecord;
use super::registry::ServerRecord;
use crate::config::Settings;
use crate::errors::SupervisorError;

/// Number of automatic restarts tracked for backoff.
pub const RESTART_HISTORY: usize = 3;

/// Automatic restarts stop when `RESTART_HISTORY` of them happened within this window.
pub const RESTART_WINDOW: Duration = Duration::from_secs(60);

const INPUT_QUEUE_CAPACITY: usize = 16;

const DOWN_MESSAGE: &str = "Server is DOWN, awaiting :recover command.";

/// Lifecycle state of a supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Down; only an explicit recover starts it again.
    AwaitingManualRecovery,
    /// A start sequence is in progress (binary check, spawn).
    Starting,
    Up,
    /// The supervision task has exited. Nothing can start the server again.
    TerminatedPermanently,
}

/// How a running server should be stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    /// Stop the server and end supervision for good.
    Permanent,
    /// Stop the server and wait for a recover.
    Restartable,
}

/// Timestamps of the last few successful spawns, oldest first.
#[derive(Debug, Default, Clone)]
pub struct RestartHistory {
    slots: [Option<Instant>; RESTART_HISTORY],
}

impl RestartHistory {
    pub fn record(&mut self, at: Instant) {
        self.slots.rotate_left(1);
        self.slots[RESTART_HISTORY - 1] = Some(at);
    }

    /// Elapsed time since the oldest tracked spawn, if it falls inside the
    /// restart window.
    pub fn storm(&self, now: Instant) -> Option<Duration> {
        let oldest = self.slots[0]?;
        let elapsed = now.saturating_duration_since(oldest);
        (elapsed < RESTART_WINDOW).then_some(elapsed)
    }
}

/// Handle to one server's supervision task.
#[derive(Clone)]
pub struct Supervisor {
    restart_tx: mpsc::Sender<()>,
    kill_tx: mpsc::Sender<KillMode>,
    input_tx: mpsc::Sender<InputEvent<ChildStdin>>,
    state: watch::Receiver<SupervisorState>,
}

impl Supervisor {
    /// Spawn the supervision task and its relays for `record`. The server
    /// starts in `AwaitingManualRecovery`.
    pub fn spawn(
        record: Arc<ServerRecord>,
        installer: Arc<Installer>,
        settings: Arc<Settings>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let id = record.id();
        let (restart_tx, restart_rx) = mpsc::channel(1);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel::<Pipe<ChildStdout>>(1);
        let (log_tx, log_rx) = mpsc::channel(LOG_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SupervisorState::AwaitingManualRecovery);

        tokio::spawn(bridge::run_input_relay(id, input_rx, log_tx.clone()));
        tokio::spawn(bridge::run_output_relay(id, output_rx, log_tx.clone()));
        tokio::spawn(bridge::run_forwarder(log_rx, sink));

        let task = SupervisorTask {
            id,
            record,
            installer,
            settings,
            restart_rx,
            kill_rx,
            input_tx: input_tx.clone(),
            output_tx,
            log_tx,
            state: state_tx,
        };
        tokio::spawn(task.run());

        Self {
            restart_tx,
            kill_tx,
            input_tx,
            state: state_rx,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    pub fn is_up(&self) -> bool {
        self.state() == SupervisorState::Up
    }

    pub fn is_alive(&self) -> bool {
        self.state() != SupervisorState::TerminatedPermanently
    }

    /// Request a start. False unless the server is waiting for a recover.
    pub fn start(&self) -> bool {
        self.state() == SupervisorState::AwaitingManualRecovery && self.restart_tx.try_send(()).is_ok()
    }

    /// Request a kill. False unless the server is up.
    pub fn kill(&self, mode: KillMode) -> bool {
        self.is_up() && self.kill_tx.try_send(mode).is_ok()
    }

    /// Queue a line for the server's stdin. False unless the server is up.
    /// A true result does not guarantee delivery.
    pub async fn send_command(&self, command: &str) -> bool {
        self.is_up()
            && self
                .input_tx
                .send(InputEvent::Command(command.to_string()))
                .await
                .is_ok()
    }
}

enum Watched {
    Kill(KillMode),
    Exited(std::io::Result<ExitStatus>),
}

enum Stopped {
    Permanently,
    AwaitingRecovery,
    Crashed,
}

struct SupervisorTask {
    id: i64,
    record: Arc<ServerRecord>,
    installer: Arc<Installer>,
    settings: Arc<Settings>,
    restart_rx: mpsc::Receiver<()>,
    kill_rx: mpsc::Receiver<KillMode>,
    input_tx: mpsc::Sender<InputEvent<ChildStdin>>,
    output_tx: mpsc::Sender<Pipe<ChildStdout>>,
    log_tx: mpsc::Sender<LogRecord>,
    state: watch::Sender<SupervisorState>,
}

impl SupervisorTask {
    async fn log(&self, message: impl Into<String>) {
        let _ = self.log_tx.send(LogRecord::monitor(self.id, message)).await;
    }

    async fn log_error(&self, message: impl Into<String>) {
        let _ = self.log_tx.send(LogRecord::error(self.id, message)).await;
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }

    async fn run(mut self) {
        let mut history = RestartHistory::default();
        let mut automatic = false;

        loop {
            if automatic {
                if let Some(elapsed) = history.storm(Instant::now()) {
                    warn!(server_id = self.id, ?elapsed, "Restart storm, giving up");
                    self.log(format!(
                        "{} automatic server restarts in {:.1?}.",
                        RESTART_HISTORY, elapsed
                    ))
                    .await;
                    self.log(DOWN_MESSAGE).await;
                    automatic = false;
                    continue;
                }
            } else {
                self.set_state(SupervisorState::AwaitingManualRecovery);
                if self.restart_rx.recv().await.is_none() {
                    break;
                }
            }

            self.set_state(SupervisorState::Starting);
            self.log("(re)starting server...").await;

            let mut child = match self.start_child().await {
                Ok(child) => child,
                Err(e) => {
                    warn!(server_id = self.id, error = %e, "Server start failed");
                    let version = self.record.version().unwrap_or_default();
                    self.log_error(format!("Could not restart server ({}): {}", version, e))
                        .await;
                    self.log(DOWN_MESSAGE).await;
                    automatic = false;
                    continue;
                }
            };
            history.record(Instant::now());

            match self.supervise(&mut child).await {
                Stopped::Permanently => {
                    self.log("Server is DOWN, and controller is exiting.").await;
                    break;
                }
                Stopped::AwaitingRecovery => {
                    self.log(DOWN_MESSAGE).await;
                    automatic = false;
                }
                Stopped::Crashed => automatic = true,
            }
        }

        self.set_state(SupervisorState::TerminatedPermanently);
        info!(server_id = self.id, "Supervisor stopped");
    }

    /// Install the binary if needed, prepare the data directory and spawn
    /// the child with its pipes announced to the relays.
    async fn start_child(&mut self) -> Result<Child, SupervisorError> {
        let config = self.record.snapshot()?;
        self.installer.ensure_binary(&config.version).await?;

        let data_dir = self.settings.server_data_dir(&config.name, config.id);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|source| SupervisorError::DataDir {
                path: data_dir.clone(),
                source,
            })?;

        let binary = self.settings.server_binary(&config.version);
        let (program, args) = self.settings.launch_command(&binary, &data_dir);
        debug!(server_id = self.id, %program, ?args, "Spawning server");

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(SupervisorError::SpawnFailed)?;
        let stdin = child
            .stdin
            .take()
            .ok_or(SupervisorError::PipeUnavailable("input"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::PipeUnavailable("output"))?;

        let _ = self.input_tx.send(InputEvent::Pipe(Pipe::Active(stdin))).await;
        let _ = self.output_tx.send(Pipe::Active(stdout)).await;

        // Requests aimed at a previous child must not hit this one.
        while self.kill_rx.try_recv().is_ok() {}
        while self.restart_rx.try_recv().is_ok() {}

        info!(server_id = self.id, version = %config.version, pid = ?child.id(), "Server up");
        self.set_state(SupervisorState::Up);
        Ok(child)
    }

    /// Wait until the child exits or a kill arrives.
    async fn supervise(&mut self, child: &mut Child) -> Stopped {
        let watched = tokio::select! {
            mode = self.kill_rx.recv() => Watched::Kill(mode.unwrap_or(KillMode::Permanent)),
            status = child.wait() => Watched::Exited(status),
        };
        // Stop accepting commands before anything else happens.
        self.set_state(SupervisorState::Starting);

        let stopped = match watched {
            Watched::Kill(mode) => {
                match self.stop_child(child).await {
                    Ok(()) => self.log("Server killed.").await,
                    Err(e) => {
                        warn!(server_id = self.id, error = %e, "Failed to kill server");
                        self.log_error(format!("Failed to kill server: {}", e)).await;
                        self.log_error("Server is ROGUE, run for your lives!").await;
                    }
                }
                match mode {
                    KillMode::Permanent => Stopped::Permanently,
                    KillMode::Restartable => Stopped::AwaitingRecovery,
                }
            }
            Watched::Exited(Ok(status)) if status.success() => {
                self.log("Server exited intentionally.").await;
                Stopped::AwaitingRecovery
            }
            Watched::Exited(Ok(status)) => {
                self.log_error(format!("Server died: {}", status)).await;
                Stopped::Crashed
            }
            Watched::Exited(Err(e)) => {
                self.log_error(format!("Server died: {}", e)).await;
                Stopped::Crashed
            }
        };

        let _ = self.input_tx.send(InputEvent::Pipe(Pipe::Idle)).await;
        let _ = self.output_tx.send(Pipe::Idle).await;
        stopped
    }

    /// Ask the server to stop with the configured stop line, then kill it if
    /// it is still running after the grace period. The stop line is only
    /// queued when there is room; a full input queue goes straight to kill.
    async fn stop_child(&self, child: &mut Child) -> std::io::Result<()> {
        if let Some(stop) = self.settings.stop_command() {
            match self.input_tx.try_send(InputEvent::Command(stop.to_string())) {
                Ok(()) => {
                    if let Ok(result) =
                        tokio::time::timeout(self.settings.stop_timeout(), child.wait()).await
                    {
                        return result.map(|_| ());
                    }
                }
                Err(e) => {
                    debug!(server_id = self.id, error = %e, "Stop line not queued, killing server");
                }
            }
        }
        child.kill().await
    }
}
