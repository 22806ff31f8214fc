//! One pool slot: a worker process, its wire client and its accounting.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::process::{ExitOutcome, LaunchSpec, WorkerProcess, log_exit};
use super::wire::{WireClient, WireError};
use crate::config::Config;
use crate::error::{Result, ServiceError};

/// Lifecycle of an executor.
///
/// `Starting -> Ready -> Exchanging -> (Ready | Restarting) -> Terminated`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorState {
    Starting,
    Ready,
    Exchanging,
    Restarting,
    Terminated,
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Exchanging => "exchanging",
            Self::Restarting => "restarting",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Settings shared by every executor of a pool.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub launch: LaunchSpec,
    pub max_records_before_restart: usize,
    pub exchange_timeout: Duration,
    pub connect_timeout: Duration,
    pub connect_retry: Duration,
    pub terminate_grace: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            launch: LaunchSpec::from_config(&config.worker),
            max_records_before_restart: config.pool.max_records_before_restart,
            exchange_timeout: config.timeouts.exchange(),
            connect_timeout: config.timeouts.connect(),
            connect_retry: config.timeouts.connect_retry(),
            terminate_grace: config.timeouts.terminate_grace(),
        }
    }
}

/// Point-in-time view of one slot, for stats and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub index: usize,
    pub port: u16,
    pub pid: Option<u32>,
    pub state: ExecutorState,
    pub processed_since_restart: usize,
    pub total_processed: u64,
    pub exchanges: u64,
    pub failures: u64,
    pub restarts: u64,
    /// How the previous worker process of this slot ended.
    pub last_exit: Option<ExitOutcome>,
}

/// A long-lived worker bound to one port.
///
/// An executor serves at most one exchange at a time; the pool guarantees
/// exclusive access through its lease.
pub struct Executor {
    index: usize,
    port: u16,
    settings: Arc<ExecutorSettings>,
    wire: WireClient,
    process: Option<WorkerProcess>,
    state: ExecutorState,
    processed_since_restart: usize,
    total_processed: u64,
    exchanges: u64,
    failures: u64,
    restarts: u64,
    last_exit: Option<ExitOutcome>,
}

impl Executor {
    /// Spawn the worker for slot `index` on `port`.
    ///
    /// A spawn failure is a configuration error: the slot never becomes
    /// usable.
    pub fn start(index: usize, port: u16, settings: Arc<ExecutorSettings>) -> Result<Self> {
        let wire = WireClient::new(port, settings.connect_timeout, settings.connect_retry);
        let mut executor = Self {
            index,
            port,
            settings,
            wire,
            process: None,
            state: ExecutorState::Starting,
            processed_since_restart: 0,
            total_processed: 0,
            exchanges: 0,
            failures: 0,
            restarts: 0,
            last_exit: None,
        };
        executor.process = Some(WorkerProcess::spawn(&executor.settings.launch, port)?);
        executor.state = ExecutorState::Ready;
        info!(slot = index, port, pid = ?executor.pid(), "Executor ready");
        Ok(executor)
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn state(&self) -> ExecutorState {
        self.state
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(WorkerProcess::pid)
    }

    #[must_use]
    pub fn processed_since_restart(&self) -> usize {
        self.processed_since_restart
    }

    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            index: self.index,
            port: self.port,
            pid: self.pid(),
            state: self.state,
            processed_since_restart: self.processed_since_restart,
            total_processed: self.total_processed,
            exchanges: self.exchanges,
            failures: self.failures,
            restarts: self.restarts,
            last_exit: self.last_exit,
        }
    }

    /// Send one request line and return the worker's raw answer line.
    ///
    /// On success `record_count` is added to the restart counter; once it
    /// reaches the threshold the worker is restarted before this returns.
    pub async fn exchange(
        &mut self,
        payload: &str,
        record_count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.ensure_process()?;

        self.state = ExecutorState::Exchanging;
        self.exchanges += 1;
        let deadline = Instant::now() + self.settings.exchange_timeout;

        let process = &mut self.process;
        let result = self
            .wire
            .exchange(payload, deadline, cancel, || {
                process.as_mut().is_some_and(WorkerProcess::is_running)
            })
            .await;

        match result {
            Ok(answer) => {
                self.state = ExecutorState::Ready;
                self.processed_since_restart += record_count;
                self.total_processed += record_count as u64;
                if self.processed_since_restart >= self.settings.max_records_before_restart {
                    info!(
                        slot = self.index,
                        port = self.port,
                        processed = self.processed_since_restart,
                        "Restart threshold reached"
                    );
                    if let Err(e) = self.restart().await {
                        error!(slot = self.index, port = self.port, "Worker restart failed: {e}");
                    }
                }
                Ok(answer)
            }
            Err(err) => {
                self.failures += 1;
                self.state = ExecutorState::Ready;
                self.recover_after_failure(&err).await;
                Err(err.into())
            }
        }
    }

    /// Put the slot back into a usable shape after a failed exchange.
    async fn recover_after_failure(&mut self, err: &WireError) {
        let dead = self
            .process
            .as_mut()
            .is_none_or(|process| !process.is_running());
        if dead {
            self.discard_process();
            warn!(slot = self.index, port = self.port, "Worker died, respawning on next request");
            return;
        }

        // A stalled worker would keep the next request waiting behind it
        if matches!(err, WireError::TimedOut { .. }) {
            warn!(slot = self.index, port = self.port, "Worker stalled, restarting");
            if let Err(e) = self.restart().await {
                error!(slot = self.index, port = self.port, "Worker restart failed: {e}");
            }
        }
    }

    /// Make sure a live process is attached, respawning a dead one.
    fn ensure_process(&mut self) -> Result<()> {
        if self.state == ExecutorState::Terminated {
            return Err(ServiceError::delegate(
                format!("Executor on port {} has been terminated", self.port),
                false,
            ));
        }

        let alive = self
            .process
            .as_mut()
            .is_some_and(WorkerProcess::is_running);
        if alive {
            return Ok(());
        }

        self.discard_process();
        self.state = ExecutorState::Starting;
        let process = self.respawn()?;
        info!(slot = self.index, port = self.port, pid = ?process.pid(), "Worker respawned");
        self.process = Some(process);
        self.processed_since_restart = 0;
        self.restarts += 1;
        self.state = ExecutorState::Ready;
        Ok(())
    }

    /// Stop the current worker and spawn a fresh one on the same port.
    pub async fn restart(&mut self) -> Result<()> {
        let start = std::time::Instant::now();
        self.state = ExecutorState::Restarting;
        self.stop_process().await;

        let process = self.respawn()?;
        self.process = Some(process);
        self.processed_since_restart = 0;
        self.restarts += 1;
        self.state = ExecutorState::Ready;
        info!(
            slot = self.index,
            port = self.port,
            pid = ?self.pid(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Worker restarted"
        );
        Ok(())
    }

    /// Spawn a replacement worker while serving requests.
    ///
    /// Unlike the initial spawn, a failure here is a runtime delegate failure;
    /// the slot stays usable and the next exchange tries again.
    fn respawn(&mut self) -> Result<WorkerProcess> {
        WorkerProcess::spawn(&self.settings.launch, self.port).map_err(|err| {
            self.state = ExecutorState::Ready;
            let message = match err {
                ServiceError::Configuration(message) => message,
                other => other.to_string(),
            };
            ServiceError::delegate(message, true)
        })
    }

    /// Detach a process that already exited, recording how it ended.
    fn discard_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Some(outcome) = process.try_exit() {
                self.record_exit(process.pid(), outcome);
            }
        }
    }

    fn record_exit(&mut self, pid: Option<u32>, outcome: ExitOutcome) {
        log_exit(pid, self.port, outcome);
        self.last_exit = Some(outcome);
    }

    /// Stop the worker for good.
    pub async fn terminate(&mut self) {
        if self.state == ExecutorState::Terminated {
            return;
        }
        self.stop_process().await;
        self.state = ExecutorState::Terminated;
        debug!(slot = self.index, port = self.port, "Executor terminated");
    }

    /// Ask the worker to exit, falling back to a kill.
    async fn stop_process(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        let pid = process.pid();
        let grace = self.settings.terminate_grace;

        if let Some(outcome) = process.try_exit() {
            self.record_exit(pid, outcome);
            return;
        }

        let outcome = match self.wire.send_terminate(grace).await {
            Ok(()) => match process.wait_for_exit(grace).await {
                Some(outcome) => outcome,
                None => {
                    warn!(pid = ?pid, port = self.port, "Worker ignored TERMINATE, killing");
                    process.kill().await
                }
            },
            Err(e) => {
                warn!(pid = ?pid, port = self.port, "Could not deliver TERMINATE ({e}), killing");
                process.kill().await
            }
        };
        self.record_exit(pid, outcome);
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("index", &self.index)
            .field("port", &self.port)
            .field("pid", &self.pid())
            .field("state", &self.state)
            .field("processed_since_restart", &self.processed_since_restart)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn settings(script: &str, threshold: usize) -> Arc<ExecutorSettings> {
        Arc::new(ExecutorSettings {
            launch: LaunchSpec {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                directory: std::env::temp_dir(),
                verbose: false,
            },
            max_records_before_restart: threshold,
            exchange_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_millis(300),
            connect_retry: Duration::from_millis(20),
            terminate_grace: Duration::from_millis(200),
        })
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ExecutorState::Ready.to_string(), "ready");
        assert_eq!(ExecutorState::Terminated.to_string(), "terminated");
    }

    #[tokio::test]
    async fn test_start_and_terminate() {
        let mut executor = Executor::start(0, 40101, settings("sleep 60", 10)).unwrap();
        assert_eq!(executor.state(), ExecutorState::Ready);
        assert!(executor.pid().is_some());

        // Nothing listens on the port, so TERMINATE fails and the process is killed
        executor.terminate().await;
        assert_eq!(executor.state(), ExecutorState::Terminated);
        assert!(executor.pid().is_none());
        assert_eq!(executor.snapshot().last_exit, Some(ExitOutcome::Signaled(9)));
    }

    #[tokio::test]
    async fn test_exchange_after_terminate_is_rejected() {
        let mut executor = Executor::start(0, 40102, settings("sleep 60", 10)).unwrap();
        executor.terminate().await;
        let err = executor
            .exchange("{}", 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DelegateCommunication { .. }));
    }

    #[tokio::test]
    async fn test_dead_worker_is_respawned_before_exchange() {
        let mut executor = Executor::start(0, 40103, settings("exit 1", 10)).unwrap();
        let first_pid = executor.pid();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The respawned worker exits again, so the exchange fails fast
        let err = executor
            .exchange("{}", 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DelegateCommunication { .. }));
        assert_eq!(executor.restarts(), 1);
        assert_ne!(executor.snapshot().pid, first_pid);
        assert_eq!(executor.snapshot().failures, 1);
        assert_eq!(executor.state(), ExecutorState::Ready);
    }

    #[tokio::test]
    async fn test_failed_respawn_is_delegate_failure() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("worker.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let settings = Arc::new(ExecutorSettings {
            launch: LaunchSpec {
                program: script.display().to_string(),
                args: Vec::new(),
                directory: dir.path().to_path_buf(),
                verbose: false,
            },
            ..(*settings("exit 1", 10)).clone()
        });
        let mut executor = Executor::start(0, 40105, settings).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::remove_file(&script).unwrap();

        let err = executor
            .exchange("{}", 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(
            matches!(err, ServiceError::DelegateCommunication { log_detail: true, .. }),
            "got {err:?}"
        );
        assert_eq!(err.status_code(), 500);
        assert_eq!(executor.state(), ExecutorState::Ready);
        assert!(executor.pid().is_none());
        assert_eq!(executor.snapshot().last_exit, Some(ExitOutcome::Failed(1)));
    }

    #[tokio::test]
    async fn test_snapshot() {
        let mut executor = Executor::start(3, 40104, settings("sleep 60", 10)).unwrap();
        let snapshot = executor.snapshot();
        assert_eq!(snapshot.index, 3);
        assert_eq!(snapshot.port, 40104);
        assert_eq!(snapshot.processed_since_restart, 0);
        assert_eq!(snapshot.exchanges, 0);
        assert_eq!(snapshot.last_exit, None);
        executor.terminate().await;
    }
}
