//! Worker process supervision.
//!
//! Spawns one delegate process bound to a slot port, forwards its console
//! output into `tracing`, and terminates it on request.

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{Level, debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::{Result, ServiceError};

/// Everything needed to launch a worker, minus the port.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    /// Arguments placed before `--port` (usually the script path).
    pub args: Vec<String>,
    pub directory: PathBuf,
    pub verbose: bool,
}

impl LaunchSpec {
    pub fn from_config(config: &WorkerConfig) -> Self {
        let mut args = Vec::new();
        if let Some(script) = config.script.as_deref().filter(|s| !s.trim().is_empty()) {
            args.push(script.to_string());
        }
        args.extend(config.extra_args.iter().cloned());
        Self {
            program: config.program.clone(),
            args,
            directory: PathBuf::from(&config.directory),
            verbose: config.verbose,
        }
    }

    /// Full argument list for a worker listening on `port`.
    #[must_use]
    pub fn arguments(&self, port: u16, verbose: bool) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(format!("--port={port}"));
        if verbose {
            args.push("--verbose".to_string());
        }
        args
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ExitOutcome {
    /// Exit code 0.
    Clean,
    /// Non-zero exit code.
    Failed(i32),
    /// Killed by a signal (Unix only).
    Signaled(i32),
    Unknown,
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return if code == 0 {
                Self::Clean
            } else {
                Self::Failed(code)
            };
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled(signal);
            }
        }
        Self::Unknown
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => write!(f, "exited cleanly"),
            Self::Failed(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Self::Unknown => write!(f, "exited for an unknown reason"),
        }
    }
}

/// Handle to one running worker process.
///
/// The child is killed if the handle is dropped without being stopped.
pub struct WorkerProcess {
    child: Child,
    pid: Option<u32>,
    port: u16,
    exited: Option<ExitOutcome>,
}

impl WorkerProcess {
    /// Spawn a worker listening on `port`.
    pub fn spawn(spec: &LaunchSpec, port: u16) -> Result<Self> {
        let start = Instant::now();
        let forward_stdout = tracing::enabled!(Level::DEBUG);
        let verbose = spec.verbose || forward_stdout;

        let mut cmd = Command::new(&spec.program);
        cmd.args(spec.arguments(port, verbose))
            .current_dir(&spec.directory)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if forward_stdout {
            cmd.stdout(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null());
        }

        let mut child = cmd.spawn().map_err(|e| {
            ServiceError::Configuration(format!(
                "Error creating worker process '{}' in {} on port {port}: {e}",
                spec.program,
                spec.directory.display()
            ))
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, port, Level::WARN));
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, port, Level::DEBUG));
        }

        let pid = child.id();
        debug!(
            pid = ?pid,
            port,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Worker process created"
        );

        Ok(Self {
            child,
            pid,
            port,
            exited: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Non-blocking exit check. Returns the outcome once the process is gone.
    pub fn try_exit(&mut self) -> Option<ExitOutcome> {
        if self.exited.is_some() {
            return self.exited;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let outcome = ExitOutcome::from_status(status);
                self.exited = Some(outcome);
                Some(outcome)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(port = self.port, "Failed to query worker process status: {e}");
                None
            }
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.try_exit().is_none()
    }

    /// Wait up to `grace` for the process to exit on its own.
    pub async fn wait_for_exit(&mut self, grace: Duration) -> Option<ExitOutcome> {
        if self.exited.is_some() {
            return self.exited;
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                let outcome = ExitOutcome::from_status(status);
                self.exited = Some(outcome);
                Some(outcome)
            }
            Ok(Err(e)) => {
                warn!(port = self.port, "Failed to wait for worker process: {e}");
                None
            }
            Err(_) => None,
        }
    }

    /// Force-kill the process and reap it.
    pub async fn kill(&mut self) -> ExitOutcome {
        if let Some(outcome) = self.exited {
            return outcome;
        }
        if let Err(e) = self.child.start_kill() {
            warn!(pid = ?self.pid, port = self.port, "Failed to kill worker process: {e}");
        }
        let outcome = match self.child.wait().await {
            Ok(status) => ExitOutcome::from_status(status),
            Err(e) => {
                warn!(pid = ?self.pid, port = self.port, "Failed to reap worker process: {e}");
                ExitOutcome::Unknown
            }
        };
        self.exited = Some(outcome);
        outcome
    }
}

/// Log how a worker ended: clean exits at INFO, everything else at WARN.
pub fn log_exit(pid: Option<u32>, port: u16, outcome: ExitOutcome) {
    if outcome.is_clean() {
        info!(pid = ?pid, port, "Worker process stopped");
    } else {
        warn!(pid = ?pid, port, outcome = %outcome, "Worker process stopped abnormally");
    }
}

async fn forward_lines<R>(stream: R, port: u16, level: Level)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if level == Level::WARN {
                    warn!(target: "worker", port, "{line}");
                } else {
                    debug!(target: "worker", port, "{line}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(target: "worker", port, "Stopped reading worker output: {e}");
                break;
            }
        }
    }
}
