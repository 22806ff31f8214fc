//! Startup check for the runtime the workers need (e.g. the Python
//! interpreter).

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::config::PrerequisiteConfig;
use crate::error::{Result, ServiceError};

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the configured version command and verify its output.
///
/// Returns the reported version line. Some interpreters print their version
/// to stderr, so stderr is used when stdout is empty.
pub async fn check_prerequisite(config: &PrerequisiteConfig) -> Result<String> {
    let not_found = || ServiceError::Configuration(format!("{} not found", config.expected_prefix));

    let Some((program, args)) = config.command.split_first() else {
        return Err(ServiceError::Configuration(
            "prerequisite.command must not be empty".to_string(),
        ));
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(CHECK_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!(program = %program, "Prerequisite command failed to start: {e}");
            return Err(not_found());
        }
        Err(_) => {
            debug!(program = %program, "Prerequisite command timed out");
            return Err(not_found());
        }
    };

    if !output.status.success() {
        debug!(program = %program, status = %output.status, "Prerequisite command failed");
        return Err(not_found());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let reported = if stdout.trim().is_empty() {
        stderr.trim()
    } else {
        stdout.trim()
    };
    let version = reported.lines().next().unwrap_or_default().trim().to_string();

    if version.starts_with(&config.expected_prefix) {
        info!("Found {version}");
        Ok(version)
    } else {
        debug!(reported = %version, expected = %config.expected_prefix, "Prerequisite mismatch");
        Err(not_found())
    }
}
