use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, error, warn};

/// Kill a child immediately and reap it, waiting at most `timeout` for the
/// exit to be observed.
///
/// Returns `None` if the process could not be reaped in time.
pub async fn kill_and_reap(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    if let Err(e) = child.start_kill() {
        // Already exited; fall through to reap it.
        debug!("start_kill failed: {}", e);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            error!("error waiting for killed process: {}", e);
            None
        }
        Err(_) => {
            warn!("killed process was not reaped within {:?}", timeout);
            None
        }
    }
}

/// Wait for a child that has been asked to finish (stdin closed) to exit on
/// its own, killing it if it takes longer than `grace`.
pub async fn wait_or_kill(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            warn!("process did not exit within {:?}; killing it", grace);
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Human readable exit description for logs and error messages.
pub fn describe_exit(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}
