//! Child process transport: stdio pipes plus exit supervision.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::transport::{Transport, TransportEvent};

/// Spawns `command` with piped stdio and returns a transport bound to it.
///
/// The child's stdout carries inbound messages and its stdin receives
/// outbound ones. Stderr lines are forwarded to `tracing` under the
/// `label` name. Process exit is reported as [`TransportEvent::Exited`];
/// cancelling the transport's shutdown token kills the child.
pub fn spawn_child(label: &str, mut command: Command) -> Result<Transport, RpcError> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|error| RpcError::transport(format!("failed to spawn '{label}': {error}")))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| RpcError::transport(format!("missing stdin pipe for '{label}'")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RpcError::transport(format!("missing stdout pipe for '{label}'")))?;
    if let Some(stderr) = child.stderr.take() {
        spawn_stderr_logger(label.to_string(), stderr);
    }

    let mut transport = Transport::spawn(stdout, stdin);
    let events = transport.event_sender();
    let shutdown = transport.shutdown_token();
    let name = label.to_string();
    let pid = child.id();

    let supervisor = tokio::spawn(async move {
        let code = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => status.code(),
                Err(error) => {
                    warn!(step = %name, error = %error, "Failed to wait on child process");
                    None
                }
            },
            _ = shutdown.cancelled() => {
                if let Err(error) = child.kill().await {
                    warn!(step = %name, error = %error, "Failed to kill child process");
                }
                None
            }
        };
        debug!(step = %name, ?code, "Child process exited");
        let _ = events.send(TransportEvent::Exited(code));
    });
    transport.attach_task(supervisor);

    info!(step = %label, ?pid, "Spawned child runtime");
    Ok(transport)
}

/// Forwards stderr lines of a child to the host log.
fn spawn_stderr_logger(label: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "polystep::child", step = %label, "{line}");
        }
    });
}
