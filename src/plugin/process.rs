//! Plugin process spawning and supervision
//!
//! The child is owned by a supervisor task. If the plugin exits on its own the
//! supervisor logs it; [`ProcessHandle::kill`] asks the supervisor to kill the process
//! group and waits until the child has been reaped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::descriptor::ValidatedDescriptor;
use super::handshake::HandshakeConfig;
use super::launch;
use crate::error::{PluginError, Result};

struct Supervisor {
    kill_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Handle to a running plugin process.
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    supervisor: Mutex<Option<Supervisor>>,
    exited: Arc<AtomicBool>,
}

impl ProcessHandle {
    /// Spawn the plugin. Returns the handle and the child's stdout, which carries the
    /// handshake line. stderr is forwarded to the log.
    pub fn spawn(descriptor: &ValidatedDescriptor, handshake: &HandshakeConfig) -> Result<(Self, BufReader<ChildStdout>)> {
        let name = descriptor.logical_name().to_string();
        let (mut cmd, caveats) = launch::command(descriptor, handshake);
        for caveat in caveats {
            warn!(plugin = %name, %caveat, "plugin launched with reduced supervision");
        }

        let mut child = cmd.spawn().map_err(|e| {
            PluginError::Launch(format!("{}: {}", descriptor.path().display(), e))
        })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Launch("plugin stdout was not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(name.clone(), "stderr", BufReader::new(stderr)));
        }

        debug!(plugin = %name, pid, "spawned plugin process");

        let exited = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(child, kill_rx, name.clone(), exited.clone()));

        let handle = Self {
            name,
            pid,
            supervisor: Mutex::new(Some(Supervisor { kill_tx, task })),
            exited,
        };
        Ok((handle, BufReader::new(stdout)))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Kill the process group and wait for the child to be reaped. Idempotent;
    /// concurrent callers wait for the first kill to finish.
    pub async fn kill(&self) {
        let mut supervisor = self.supervisor.lock().await;
        let Some(Supervisor { kill_tx, task }) = supervisor.take() else {
            return;
        };

        let _ = kill_tx.send(());
        if let Err(e) = task.await {
            warn!(plugin = %self.name, error = %e, "plugin supervisor task failed");
        }
    }
}

async fn supervise(mut child: Child, kill_rx: oneshot::Receiver<()>, name: String, exited: Arc<AtomicBool>) {
    let pid = child.id();

    tokio::select! {
        status = child.wait() => {
            exited.store(true, Ordering::SeqCst);
            match status {
                Ok(status) => error!(plugin = %name, pid, %status, "plugin process exited"),
                Err(e) => error!(plugin = %name, pid, error = %e, "failed to wait for plugin process"),
            }
        }
        // A dropped handle counts as a kill request.
        _ = kill_rx => {
            if let Err(e) = launch::terminate(&mut child) {
                warn!(plugin = %name, pid, error = %e, "failed to kill plugin process");
            }
            match child.wait().await {
                Ok(status) => info!(plugin = %name, pid, %status, "plugin process stopped"),
                Err(e) => warn!(plugin = %name, pid, error = %e, "failed to reap plugin process"),
            }
            exited.store(true, Ordering::SeqCst);
        }
    }
}

/// Forward each line of plugin output to the log until EOF.
pub(crate) async fn forward_lines<R>(name: String, stream: &'static str, reader: R)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => info!(plugin = %name, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(plugin = %name, stream, error = %e, "stopped reading plugin output");
                break;
            }
        }
    }
}
