use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use tokio::process::{Child, Command};
use tracing::warn;

#[cfg(not(target_os = "linux"))]
use super::LaunchCaveat;

/// Put the child in a new process group led by itself.
pub(super) fn isolate(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(target_os = "linux"))]
pub(super) fn apply(cmd: &mut Command) -> Vec<LaunchCaveat> {
    isolate(cmd);
    vec![LaunchCaveat::NoParentDeathSignal]
}

/// SIGKILL the child's process group, falling back to the child alone.
pub(super) fn terminate(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => {
            warn!(pid, error = %errno, "failed to kill plugin process group, killing process only");
            child.start_kill()
        }
    }
}
