use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::unistd::{getpid, getppid};
use std::io;
use tokio::process::Command;

use super::{unix, LaunchCaveat};

const PDEATHSIG_FAILED: &[u8] = b"plugin-host: failed to set parent death signal\n";

pub(super) fn apply(cmd: &mut Command) -> Vec<LaunchCaveat> {
    unix::isolate(cmd);

    let parent = getpid();
    // SAFETY: the closure runs between fork and exec and only makes async-signal-safe
    // system calls (prctl, getppid, write).
    unsafe {
        cmd.pre_exec(move || {
            if prctl::set_pdeathsig(Signal::SIGKILL).is_err() {
                let _ = nix::unistd::write(io::stderr(), PDEATHSIG_FAILED);
                return Ok(());
            }
            // The host may have died before the signal was armed.
            if getppid() != parent {
                return Err(io::Error::other("plugin host exited during launch"));
            }
            Ok(())
        });
    }

    Vec::new()
}
