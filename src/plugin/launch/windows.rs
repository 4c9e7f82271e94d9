use std::io;
use tokio::process::{Child, Command};

use super::LaunchCaveat;

// TODO: assign the child to a job object with JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE.
pub(super) fn apply(_cmd: &mut Command) -> Vec<LaunchCaveat> {
    vec![LaunchCaveat::NoJobObject]
}

pub(super) fn terminate(child: &mut Child) -> io::Result<()> {
    match child.start_kill() {
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
        other => other,
    }
}
