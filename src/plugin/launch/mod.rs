//! Platform launch policy for plugin processes
//!
//! Every plugin is started so that it cannot outlive the host: its own process group on
//! POSIX (so the whole tree can be killed at once), plus a parent-death signal on Linux.
//! Windows is a placeholder until a job-object equivalent exists.

use std::fmt;
use std::io;
use std::process::Stdio;
use tokio::process::{Child, Command};

use super::descriptor::ValidatedDescriptor;
use super::handshake::{HandshakeConfig, PROTOCOL_VERSIONS_ENV};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(unix)]
mod unix;
#[cfg(not(unix))]
mod windows;

#[cfg(target_os = "linux")]
use linux::apply;
#[cfg(all(unix, not(target_os = "linux")))]
use unix::apply;
#[cfg(unix)]
use unix::terminate as platform_terminate;
#[cfg(not(unix))]
use windows::{apply, terminate as platform_terminate};

/// Supervision guarantee the current platform could not provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchCaveat {
    /// The child is not killed automatically if the host dies first.
    NoParentDeathSignal,
    /// Descendants of the child are not tied to a job object.
    NoJobObject,
}

impl fmt::Display for LaunchCaveat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchCaveat::NoParentDeathSignal => {
                write!(f, "parent death signal unsupported on this platform")
            }
            LaunchCaveat::NoJobObject => {
                write!(f, "job object supervision not implemented on this platform")
            }
        }
    }
}

/// Build the command for a validated plugin.
///
/// stdout carries the handshake, stderr is forwarded to the host log and stdin is
/// closed.
pub fn command(descriptor: &ValidatedDescriptor, handshake: &HandshakeConfig) -> (Command, Vec<LaunchCaveat>) {
    let mut cmd = Command::new(descriptor.path());
    cmd.args(descriptor.launch_command())
        .envs(descriptor.env())
        .env(handshake.magic_cookie_key, handshake.magic_cookie_value)
        .env(PROTOCOL_VERSIONS_ENV, handshake.protocol_version.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let caveats = apply(&mut cmd);
    (cmd, caveats)
}

/// Kill the plugin and everything it spawned. Does not reap the child.
pub fn terminate(child: &mut Child) -> io::Result<()> {
    platform_terminate(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::descriptor::PluginDescriptor;
    use crate::plugin::handshake::HANDSHAKE;
    use std::ffi::OsStr;

    #[cfg(unix)]
    fn shell(script: &str) -> ValidatedDescriptor {
        PluginDescriptor::new("sh", "/bin/sh")
            .with_args(["-c", script])
            .with_env("PLUGIN_EXTRA", "1")
            .validate()
            .unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn test_command_carries_cookie_and_versions() {
        let (cmd, _) = command(&shell("true"), &HANDSHAKE);
        let inner = cmd.as_std();
        let envs: Vec<_> = inner.get_envs().collect();

        assert!(envs.contains(&(
            OsStr::new(HANDSHAKE.magic_cookie_key),
            Some(OsStr::new(HANDSHAKE.magic_cookie_value))
        )));
        assert!(envs.contains(&(OsStr::new(PROTOCOL_VERSIONS_ENV), Some(OsStr::new("1")))));
        assert!(envs.contains(&(OsStr::new("PLUGIN_EXTRA"), Some(OsStr::new("1")))));
        assert_eq!(inner.get_args().collect::<Vec<_>>(), [OsStr::new("-c"), OsStr::new("true")]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_has_no_caveats() {
        let (_, caveats) = command(&shell("true"), &HANDSHAKE);
        assert!(caveats.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_process_group() {
        use std::os::unix::process::ExitStatusExt;

        let (mut cmd, _) = command(&shell("sleep 30 & wait"), &HANDSHAKE);
        let mut child = cmd.spawn().unwrap();

        terminate(&mut child).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(9));

        // Already reaped: a second terminate is a no-op.
        terminate(&mut child).unwrap();
    }
}
