//! Host <-> plugin handshake
//!
//! The host puts the magic cookie and the supported protocol version into the plugin's
//! environment. The plugin answers with a single line on stdout:
//!
//! ```text
//! CORE_VERSION|APP_VERSION|NETWORK|ADDRESS|PROTOCOL
//! ```
//!
//! Nothing else is exchanged before the host connects to `ADDRESS`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

use crate::error::{PluginError, Result};

/// Version of the line format itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Wire protocol spoken after the handshake.
pub const PROTOCOL_NAME: &str = "frame";

/// Environment variable carrying the protocol versions the host accepts.
pub const PROTOCOL_VERSIONS_ENV: &str = "PLUGIN_PROTOCOL_VERSIONS";

/// Shared by the host and every plugin built against this crate.
pub const HANDSHAKE: HandshakeConfig = HandshakeConfig {
    protocol_version: 1,
    magic_cookie_key: "PLUGIN_HOST_MAGIC_COOKIE",
    magic_cookie_value: "b7c2a9e4-5d1f-4e8a-9c3b-6f0d2e1a8b47",
};

/// Trust and version parameters of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeConfig {
    pub protocol_version: u32,
    pub magic_cookie_key: &'static str,
    pub magic_cookie_value: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Unix => write!(f, "unix"),
        }
    }
}

impl FromStr for Network {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "unix" => Ok(Network::Unix),
            other => Err(PluginError::HandshakeFailed(format!(
                "unsupported network type '{other}'"
            ))),
        }
    }
}

/// Parsed handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    pub core_version: u32,
    pub app_version: u32,
    pub network: Network,
    pub address: String,
    pub protocol: String,
}

impl HandshakeLine {
    pub fn new(config: &HandshakeConfig, network: Network, address: impl Into<String>) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version: config.protocol_version,
            network,
            address: address.into(),
            protocol: PROTOCOL_NAME.to_string(),
        }
    }

    /// Check the announced versions and protocol against what the host speaks.
    pub fn validate(&self, config: &HandshakeConfig) -> Result<()> {
        if self.core_version != CORE_PROTOCOL_VERSION {
            return Err(PluginError::HandshakeFailed(format!(
                "incompatible core protocol version: plugin speaks {}, host speaks {}",
                self.core_version, CORE_PROTOCOL_VERSION
            )));
        }
        if self.app_version != config.protocol_version {
            return Err(PluginError::HandshakeFailed(format!(
                "incompatible plugin protocol version: plugin speaks {}, host speaks {}",
                self.app_version, config.protocol_version
            )));
        }
        if self.protocol != PROTOCOL_NAME {
            return Err(PluginError::HandshakeFailed(format!(
                "unsupported wire protocol '{}'",
                self.protocol
            )));
        }
        if self.address.is_empty() {
            return Err(PluginError::HandshakeFailed("empty plugin address".to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_version, self.app_version, self.network, self.address, self.protocol
        )
    }
}

impl FromStr for HandshakeLine {
    type Err = PluginError;

    fn from_str(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        let [core, app, network, address, protocol] = parts.as_slice() else {
            return Err(PluginError::HandshakeFailed(format!(
                "malformed handshake line {line:?}: expected 5 '|' separated fields, got {}",
                parts.len()
            )));
        };

        let version = |field: &str, value: &str| {
            value.parse::<u32>().map_err(|_| {
                PluginError::HandshakeFailed(format!("invalid {field} version '{value}'"))
            })
        };

        Ok(Self {
            core_version: version("core", *core)?,
            app_version: version("plugin protocol", *app)?,
            network: network.parse()?,
            address: address.to_string(),
            protocol: protocol.to_string(),
        })
    }
}

/// Read and validate the handshake line from a plugin's stdout.
///
/// Blank lines are skipped. EOF before a line means the plugin exited early.
pub async fn read_handshake<R>(
    reader: &mut R,
    config: &HandshakeConfig,
    timeout: Duration,
) -> Result<HandshakeLine>
where
    R: AsyncBufRead + Unpin,
{
    let read = async {
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await.map_err(|e| {
                PluginError::HandshakeFailed(format!("failed to read plugin stdout: {e}"))
            })?;
            if n == 0 {
                return Err(PluginError::HandshakeFailed(
                    "plugin exited before completing handshake".to_string(),
                ));
            }
            if !line.trim().is_empty() {
                return Ok(line);
            }
        }
    };

    let line = tokio::time::timeout(timeout, read).await.map_err(|_| {
        PluginError::HandshakeFailed(format!(
            "timed out after {}ms waiting for handshake",
            timeout.as_millis()
        ))
    })??;

    debug!(line = %line.trim(), "received plugin handshake");
    let handshake: HandshakeLine = line.parse()?;
    handshake.validate(config)?;
    Ok(handshake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_line_format() {
        let line = HandshakeLine::new(&HANDSHAKE, Network::Tcp, "127.0.0.1:4242");
        assert_eq!(line.to_string(), "1|1|tcp|127.0.0.1:4242|frame");
        assert_eq!("1|1|tcp|127.0.0.1:4242|frame\n".parse::<HandshakeLine>().unwrap(), line);
    }

    #[test]
    fn test_malformed_lines_are_rejected() {
        for bad in ["", "1|1|tcp|127.0.0.1:1", "x|1|tcp|a|frame", "1|1|udp|a|frame", "1|1|tcp|a|frame|extra"] {
            assert!(
                matches!(bad.parse::<HandshakeLine>(), Err(PluginError::HandshakeFailed(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_version_mismatch() {
        let line: HandshakeLine = "1|2|tcp|127.0.0.1:1|frame".parse().unwrap();
        let err = line.validate(&HANDSHAKE).unwrap_err();
        assert!(err.to_string().contains("plugin speaks 2, host speaks 1"));

        let line: HandshakeLine = "2|1|tcp|127.0.0.1:1|frame".parse().unwrap();
        assert!(line.validate(&HANDSHAKE).is_err());

        let line: HandshakeLine = "1|1|tcp|127.0.0.1:1|grpc".parse().unwrap();
        assert!(line.validate(&HANDSHAKE).is_err());
    }

    #[tokio::test]
    async fn test_read_skips_blank_lines() {
        let mock = tokio_test::io::Builder::new()
            .read(b"\n")
            .read(b"1|1|unix|/tmp/plugin.sock|frame\n")
            .build();
        let mut reader = BufReader::new(mock);

        let line = read_handshake(&mut reader, &HANDSHAKE, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(line.network, Network::Unix);
        assert_eq!(line.address, "/tmp/plugin.sock");
    }

    #[tokio::test]
    async fn test_read_eof_means_plugin_exited() {
        let mock = tokio_test::io::Builder::new().build();
        let mut reader = BufReader::new(mock);

        let err = read_handshake(&mut reader, &HANDSHAKE, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited before completing handshake"));
    }

    #[tokio::test]
    async fn test_read_times_out() {
        // Keep the write half open so the read never sees EOF.
        let (_plugin_stdout, host_end) = tokio::io::duplex(64);
        let mut reader = BufReader::new(host_end);

        let err = read_handshake(&mut reader, &HANDSHAKE, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
