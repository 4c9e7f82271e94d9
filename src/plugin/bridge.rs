use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::process::ChildStdout;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::client::{LiveBridge, PluginClient};
use super::descriptor::PluginDescriptor;
use super::handshake::{read_handshake, HandshakeConfig, HANDSHAKE};
use super::process::{forward_lines, ProcessHandle};
use super::startup::{StartupConfig, STARTUP_CONFIG_ENV};
use super::Plugin;
use crate::error::{PluginError, Result};
use crate::propagation::Interceptor;
use crate::rpc::{RpcClient, RpcConnection, UNARY_CAPABILITY};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a process-backed plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Unstarted,
    Handshaking,
    Ready,
    Stopped,
    Failed,
}

impl BridgeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BridgeState::Unstarted,
            1 => BridgeState::Handshaking,
            2 => BridgeState::Ready,
            3 => BridgeState::Stopped,
            _ => BridgeState::Failed,
        }
    }
}

pub struct ProcessPluginConfig {
    pub descriptor: PluginDescriptor,
    pub handshake: HandshakeConfig,
    pub handshake_timeout: Duration,
    /// Run on the metadata of every outbound call, in order.
    pub interceptors: Vec<Arc<dyn Interceptor>>,
    /// Handed to the child through [`STARTUP_CONFIG_ENV`].
    pub startup: StartupConfig,
}

impl ProcessPluginConfig {
    pub fn new(descriptor: PluginDescriptor) -> Self {
        Self {
            descriptor,
            handshake: HANDSHAKE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            interceptors: Vec::new(),
            startup: StartupConfig::default(),
        }
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_startup(mut self, startup: StartupConfig) -> Self {
        self.startup = startup;
        self
    }
}

/// A plugin running as a child process.
///
/// `start` validates the binary, spawns it, reads the handshake, connects, and
/// dispenses the service named after the plugin. Any failure after the spawn kills
/// the process before returning.
pub struct ProcessPlugin {
    name: String,
    descriptor: PluginDescriptor,
    handshake: HandshakeConfig,
    handshake_timeout: Duration,
    startup: StartupConfig,
    client: Arc<PluginClient>,
    state: AtomicU8,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessPlugin {
    pub fn new(config: ProcessPluginConfig) -> Self {
        let name = config.descriptor.logical_name.clone();
        Self {
            client: Arc::new(PluginClient::new(name.clone(), config.interceptors)),
            name,
            descriptor: config.descriptor,
            handshake: config.handshake,
            handshake_timeout: config.handshake_timeout,
            startup: config.startup,
            state: AtomicU8::new(BridgeState::Unstarted as u8),
            watcher: Mutex::new(None),
        }
    }

    pub fn state(&self) -> BridgeState {
        match BridgeState::from_u8(self.state.load(Ordering::SeqCst)) {
            // The start token may have closed the client behind our back.
            BridgeState::Ready if self.client.is_closed() => BridgeState::Stopped,
            state => state,
        }
    }

    fn transition(&self, from: BridgeState, to: BridgeState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    async fn launch(&self) -> Result<()> {
        let descriptor = self
            .descriptor
            .clone()
            .with_env(STARTUP_CONFIG_ENV, self.startup.to_env_value()?)
            .validate()?;
        let (process, mut stdout) = ProcessHandle::spawn(&descriptor, &self.handshake)?;
        debug!(pid = process.pid(), path = %descriptor.path().display(), "plugin process spawned");

        let connection = match self.connect(&mut stdout).await {
            Ok(connection) => connection,
            Err(e) => {
                process.kill().await;
                return Err(e);
            }
        };

        tokio::spawn(forward_lines(self.name.clone(), "stdout", stdout));
        self.client.publish(LiveBridge { connection, process }).await
    }

    async fn connect(&self, stdout: &mut BufReader<ChildStdout>) -> Result<RpcConnection> {
        let line = read_handshake(stdout, &self.handshake, self.handshake_timeout).await?;
        debug!(network = %line.network, address = %line.address, "plugin handshake complete");

        let connection = RpcConnection::connect(line.network, &line.address).await?;
        let capabilities = connection
            .dispense(&self.name, self.handshake_timeout)
            .await?;

        if !capabilities.iter().any(|c| c == UNARY_CAPABILITY) {
            connection.close();
            return Err(PluginError::UnsupportedPluginInterface(format!(
                "service '{}' does not support unary calls (capabilities: {:?})",
                self.name, capabilities
            )));
        }
        Ok(connection)
    }
}

#[async_trait]
impl Plugin for ProcessPlugin {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn start(&self, token: CancellationToken) -> Result<()> {
        let span = info_span!("plugin", plugin = %self.name);

        async move {
            if !self.transition(BridgeState::Unstarted, BridgeState::Handshaking) {
                return Err(PluginError::InvalidState(format!(
                    "plugin '{}' cannot be started from state {:?}",
                    self.name,
                    self.state()
                )));
            }

            if let Err(e) = self.launch().await {
                self.transition(BridgeState::Handshaking, BridgeState::Failed);
                warn!(error = %e, "plugin failed to start");
                return Err(e);
            }

            if !self.transition(BridgeState::Handshaking, BridgeState::Ready) {
                // Stopped while handshaking.
                self.client.close().await?;
                return Err(PluginError::InvalidState(format!(
                    "plugin '{}' was stopped during start",
                    self.name
                )));
            }

            let client = self.client.clone();
            let name = self.name.clone();
            let watcher = tokio::spawn(async move {
                token.cancelled().await;
                debug!(plugin = %name, "start token cancelled, stopping plugin");
                if let Err(e) = client.close().await {
                    warn!(plugin = %name, error = %e, "failed to stop plugin");
                }
            });
            *self.watcher.lock().await = Some(watcher);

            info!("plugin started");
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn stop(&self) -> Result<()> {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                match BridgeState::from_u8(state) {
                    BridgeState::Failed | BridgeState::Stopped => None,
                    _ => Some(BridgeState::Stopped as u8),
                }
            });

        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.abort();
        }
        if !self.client.is_closed() {
            info!(plugin = %self.name, "stopping plugin");
        }
        self.client.close().await
    }

    fn client(&self) -> Option<Arc<dyn RpcClient>> {
        let client: Arc<dyn RpcClient> = self.client.clone();
        Some(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::CallContext;
    use bytes::Bytes;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_invalid_descriptor_fails_before_spawn() {
        let dir = TempDir::new().unwrap();
        let plugin = ProcessPlugin::new(ProcessPluginConfig::new(PluginDescriptor::new(
            "missing",
            dir.path().join("missing"),
        )));

        let err = plugin.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::Validation(_)));
        assert_eq!(plugin.state(), BridgeState::Failed);

        let err = plugin.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::InvalidState(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_plugin_without_handshake_times_out() {
        let plugin = ProcessPlugin::new(
            ProcessPluginConfig::new(PluginDescriptor::new("silent", "/bin/sh").with_args(["-c", "sleep 30"]))
                .with_handshake_timeout(Duration::from_millis(100)),
        );

        let err = plugin.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::HandshakeFailed(ref msg) if msg.contains("timed out")));
        assert_eq!(plugin.state(), BridgeState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_plugin_exiting_early_fails_handshake() {
        let plugin = ProcessPlugin::new(ProcessPluginConfig::new(
            PluginDescriptor::new("quitter", "/bin/sh").with_args(["-c", "exit 1"]),
        ));

        let err = plugin.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::HandshakeFailed(ref msg) if msg.contains("exited")));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop_and_blocks_start() {
        let plugin = ProcessPlugin::new(ProcessPluginConfig::new(PluginDescriptor::new("p", "/nonexistent")));

        plugin.stop().await.unwrap();
        plugin.stop().await.unwrap();
        assert_eq!(plugin.state(), BridgeState::Stopped);

        let client = plugin.client().unwrap();
        let err = client.invoke(&CallContext::new(), "Echo", Bytes::new()).await.unwrap_err();
        assert!(err.is_unavailable());

        let err = plugin.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::InvalidState(_)));
    }
}
