//! Out-of-process plugins
//!
//! Plugins are independently built executables. The host validates the binary, spawns
//! it under the platform launch policy, reads a handshake line from its stdout and
//! then talks to the announced socket with the framed RPC protocol in [`crate::rpc`].
//!
//! # Modules
//!
//! - `descriptor`: binary resolution and validation
//! - `launch`: per-platform process attributes and termination
//! - `process`: spawning and supervision of the child
//! - `handshake`: magic cookie and handshake line
//! - `client`: caller-facing adapter with idempotent teardown
//! - `bridge`: `Plugin` implementation that drives the start sequence
//! - `registry`: name -> plugin directory
//! - `startup`: settings handed to the plugin at launch

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::rpc::RpcClient;

pub mod bridge;
pub mod client;
pub mod descriptor;
pub mod handshake;
pub mod launch;
pub mod process;
pub mod registry;
pub mod startup;

pub use bridge::{BridgeState, ProcessPlugin, ProcessPluginConfig};
pub use client::PluginClient;
pub use descriptor::{resolve_plugin_path, validate_plugin_path, PluginDescriptor, ValidatedDescriptor};
pub use handshake::{HandshakeConfig, HANDSHAKE};
pub use process::ProcessHandle;
pub use registry::HostRegistry;
pub use startup::{StartupConfig, STARTUP_CONFIG_ENV};

/// A named, startable capability registered with the host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> String;

    /// Start the plugin. Cancelling `token` later stops it.
    async fn start(&self, token: CancellationToken) -> Result<()>;

    /// Stop the plugin. Stopping a stopped plugin is a no-op.
    async fn stop(&self) -> Result<()>;

    fn client(&self) -> Option<Arc<dyn RpcClient>>;
}
