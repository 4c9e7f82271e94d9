//! Data sources the query planner can wire to a plugin-backed field
//!
//! [`PluginDataSource`] calls a plugin through its client. [`DisabledDataSource`] stands
//! in when plugins are disabled or the plugin could not be started, and answers with an
//! error envelope instead of failing the whole response.

use async_trait::async_trait;
use bytes::BytesMut;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::plugin::HostRegistry;
use crate::rpc::CallContext;

pub mod disabled;
pub mod plugin;

pub use disabled::{DisabledDataSource, DISABLED_PAYLOAD};
pub use plugin::PluginDataSource;

/// A file attached to a multipart request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub path: PathBuf,
    pub name: String,
    /// Variable the upload is bound to, e.g. `variables.file`.
    pub variable_path: String,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch data for `input`, appending the response to `out`.
    async fn load(&self, ctx: &CallContext, input: &[u8], out: &mut BytesMut) -> Result<()>;

    async fn load_with_files(
        &self,
        ctx: &CallContext,
        input: &[u8],
        files: &[FileUpload],
        out: &mut BytesMut,
    ) -> Result<()>;
}

/// Pick the data source for a plugin-backed subgraph.
///
/// Returns the plugin source only when plugins are enabled and `name` is registered
/// with a ready client. Everything else gets the fallback.
pub async fn select_data_source(
    registry: &HostRegistry,
    enabled: bool,
    name: &str,
    method: &str,
) -> Arc<dyn DataSource> {
    if !enabled {
        return Arc::new(DisabledDataSource);
    }

    let client = match registry.get(name).await {
        Ok(plugin) => plugin.client(),
        Err(_) => None,
    };

    match client {
        Some(client) if client.is_ready() => Arc::new(PluginDataSource::new(client, method)),
        _ => {
            debug!(plugin = %name, "plugin not available, using disabled data source");
            Arc::new(DisabledDataSource)
        }
    }
}
