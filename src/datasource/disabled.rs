use async_trait::async_trait;
use bytes::BytesMut;

use super::{DataSource, FileUpload};
use crate::error::Result;
use crate::rpc::CallContext;

/// Response envelope written for every load while a plugin is unavailable.
pub const DISABLED_PAYLOAD: &[u8] = br#"{"errors":[{"message":"Plugin is disabled"}]}"#;

/// Stand-in for a plugin that is disabled or failed to start. Never spawns anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledDataSource;

#[async_trait]
impl DataSource for DisabledDataSource {
    async fn load(&self, _ctx: &CallContext, _input: &[u8], out: &mut BytesMut) -> Result<()> {
        out.extend_from_slice(DISABLED_PAYLOAD);
        Ok(())
    }

    async fn load_with_files(
        &self,
        _ctx: &CallContext,
        _input: &[u8],
        _files: &[FileUpload],
        out: &mut BytesMut,
    ) -> Result<()> {
        out.extend_from_slice(DISABLED_PAYLOAD);
        Ok(())
    }
}
