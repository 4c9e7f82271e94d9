use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::warn;

use super::{DataSource, FileUpload, DISABLED_PAYLOAD};
use crate::error::{PluginError, Result};
use crate::rpc::{CallContext, RpcClient};

/// Loads data by calling one method on a plugin.
pub struct PluginDataSource {
    client: Arc<dyn RpcClient>,
    method: String,
}

impl PluginDataSource {
    pub fn new(client: Arc<dyn RpcClient>, method: impl Into<String>) -> Self {
        Self {
            client,
            method: method.into(),
        }
    }
}

/// The plugin process or its connection is gone, as opposed to this request failing.
fn plugin_is_down(e: &PluginError) -> bool {
    match e {
        PluginError::Transport(transport) => !transport.is_frame_error(),
        e => e.is_unavailable(),
    }
}

#[async_trait]
impl DataSource for PluginDataSource {
    async fn load(&self, ctx: &CallContext, input: &[u8], out: &mut BytesMut) -> Result<()> {
        match self
            .client
            .invoke(ctx, &self.method, Bytes::copy_from_slice(input))
            .await
        {
            Ok(payload) => {
                out.extend_from_slice(&payload);
                Ok(())
            }
            Err(e) if plugin_is_down(&e) => {
                warn!(method = %self.method, error = %e, "plugin unavailable, returning disabled response");
                out.extend_from_slice(DISABLED_PAYLOAD);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn load_with_files(
        &self,
        _ctx: &CallContext,
        _input: &[u8],
        _files: &[FileUpload],
        _out: &mut BytesMut,
    ) -> Result<()> {
        Err(PluginError::Unimplemented(
            "file uploads are not supported by plugin data sources".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::convert::Infallible;
    use std::sync::Mutex;

    struct Scripted {
        reply: fn() -> Result<Bytes>,
        seen: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl Scripted {
        fn new(reply: fn() -> Result<Bytes>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RpcClient for Scripted {
        async fn invoke(&self, _ctx: &CallContext, method: &str, request: Bytes) -> Result<Bytes> {
            self.seen
                .lock()
                .unwrap()
                .push((method.to_string(), request.to_vec()));
            (self.reply)()
        }

        async fn new_stream(&self, _ctx: &CallContext, _method: &str) -> Result<Infallible> {
            Err(PluginError::Unimplemented("streaming is not supported".into()))
        }

        fn is_ready(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_load_appends_plugin_response() {
        let client = Scripted::new(|| Ok(Bytes::from_static(b"{\"data\":{\"projects\":[]}}")));
        let source = PluginDataSource::new(client.clone(), "QueryProjects");

        let mut out = BytesMut::from(&b"prefix:"[..]);
        source
            .load(&CallContext::new(), b"{\"filter\":1}", &mut out)
            .await
            .unwrap();

        assert_eq!(&out[..], b"prefix:{\"data\":{\"projects\":[]}}");
        assert_eq!(
            client.seen.lock().unwrap().as_slice(),
            [("QueryProjects".to_string(), b"{\"filter\":1}".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_unavailable_plugin_degrades_to_disabled_payload() {
        let client = Scripted::new(|| Err(PluginError::Unavailable("closed".into())));
        let source = PluginDataSource::new(client, "QueryProjects");

        let mut out = BytesMut::new();
        source.load(&CallContext::new(), b"{}", &mut out).await.unwrap();
        assert_eq!(&out[..], DISABLED_PAYLOAD);
    }

    #[tokio::test]
    async fn test_connection_lost_mid_call_degrades_to_disabled_payload() {
        let client = Scripted::new(|| Err(TransportError::ReceiveFailed("connection reset".into()).into()));
        let source = PluginDataSource::new(client, "QueryProjects");

        let mut out = BytesMut::new();
        source.load(&CallContext::new(), b"{}", &mut out).await.unwrap();
        assert_eq!(&out[..], DISABLED_PAYLOAD);
    }

    #[tokio::test]
    async fn test_oversized_request_is_not_masked() {
        let client = Scripted::new(|| Err(TransportError::FrameTooLarge { size: 2, limit: 1 }.into()));
        let source = PluginDataSource::new(client, "QueryProjects");

        let mut out = BytesMut::new();
        let err = source.load(&CallContext::new(), b"{}", &mut out).await.unwrap_err();
        assert!(matches!(err, PluginError::Transport(TransportError::FrameTooLarge { .. })));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_other_errors_propagate() {
        let client = Scripted::new(|| Err(PluginError::Internal("internal server error".into())));
        let source = PluginDataSource::new(client, "QueryProjects");

        let mut out = BytesMut::new();
        let err = source.load(&CallContext::new(), b"{}", &mut out).await.unwrap_err();
        assert!(matches!(err, PluginError::Internal(_)));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_file_uploads_are_unimplemented() {
        let source = PluginDataSource::new(Scripted::new(|| Ok(Bytes::new())), "Upload");
        let err = source
            .load_with_files(&CallContext::new(), b"{}", &[], &mut BytesMut::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Unimplemented(_)));
    }
}
