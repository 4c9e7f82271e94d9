//! Host <-> plugin RPC layer
//!
//! Calls travel as length-delimited frames over the socket a plugin announces in its
//! handshake. Each frame carries a small JSON header (service, method, metadata or
//! status) followed by the raw binary payload.
//!
//! # Modules
//!
//! - `codec`: frame layout and the `tokio-util` codec
//! - `connection`: multiplexed host-side connection
//! - `server`: plugin-side serving runtime
//! - `recovery`: panic isolation for inbound handlers

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::{PluginError, Result};
use crate::propagation::TraceContext;

pub mod codec;
pub mod connection;
pub mod recovery;
pub mod server;

pub use codec::{Frame, FrameCodec, FrameHeader};
pub use connection::RpcConnection;
pub use recovery::{recover, Recovered};
pub use server::{PluginServer, RequestContext, ServiceHandler};

/// Capability a dispensed service must report to be callable by the host.
pub const UNARY_CAPABILITY: &str = "unary";

/// Outcome codes carried in every response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    Unimplemented,
    Internal,
    Unavailable,
}

/// Response status returned by a plugin handler
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct Status {
    pub code: StatusCode,
    #[serde(default)]
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unimplemented, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Convert a non-OK status received from a plugin into the host error taxonomy.
    pub fn into_error(self) -> PluginError {
        match self.code {
            StatusCode::Internal => PluginError::Internal(self.message),
            StatusCode::Unimplemented => PluginError::Unimplemented(self.message),
            StatusCode::Unavailable => PluginError::Unavailable(self.message),
            StatusCode::Cancelled => PluginError::Cancelled,
            StatusCode::DeadlineExceeded => PluginError::DeadlineExceeded,
            code => PluginError::Remote {
                code,
                message: self.message,
            },
        }
    }
}

/// Case-insensitive multi-valued metadata sent with every request.
///
/// Keys are stored lowercased so forwarded HTTP headers keep their original name
/// regardless of how the inbound request spelled it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Vec<String>>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, keeping any values already present under the key.
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        self.0
            .entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Replace all values under the key with a single value.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_ascii_lowercase(), vec![value.into()]);
    }

    /// First value stored under the key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.0
            .get(&key.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_ascii_lowercase())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-call state supplied by whoever drives a plugin call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Cancelling this token aborts the in-flight call.
    pub cancel: CancellationToken,
    /// Upper bound on the round trip.
    pub deadline: Option<Duration>,
    /// Trace the call belongs to, if any.
    pub trace: Option<TraceContext>,
    /// Headers of the inbound request that triggered the call.
    pub headers: http::HeaderMap,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn with_headers(mut self, headers: http::HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Uniform call surface over a started plugin.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Unary request/response call against the dispensed service.
    async fn invoke(&self, ctx: &CallContext, method: &str, request: Bytes) -> Result<Bytes>;

    /// Streaming calls are not supported; this always fails with `Unimplemented`.
    async fn new_stream(&self, ctx: &CallContext, method: &str) -> Result<Infallible>;

    /// Whether `invoke` would currently be attempted.
    fn is_ready(&self) -> bool;

    /// Tear down the connection and the plugin process. Idempotent.
    async fn close(&self) -> Result<()>;
}
