//! Caller-facing adapter over a started plugin
//!
//! Lifecycle is a single atomic: `UNSTARTED -> READY -> CLOSED`. The live connection is
//! published through an `ArcSwapOption` so `invoke` never takes a lock and `close` can
//! race it safely. Every call runs inside a `plugin_call` span.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, field, info_span, Instrument};

use super::process::ProcessHandle;
use crate::error::{PluginError, Result};
use crate::propagation::Interceptor;
use crate::rpc::{CallContext, Metadata, RpcClient, RpcConnection};

const UNSTARTED: u8 = 0;
const READY: u8 = 1;
const CLOSED: u8 = 2;

/// Connection plus the process behind it. Torn down together.
pub(crate) struct LiveBridge {
    pub(crate) connection: RpcConnection,
    pub(crate) process: ProcessHandle,
}

impl LiveBridge {
    async fn shutdown(&self) {
        self.connection.close();
        self.process.kill().await;
    }
}

pub struct PluginClient {
    service: String,
    state: AtomicU8,
    live: ArcSwapOption<LiveBridge>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl PluginClient {
    pub fn new(service: impl Into<String>, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            service: service.into(),
            state: AtomicU8::new(UNSTARTED),
            live: ArcSwapOption::empty(),
            interceptors,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CLOSED
    }

    /// Make a handshaken bridge callable. Fails, and tears the bridge down, if the
    /// client was closed in the meantime or already had a bridge.
    pub(crate) async fn publish(&self, bridge: LiveBridge) -> Result<()> {
        // Claim the slot first so a rejected bridge is never visible to callers.
        if let Err(state) = self
            .state
            .compare_exchange(UNSTARTED, READY, Ordering::SeqCst, Ordering::SeqCst)
        {
            bridge.shutdown().await;
            return Err(PluginError::InvalidState(format!(
                "cannot publish connection for plugin '{}': client is {}",
                self.service,
                state_name(state)
            )));
        }

        self.live.store(Some(Arc::new(bridge)));

        // A close between the claim and the store found nothing to tear down.
        if self.is_closed() {
            if let Some(bridge) = self.live.swap(None) {
                bridge.shutdown().await;
            }
            return Err(self.unavailable("was closed while starting"));
        }

        debug!(plugin = %self.service, "plugin client ready");
        Ok(())
    }

    fn unavailable(&self, reason: &str) -> PluginError {
        PluginError::Unavailable(format!("plugin '{}' {}", self.service, reason))
    }
}

#[async_trait]
impl RpcClient for PluginClient {
    async fn invoke(&self, ctx: &CallContext, method: &str, request: Bytes) -> Result<Bytes> {
        match self.state.load(Ordering::SeqCst) {
            READY => {}
            CLOSED => return Err(self.unavailable("is closed")),
            _ => return Err(self.unavailable("has not been started")),
        }

        let Some(bridge) = self.live.load_full() else {
            return Err(self.unavailable("has no live connection"));
        };
        if bridge.connection.is_closed() {
            return Err(self.unavailable("lost its connection"));
        }

        let mut metadata = Metadata::new();
        for interceptor in &self.interceptors {
            interceptor.intercept(ctx, &mut metadata);
        }

        let span = info_span!("plugin_call", plugin = %self.service, method = %method, trace_id = field::Empty);
        if let Some(trace) = &ctx.trace {
            span.record("trace_id", field::display(format!("{:032x}", trace.trace_id)));
        }

        bridge
            .connection
            .call(&self.service, method, metadata, request, &ctx.cancel, ctx.deadline)
            .instrument(span)
            .await
    }

    async fn new_stream(&self, _ctx: &CallContext, _method: &str) -> Result<Infallible> {
        Err(PluginError::Unimplemented("streaming is not supported".to_string()))
    }

    fn is_ready(&self) -> bool {
        if self.state.load(Ordering::SeqCst) != READY {
            return false;
        }
        match &*self.live.load() {
            Some(bridge) => !bridge.connection.is_closed(),
            None => false,
        }
    }

    async fn close(&self) -> Result<()> {
        if self.state.swap(CLOSED, Ordering::SeqCst) == CLOSED {
            return Ok(());
        }

        if let Some(bridge) = self.live.swap(None) {
            debug!(plugin = %self.service, "closing plugin client");
            bridge.shutdown().await;
        }
        Ok(())
    }
}

fn state_name(state: u8) -> &'static str {
    match state {
        UNSTARTED => "unstarted",
        READY => "ready",
        _ => "closed",
    }
}
