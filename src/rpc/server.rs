//! Plugin-side serving runtime
//!
//! A plugin binary builds a [`PluginServer`], registers one handler per logical service
//! and calls [`PluginServer::serve`]. The server checks the magic cookie, binds a
//! loopback listener, prints the handshake line on stdout and answers frames until the
//! host kills it. The startup config the host put in the environment is parsed before
//! the handshake and handed to every handler through [`RequestContext::startup`].

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{Frame, FrameCodec, FrameHeader};
use super::recovery::{install_panic_hook, Recovered};
use super::{Metadata, Status, UNARY_CAPABILITY};
use crate::error::{PluginError, Result};
use crate::plugin::handshake::{HandshakeConfig, HandshakeLine, Network};
use crate::plugin::startup::StartupConfig;
use crate::propagation::{MetadataCarrier, TextMapPropagator, TraceContext, TraceContextPropagator};

const RESPONSE_QUEUE_DEPTH: usize = 64;

/// Status message sent instead of a result that does not fit in one frame.
pub const RESPONSE_TOO_LARGE: &str = "response too large";

/// What a plugin handler sees about the call it is serving.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub service: String,
    pub method: String,
    pub metadata: Metadata,
    /// Trace context extracted from the request metadata.
    pub trace: Option<TraceContext>,
    /// Settings the host passed at launch.
    pub startup: Arc<StartupConfig>,
}

impl RequestContext {
    pub fn new(service: &str, method: &str) -> Self {
        Self {
            service: service.to_string(),
            method: method.to_string(),
            ..Self::default()
        }
    }
}

/// Business logic of one plugin service.
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    async fn call(&self, ctx: RequestContext, method: &str, payload: Bytes) -> std::result::Result<Bytes, Status>;
}

pub struct PluginServer {
    handshake: HandshakeConfig,
    services: HashMap<String, Arc<dyn ServiceHandler>>,
    startup: Arc<StartupConfig>,
}

impl PluginServer {
    pub fn new(handshake: HandshakeConfig) -> Self {
        Self {
            handshake,
            services: HashMap::new(),
            startup: Arc::default(),
        }
    }

    /// Override the startup config `serve` would read from the environment.
    pub fn with_startup(mut self, startup: StartupConfig) -> Self {
        self.startup = Arc::new(startup);
        self
    }

    /// Register a service under its logical name. Every call is wrapped in panic recovery.
    pub fn register<H: ServiceHandler>(mut self, name: impl Into<String>, handler: H) -> Self {
        self.services
            .insert(name.into(), Arc::new(Recovered::new(handler)));
        self
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Check the magic cookie the host puts in the environment.
    pub fn verify_cookie(&self) -> Result<()> {
        let key = self.handshake.magic_cookie_key;
        match std::env::var(key) {
            Ok(value) if value == self.handshake.magic_cookie_value => Ok(()),
            _ => Err(PluginError::HandshakeFailed(
                "This binary is a plugin. It is not meant to be executed directly. \
                 Start it through the plugin host."
                    .to_string(),
            )),
        }
    }

    /// Serve until the process receives Ctrl+C or SIGTERM, or is killed by the host.
    pub async fn serve(self) -> Result<()> {
        self.verify_cookie()?;
        let startup = StartupConfig::from_env()?;
        debug!(
            tracing = startup.tracing().is_some(),
            ip_anonymization = startup.ip_anonymization.as_ref().is_some_and(|ip| ip.enabled),
            "startup config received"
        );
        let server = self.with_startup(startup);
        install_panic_hook();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;

        let line = HandshakeLine::new(&server.handshake, Network::Tcp, address.to_string());
        let mut stdout = tokio::io::stdout();
        stdout.write_all(format!("{line}\n").as_bytes()).await?;
        stdout.flush().await?;

        let shutdown = CancellationToken::new();
        let signal_shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            signal_shutdown.cancel();
        });

        server.serve_listener(listener, shutdown).await
    }

    /// Accept host connections on an already bound listener.
    pub async fn serve_listener(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let services = Arc::new(self.services);
        info!(address = ?listener.local_addr().ok(), "plugin serving");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("plugin server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "host connected");
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(serve_connection(
                        stream,
                        services.clone(),
                        self.startup.clone(),
                        shutdown.child_token(),
                    ));
                }
            }
        }
    }
}

/// Answer frames from one host connection.
///
/// If responses can no longer be written the connection is dropped, so the host sees
/// EOF and fails its pending calls instead of waiting on them.
pub async fn serve_connection<T>(
    io: T,
    services: Arc<HashMap<String, Arc<dyn ServiceHandler>>>,
    startup: Arc<StartupConfig>,
    shutdown: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sink, mut stream) = Framed::new(io, FrameCodec::new()).split();
    let (tx, mut rx) = mpsc::channel::<Frame>(RESPONSE_QUEUE_DEPTH);
    let in_flight: Arc<DashMap<u64, AbortHandle>> = Arc::new(DashMap::new());
    let closing = shutdown.child_token();

    let writer_closing = closing.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let id = frame.header.id();
            match sink.send(frame).await {
                Ok(()) => {}
                // Nothing was written; answer the call with an error instead.
                Err(e) if e.is_frame_error() => {
                    warn!(id, error = %e, "dropping response that cannot be encoded");
                    let reply = Frame::response(id, Status::internal(RESPONSE_TOO_LARGE), Bytes::new());
                    if sink.send(reply).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to write response to host");
                    break;
                }
            }
        }
        let _ = sink.close().await;
        writer_closing.cancel();
    });

    let propagator = TraceContextPropagator::new();

    loop {
        let frame = tokio::select! {
            _ = closing.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!(error = %e, "failed to read frame from host");
                    break;
                }
                None => break,
            }
        };

        match frame.header {
            FrameHeader::Dispense { id, service } => {
                let reply = if services.contains_key(&service) {
                    Frame::dispensed(id, &service, vec![UNARY_CAPABILITY.to_string()])
                } else {
                    Frame::response(
                        id,
                        Status::not_found(format!("unknown service '{service}'")),
                        Bytes::new(),
                    )
                };
                if tx.send(reply).await.is_err() {
                    break;
                }
            }
            FrameHeader::Request {
                id,
                service,
                method,
                metadata,
            } => {
                let Some(handler) = services.get(&service).cloned() else {
                    let reply = Frame::response(
                        id,
                        Status::unimplemented(format!("unknown service '{service}'")),
                        Bytes::new(),
                    );
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                    continue;
                };

                let trace = propagator.extract(&MetadataCarrier::new(&metadata));
                let ctx = RequestContext {
                    service,
                    method: method.clone(),
                    metadata,
                    trace,
                    startup: startup.clone(),
                };
                let tx = tx.clone();
                let registry = in_flight.clone();
                let closing = closing.clone();
                let (registered_tx, registered_rx) = oneshot::channel::<()>();
                let task = tokio::spawn(async move {
                    // Wait until the abort handle is recorded so removal below cannot
                    // race the insert.
                    let _ = registered_rx.await;
                    let (status, payload) = match handler.call(ctx, &method, frame.payload).await {
                        Ok(payload) => (Status::ok(), payload),
                        Err(status) => (status, Bytes::new()),
                    };
                    registry.remove(&id);

                    let mut reply = Frame::response(id, status, payload);
                    if let Err(e) = reply.checked_len() {
                        warn!(id, method = %method, error = %e, "response exceeds frame limit");
                        reply = Frame::response(id, Status::internal(RESPONSE_TOO_LARGE), Bytes::new());
                    }
                    if tx.send(reply).await.is_err() {
                        warn!(id, "response writer is gone, closing connection");
                        closing.cancel();
                    }
                });
                in_flight.insert(id, task.abort_handle());
                let _ = registered_tx.send(());
            }
            FrameHeader::Cancel { id } => {
                if let Some((_, handle)) = in_flight.remove(&id) {
                    debug!(id, "host cancelled call");
                    handle.abort();
                }
            }
            other => {
                warn!(kind = other.kind(), "unexpected frame from host");
            }
        }
    }

    for entry in in_flight.iter() {
        entry.value().abort();
    }
    drop(tx);
    let _ = writer.await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
