//! Multiplexed host-side connection to a plugin
//!
//! A writer task drains an mpsc channel into the socket and a reader task routes
//! responses back to the waiting call by request id, so concurrent calls never wait on
//! each other.

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::{Frame, FrameCodec, FrameHeader};
use super::Metadata;
use crate::error::{PluginError, Result, TransportError};
use crate::plugin::handshake::Network;

const WRITE_QUEUE_DEPTH: usize = 64;

type PendingMap = DashMap<u64, oneshot::Sender<std::result::Result<Frame, TransportError>>>;

pub struct RpcConnection {
    writer_tx: mpsc::Sender<Frame>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl RpcConnection {
    /// Connect to the address a plugin announced in its handshake.
    pub async fn connect(network: Network, address: &str) -> std::result::Result<Self, TransportError> {
        match network {
            Network::Tcp => {
                let stream = tokio::net::TcpStream::connect(address).await.map_err(|e| {
                    TransportError::ConnectionFailed(format!("tcp {address}: {e}"))
                })?;
                stream.set_nodelay(true).map_err(|e| {
                    TransportError::ConnectionFailed(format!("tcp {address}: {e}"))
                })?;
                Ok(Self::from_io(stream))
            }
            #[cfg(unix)]
            Network::Unix => {
                let stream = tokio::net::UnixStream::connect(address).await.map_err(|e| {
                    TransportError::ConnectionFailed(format!("unix {address}: {e}"))
                })?;
                Ok(Self::from_io(stream))
            }
            #[cfg(not(unix))]
            Network::Unix => Err(TransportError::ConnectionFailed(
                "unix sockets are not supported on this platform".into(),
            )),
        }
    }

    /// Wrap an already connected byte stream.
    pub fn from_io<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut sink, mut stream) = Framed::new(io, FrameCodec::new()).split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Frame>(WRITE_QUEUE_DEPTH);
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let writer_shutdown = shutdown.clone();
        let writer_closed = closed.clone();
        let writer_pending = pending.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    frame = writer_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };

                let id = frame.header.id();
                let sent = tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    sent = sink.send(frame) => sent,
                };
                match sent {
                    Ok(()) => {}
                    // Nothing reached the socket; only this call fails.
                    Err(e) if e.is_frame_error() => {
                        warn!(id, error = %e, "dropping frame that cannot be encoded");
                        if let Some((_, tx)) = writer_pending.remove(&id) {
                            let _ = tx.send(Err(e));
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to write frame to plugin");
                        break;
                    }
                }
            }
            let _ = sink.close().await;
            fail_pending(&writer_closed, &writer_pending);
            writer_shutdown.cancel();
        });

        let reader_shutdown = shutdown.clone();
        let reader_closed = closed.clone();
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(frame)) => {
                            let id = frame.header.id();
                            match reader_pending.remove(&id) {
                                Some((_, tx)) => {
                                    let _ = tx.send(Ok(frame));
                                }
                                None => debug!(id, kind = frame.header.kind(), "dropping frame for unknown call"),
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "failed to read frame from plugin");
                            break;
                        }
                        None => {
                            debug!("plugin closed the connection");
                            break;
                        }
                    }
                }
            }
            fail_pending(&reader_closed, &reader_pending);
            reader_shutdown.cancel();
        });

        Self {
            writer_tx,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            shutdown,
        }
    }

    /// Ask the plugin for a named service and return the capabilities it reports.
    pub async fn dispense(&self, service: &str, timeout: Duration) -> Result<Vec<String>> {
        let id = self.next_id();
        let frame = Frame::dispense(id, service);
        let reply = self
            .round_trip(id, frame, &CancellationToken::new(), Some(timeout))
            .await?;

        match reply.header {
            FrameHeader::Dispensed {
                service: dispensed,
                capabilities,
                ..
            } if dispensed == service => Ok(capabilities),
            FrameHeader::Dispensed { service: other, .. } => Err(PluginError::UnsupportedPluginInterface(format!(
                "asked for service '{service}' but plugin dispensed '{other}'"
            ))),
            FrameHeader::Response { status, .. } => Err(PluginError::UnsupportedPluginInterface(format!(
                "plugin cannot dispense service '{service}': {}",
                status.message
            ))),
            other => Err(TransportError::InvalidFrame(format!(
                "unexpected {} frame in reply to dispense",
                other.kind()
            ))
            .into()),
        }
    }

    /// Unary call. Returns the response payload or the plugin's error status.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        metadata: Metadata,
        payload: Bytes,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
    ) -> Result<Bytes> {
        let id = self.next_id();
        let frame = Frame::request(id, service, method, metadata, payload);
        frame.checked_len()?;
        let reply = self.round_trip(id, frame, cancel, deadline).await?;

        match reply.header {
            FrameHeader::Response { status, .. } if status.is_ok() => Ok(reply.payload),
            FrameHeader::Response { status, .. } => Err(status.into_error()),
            other => Err(TransportError::InvalidFrame(format!(
                "unexpected {} frame in reply to request",
                other.kind()
            ))
            .into()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop both I/O tasks and fail every pending call with `Closed`.
    pub fn close(&self) {
        self.shutdown.cancel();
        fail_pending(&self.closed, &self.pending);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn round_trip(
        &self,
        id: u64,
        frame: Frame,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
    ) -> Result<Frame> {
        // The deadline covers queueing too: a plugin that stops reading fills the
        // write queue.
        let expires_at = deadline.map(|d| tokio::time::Instant::now() + d);
        let expired = async move {
            match expires_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        // The reader marks the connection closed before draining, so a call that
        // registers after the drain observes the flag here.
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }

        // Not yet sent, so there is nothing to cancel on the plugin side.
        tokio::select! {
            sent = self.writer_tx.send(frame) => sent.map_err(|_| TransportError::Closed)?,
            _ = cancel.cancelled() => return Err(PluginError::Cancelled),
            _ = &mut expired => return Err(PluginError::DeadlineExceeded),
        }

        tokio::select! {
            reply = rx => match reply {
                Ok(Ok(frame)) => Ok(frame),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(TransportError::Closed.into()),
            },
            _ = cancel.cancelled() => {
                self.abandon(id);
                Err(PluginError::Cancelled)
            }
            _ = &mut expired => {
                self.abandon(id);
                Err(PluginError::DeadlineExceeded)
            }
        }
    }

    fn abandon(&self, id: u64) {
        self.pending.remove(&id);
        if self.writer_tx.try_send(Frame::cancel(id)).is_err() {
            debug!(id, "could not queue cancel frame");
        }
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Removes the pending entry when the waiting call goes away for any reason.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

fn fail_pending(closed: &AtomicBool, pending: &PendingMap) {
    closed.store(true, Ordering::SeqCst);
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }
}
