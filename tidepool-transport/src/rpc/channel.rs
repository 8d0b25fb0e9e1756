//! Bidirectional RPC channel over one stream.
//!
//! Both ends of a connection are symmetric: either side can send one-way
//! frames or issue calls, and either side answers the other's requests
//! through its [`RpcHandler`]. Each channel owns two tasks:
//!
//! - a writer draining an unbounded frame queue into the stream, so senders
//!   never await (actors push frames from worker threads)
//! - a reader parsing frames, completing pending calls and feeding the handler

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tidepool_core::{NetworkAddress, NetworkProvider};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, trace, warn};

use super::config::ChannelConfig;
use super::handler::RpcHandler;
use super::reply_error::ReplyError;
use crate::error::TransportError;
use crate::wire::{Frame, FrameKind, serialize_frame, try_deserialize_frame};

static NEXT_CONNECTION_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

impl ConnectionHandle {
    fn next() -> Self {
        Self(NEXT_CONNECTION_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the peer.
    Outbound,
    /// The peer dialed our server.
    Inbound,
}

/// Point-in-time traffic counters of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelMetrics {
    /// Frames handed to the writer.
    pub frames_sent: u64,
    /// Frames parsed by the reader.
    pub frames_received: u64,
    /// Bytes handed to the writer, headers included.
    pub bytes_sent: u64,
    /// Bytes read from the stream.
    pub bytes_received: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

type PendingReply = oneshot::Sender<Result<Vec<u8>, ReplyError>>;

struct ChannelInner {
    handle: ConnectionHandle,
    peer: String,
    direction: Direction,
    config: ChannelConfig,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: Mutex<HashMap<u64, PendingReply>>,
    next_correlation: AtomicU64,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    counters: Counters,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// Cheaply cloneable handle to one RPC connection.
#[derive(Clone)]
pub struct RpcChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("handle", &self.inner.handle)
            .field("peer", &self.inner.peer)
            .field("direction", &self.inner.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcChannel {
    /// Dial `address` and wrap the stream in a channel.
    ///
    /// # Errors
    ///
    /// `ConnectTimeout` when the dial exceeds `config.connect_timeout`, or the
    /// provider's I/O error.
    pub async fn connect<N: NetworkProvider>(
        network: &N,
        address: &NetworkAddress,
        handler: Arc<dyn RpcHandler>,
        config: ChannelConfig,
    ) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(config.connect_timeout, network.connect(address))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                address: address.to_string(),
            })??;
        debug!(peer = %address, "rpc channel connected");
        Ok(Self::spawn(
            stream,
            address.to_string(),
            Direction::Outbound,
            handler,
            config,
        ))
    }

    /// Wrap an established stream and start its reader and writer tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<S>(
        stream: S,
        peer: String,
        direction: Direction,
        handler: Arc<dyn RpcHandler>,
        config: ChannelConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let read_capacity = config.read_buffer_capacity;

        let channel = Self {
            inner: Arc::new(ChannelInner {
                handle: ConnectionHandle::next(),
                peer,
                direction,
                config,
                outbound,
                pending: Mutex::new(HashMap::new()),
                next_correlation: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                closed_tx,
                counters: Counters::default(),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let writer_task = tokio::spawn(writer_loop(writer, outbound_rx, channel.clone(), Arc::clone(&handler)));
        let reader_task = tokio::spawn(reader_loop(reader, channel.clone(), handler, read_capacity));
        channel
            .inner
            .tasks
            .lock()
            .extend([writer_task.abort_handle(), reader_task.abort_handle()]);
        if channel.is_closed() {
            // The reader hit EOF before the handles were registered.
            for task in channel.inner.tasks.lock().drain(..) {
                task.abort();
            }
        }
        channel
    }

    /// Connection identifier.
    pub fn handle(&self) -> ConnectionHandle {
        self.inner.handle
    }

    /// Remote end as reported by the provider.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Which side opened the connection.
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Whether the channel has shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Traffic counters.
    pub fn metrics(&self) -> ChannelMetrics {
        let c = &self.inner.counters;
        ChannelMetrics {
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Queue a one-way frame. Never blocks.
    ///
    /// # Errors
    ///
    /// `ChannelClosed` once the channel shut down, `Wire` for oversized payloads.
    pub fn send(&self, method: u32, payload: Vec<u8>) -> Result<(), TransportError> {
        self.send_frame(&Frame::one_way(method, payload))
    }

    /// Call `method` and wait for the response with the default timeout.
    pub async fn call(&self, method: u32, payload: Vec<u8>) -> Result<Vec<u8>, ReplyError> {
        self.call_with_timeout(method, payload, self.inner.config.request_timeout)
            .await
    }

    /// Call `method` and wait at most `timeout` for the response.
    ///
    /// Dropping the returned future forgets the call; a response arriving
    /// later is discarded.
    pub async fn call_with_timeout(
        &self,
        method: u32,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, ReplyError> {
        if self.is_closed() {
            return Err(ReplyError::ConnectionFailed);
        }
        let correlation = self.inner.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(correlation, tx);
        let _guard = PendingGuard {
            channel: self,
            correlation,
        };

        if let Err(err) = self.send_frame(&Frame::request(method, correlation, payload)) {
            debug!(peer = %self.inner.peer, error = %err, "request not sent");
            return Err(ReplyError::ConnectionFailed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ReplyError::ConnectionFailed),
            Err(_) => Err(ReplyError::Timeout),
        }
    }

    /// Wait until the channel shuts down.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        // An error means the sender is gone, which only happens with the channel.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Close the channel locally. Pending calls fail with `ConnectionFailed`.
    pub fn close(&self) {
        self.shutdown(TransportError::ChannelClosed, None, true);
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        let bytes = serialize_frame(frame)?;
        let len = bytes.len() as u64;
        self.inner
            .outbound
            .send(bytes)
            .map_err(|_| TransportError::ChannelClosed)?;
        let c = &self.inner.counters;
        c.frames_sent.fetch_add(1, Ordering::Relaxed);
        c.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    fn complete(&self, correlation: u64, result: Result<Vec<u8>, ReplyError>) {
        match self.inner.pending.lock().remove(&correlation) {
            Some(tx) => {
                // The caller may have given up already.
                let _ = tx.send(result);
            }
            None => debug!(
                peer = %self.inner.peer,
                correlation,
                "dropping response for unknown or expired request"
            ),
        }
    }

    /// Tear down exactly once. `handler` is told about the closure when given.
    fn shutdown(&self, reason: TransportError, handler: Option<&Arc<dyn RpcHandler>>, abort_all: bool) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %self.inner.peer, handle = %self.inner.handle, reason = %reason, "rpc channel closed");

        let pending: Vec<PendingReply> = self.inner.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(ReplyError::ConnectionFailed));
        }

        if let Some(handler) = handler {
            handler.on_closed(self, &reason);
        }
        self.inner.closed_tx.send_replace(true);

        let tasks: Vec<AbortHandle> = self.inner.tasks.lock().drain(..).collect();
        if abort_all {
            for task in tasks {
                task.abort();
            }
        } else if let Some(writer) = tasks.first() {
            writer.abort();
        }
    }
}

/// Removes a call's pending entry when the call future finishes or is dropped.
struct PendingGuard<'a> {
    channel: &'a RpcChannel,
    correlation: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.channel.inner.pending.lock().remove(&self.correlation);
    }
}

async fn writer_loop<S: AsyncWrite + Send>(
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    channel: RpcChannel,
    handler: Arc<dyn RpcHandler>,
) {
    while let Some(bytes) = outbound.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            warn!(peer = %channel.peer(), error = %err, "rpc write failed");
            channel.shutdown(err.into(), Some(&handler), true);
            return;
        }
    }
}

async fn reader_loop<S: AsyncRead + Send>(
    mut reader: ReadHalf<S>,
    channel: RpcChannel,
    handler: Arc<dyn RpcHandler>,
    capacity: usize,
) {
    let mut buf = BytesMut::with_capacity(capacity);
    let reason = 'read: loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => break 'read TransportError::Eof,
            Ok(n) => {
                channel
                    .inner
                    .counters
                    .bytes_received
                    .fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(err) => break 'read err.into(),
        }

        loop {
            match try_deserialize_frame(&buf) {
                Ok(Some((frame, consumed))) => {
                    buf.advance(consumed);
                    channel
                        .inner
                        .counters
                        .frames_received
                        .fetch_add(1, Ordering::Relaxed);
                    dispatch_frame(&channel, &handler, frame).await;
                }
                Ok(None) => break,
                Err(err) => {
                    error!(peer = %channel.peer(), error = %err, "malformed frame, dropping connection");
                    break 'read err.into();
                }
            }
        }
    };
    channel.shutdown(reason, Some(&handler), false);
}

async fn dispatch_frame(channel: &RpcChannel, handler: &Arc<dyn RpcHandler>, frame: Frame) {
    trace!(peer = %channel.peer(), kind = ?frame.kind, method = frame.method, "frame received");
    match frame.kind {
        FrameKind::Response => channel.complete(frame.correlation, Ok(frame.payload)),
        FrameKind::ErrorResponse => {
            let error = serde_json::from_slice::<ReplyError>(&frame.payload)
                .unwrap_or_else(ReplyError::from);
            channel.complete(frame.correlation, Err(error));
        }
        FrameKind::OneWay => {
            handler
                .handle_oneway(channel.clone(), frame.method, frame.payload)
                .await;
        }
        FrameKind::Request => {
            let channel = channel.clone();
            let handler = Arc::clone(handler);
            tokio::spawn(async move {
                let correlation = frame.correlation;
                let method = frame.method;
                let result = handler
                    .handle_request(channel.clone(), method, frame.payload)
                    .await;
                let reply = match result {
                    Ok(payload) => Frame {
                        kind: FrameKind::Response,
                        method,
                        correlation,
                        payload,
                    },
                    Err(error) => Frame {
                        kind: FrameKind::ErrorResponse,
                        method,
                        correlation,
                        payload: serde_json::to_vec(&error).unwrap_or_default(),
                    },
                };
                if let Err(err) = channel.send_frame(&reply) {
                    debug!(peer = %channel.peer(), error = %err, "response not sent");
                }
            });
        }
    }
}
