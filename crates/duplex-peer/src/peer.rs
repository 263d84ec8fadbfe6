use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use duplex_frame::{decode_frame, peek_channel, Frame, Headers};
use duplex_transport::{Transport, TransportError, DEFAULT_MAX_MESSAGE};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{remote_error, Channel, ChannelShared, UNKNOWN_METHOD_PREFIX};
use crate::codec::{Codec, JsonCodec};
use crate::error::{Result, RpcError};
use crate::rpc::{spawn_handler, Handlers};

/// Default bound on a unary call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default inbox depth at which a slow consumer is reported.
pub const DEFAULT_CHANNEL_QUEUE_HINT: usize = 1024;

/// Peer behavior settings.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Upper bound for [`Peer::call`]. `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
    /// Inbox depth at which a channel logs a backlog warning. Inboxes are
    /// unbounded, so the read loop never waits on a consumer.
    pub channel_queue_hint: usize,
    /// Largest encoded frame a send may queue. Keep it at or below the
    /// transport's message limit; larger frames fail the send with
    /// [`RpcError::Encode`].
    pub max_message_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            channel_queue_hint: DEFAULT_CHANNEL_QUEUE_HINT,
            max_message_size: DEFAULT_MAX_MESSAGE,
        }
    }
}

/// Which side of the connection a peer is.
///
/// Each side allocates channel ids of its own parity so ids opened by the
/// two ends never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Built by `accept`; allocates even ids starting at 2.
    Acceptor,
    /// Built by `connect`; allocates odd ids starting at 1.
    Connector,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Self::Acceptor => 2,
            Self::Connector => 1,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acceptor => f.write_str("acceptor"),
            Self::Connector => f.write_str("connector"),
        }
    }
}

struct Routes {
    channels: HashMap<u32, Arc<ChannelShared>>,
    next_id: u32,
    closed: bool,
}

impl Routes {
    fn allocate(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = match self.next_id.checked_add(2) {
                Some(next) => next,
                // Wrap within the same parity, never handing out 0.
                None => 2 - (id & 1),
            };
            if !self.channels.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Connection state shared by every handle and both I/O tasks.
pub(crate) struct PeerInner {
    role: Role,
    config: PeerConfig,
    routes: Mutex<Routes>,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: CancellationToken,
    close_reason: OnceLock<RpcError>,
}

impl PeerInner {
    fn lock_routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, id: u32) -> Option<Arc<ChannelShared>> {
        self.lock_routes().channels.get(&id).cloned()
    }

    /// Encode and queue one frame for the writer task.
    fn enqueue(&self, frame: &Frame) -> Result<()> {
        let wire = frame
            .encode()
            .map_err(|err| RpcError::Encode(err.to_string()))?;
        if wire.len() > self.config.max_message_size {
            return Err(RpcError::Encode(format!(
                "frame of {} bytes exceeds message limit {}",
                wire.len(),
                self.config.max_message_size
            )));
        }
        if self.close_reason.get().is_some() {
            return Err(RpcError::TransportClosed);
        }
        let size = wire.len();
        self.outbound
            .send(wire)
            .map_err(|_| RpcError::TransportClosed)?;
        debug!(
            channel = frame.channel,
            kind = %frame.kind,
            last = frame.last,
            size,
            "frame queued"
        );
        Ok(())
    }

    /// Drop a retired channel from the routing table, unless its id has
    /// already been taken over by a newer channel.
    fn unroute(&self, shared: &Arc<ChannelShared>) {
        let mut routes = self.lock_routes();
        if let Some(current) = routes.channels.get(&shared.id()) {
            if Arc::ptr_eq(current, shared) {
                routes.channels.remove(&shared.id());
            }
        }
    }

    /// Fail one channel whose frame the transport refused.
    fn reject(&self, wire: &[u8], err: TransportError) {
        let channel = peek_channel(wire);
        warn!(?channel, error = %err, "frame dropped by transport");
        if let Some(shared) = channel.and_then(|id| self.lookup(id)) {
            if shared.complete(Some(RpcError::Encode(err.to_string()))) {
                self.unroute(&shared);
            }
        }
    }

    /// Tear the connection down. The first reason wins.
    ///
    /// Every routed channel is completed with `reason` before the close
    /// signal fires.
    pub(crate) fn shutdown(&self, reason: RpcError) {
        if self.close_reason.set(reason.clone()).is_err() {
            return;
        }
        let drained: Vec<Arc<ChannelShared>> = {
            let mut routes = self.lock_routes();
            routes.closed = true;
            routes.channels.drain().map(|(_, channel)| channel).collect()
        };
        for channel in &drained {
            channel.complete(Some(reason.clone()));
        }
        info!(
            role = %self.role,
            reason = %reason,
            channels = drained.len(),
            "peer closed"
        );
        self.closed.cancel();
    }
}

/// One end of a multiplexed connection.
///
/// Owns the routing table from channel id to channel. A reader task
/// demultiplexes inbound frames and a single writer task serializes
/// outbound frames onto the transport. Handles are cheap to clone.
pub struct Peer<C: Codec = JsonCodec> {
    inner: Arc<PeerInner>,
    codec: C,
}

impl<C: Codec> Clone for Peer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            codec: self.codec.clone(),
        }
    }
}

impl<C: Codec> fmt::Debug for Peer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("role", &self.inner.role)
            .field("codec", &self.codec.name())
            .field("open_channels", &self.open_channels())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<C: Codec> Peer<C> {
    /// Bind a peer to `transport` and start its I/O tasks.
    ///
    /// Returns as soon as the peer is routing. Must be called from within
    /// a Tokio runtime.
    pub(crate) fn start<T: Transport>(
        transport: T,
        role: Role,
        codec: C,
        config: PeerConfig,
        handlers: Handlers<C>,
    ) -> Self {
        let (sink, stream) = transport.split::<Bytes>();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PeerInner {
            role,
            config,
            routes: Mutex::new(Routes {
                channels: HashMap::new(),
                next_id: role.first_id(),
                closed: false,
            }),
            outbound,
            closed: CancellationToken::new(),
            close_reason: OnceLock::new(),
        });
        let peer = Self { inner, codec };

        tokio::spawn(write_loop(sink, outbound_rx, Arc::clone(&peer.inner)));
        tokio::spawn(read_loop(stream, peer.clone(), handlers));
        info!(role = %role, codec = peer.codec.name(), "peer started");
        peer
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    pub(crate) fn codec(&self) -> &C {
        &self.codec
    }

    /// Allocate a channel for `method`. Nothing is sent until the first
    /// [`Channel::send`].
    pub fn open(&self, method: &str) -> Result<Channel<C>> {
        self.open_with_headers(method, Headers::new())
    }

    /// [`open`](Self::open) with headers for the Open frame.
    pub fn open_with_headers(&self, method: &str, headers: Headers) -> Result<Channel<C>> {
        let shared = {
            let mut routes = self.inner.lock_routes();
            if routes.closed {
                return Err(self.close_reason().unwrap_or(RpcError::TransportClosed));
            }
            let id = routes.allocate();
            let shared = ChannelShared::outbound(id, method.to_string(), headers);
            routes.channels.insert(id, Arc::clone(&shared));
            shared
        };
        debug!(channel = shared.id(), method, "channel allocated");
        Ok(Channel::new(self.clone(), shared))
    }

    /// Unary call: send `request` as the Open payload, read exactly one
    /// final response.
    ///
    /// A non-final response fails with [`RpcError::UnexpectedContinuation`]
    /// and aborts the channel. Bounded by [`PeerConfig::call_timeout`].
    pub async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let channel = self.open(method)?;
        if let Err(err) = channel.send(request, true) {
            channel.close(None);
            return Err(err);
        }

        let response = match self.inner.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, channel.recv::<Resp>()).await {
                Ok(response) => response,
                Err(_) => {
                    warn!(channel = channel.id(), method, ?limit, "call timed out");
                    channel.close(Some("call timed out"));
                    return Err(RpcError::Timeout(limit));
                }
            },
            None => channel.recv::<Resp>().await,
        };

        let (value, last) = response?;
        if !last {
            channel.close(Some("unexpected continuation"));
            return Err(RpcError::UnexpectedContinuation);
        }
        Ok(value)
    }

    /// Close the connection. Every open channel fails with
    /// [`RpcError::TransportClosed`].
    pub fn close(&self) {
        self.inner.shutdown(RpcError::TransportClosed);
    }

    /// Resolves once, when the connection has closed and every channel has
    /// been completed.
    pub fn close_notify(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.closed.clone().cancelled_owned()
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<RpcError> {
        self.inner.close_reason.get().cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Number of channels currently routed.
    pub fn open_channels(&self) -> usize {
        self.inner.lock_routes().channels.len()
    }

    pub(crate) fn enqueue(&self, frame: &Frame) -> Result<()> {
        self.inner.enqueue(frame)
    }

    /// Drop a retired channel from the routing table, unless its id has
    /// already been taken over by a newer channel.
    pub(crate) fn unroute(&self, shared: &Arc<ChannelShared>) {
        self.inner.unroute(shared);
    }

    fn route(&self, frame: Frame, handlers: &Handlers<C>) {
        if let Some(channel) = self.inner.lookup(frame.channel) {
            if frame.is_error() {
                // Fails the channel at once, even if nobody is receiving.
                debug!(channel = frame.channel, error = %frame.error, "channel failed remotely");
                if channel.complete(Some(remote_error(&frame.error))) {
                    self.unroute(&channel);
                }
                return;
            }
            debug!(channel = frame.channel, kind = %frame.kind, last = frame.last, "frame routed");
            channel.deliver(frame, self.inner.config.channel_queue_hint);
            return;
        }

        if !frame.is_open() {
            debug!(
                channel = frame.channel,
                error = %frame.error,
                "discarding frame for unknown channel"
            );
            return;
        }

        let Some(handler) = handlers.get(&frame.method) else {
            debug!(channel = frame.channel, method = %frame.method, "unknown method");
            let reply = Frame::error(
                frame.channel,
                format!("{UNKNOWN_METHOD_PREFIX}{}", frame.method),
            );
            if let Err(err) = self.inner.enqueue(&reply) {
                warn!(channel = frame.channel, error = %err, "unknown-method reply not sent");
            }
            return;
        };

        let shared = ChannelShared::inbound(&frame);
        {
            let mut routes = self.inner.lock_routes();
            if routes.closed {
                return;
            }
            routes.channels.insert(frame.channel, Arc::clone(&shared));
        }
        debug!(channel = frame.channel, method = %frame.method, "dispatching");
        shared.deliver(frame, self.inner.config.channel_queue_hint);
        spawn_handler(Arc::clone(handler), Channel::new(self.clone(), shared));
    }
}

async fn read_loop<St, C>(mut stream: St, peer: Peer<C>, handlers: Handlers<C>)
where
    St: Stream<Item = std::result::Result<Bytes, TransportError>> + Unpin,
    C: Codec,
{
    let closed = peer.inner.closed.clone();
    loop {
        let next = tokio::select! {
            biased;
            _ = closed.cancelled() => return,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(message)) => match decode_frame(&message) {
                Ok(frame) => peer.route(frame, &handlers),
                Err(err) => {
                    warn!(error = %err, size = message.len(), "undecodable frame; closing connection");
                    peer.inner.shutdown(err.into());
                    return;
                }
            },
            Some(Err(
                err @ (TransportError::InvalidMagic | TransportError::MessageTooLarge { .. }),
            )) => {
                warn!(error = %err, "corrupt message envelope; closing connection");
                peer.inner.shutdown(RpcError::MalformedFrame(err.to_string()));
                return;
            }
            Some(Err(err)) => {
                warn!(error = %err, "transport read failed");
                peer.inner.shutdown(RpcError::TransportClosed);
                return;
            }
            None => {
                debug!("transport ended");
                peer.inner.shutdown(RpcError::TransportClosed);
                return;
            }
        }
    }
}

async fn write_loop<Si>(
    mut sink: Si,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    inner: Arc<PeerInner>,
) where
    Si: Sink<Bytes, Error = TransportError> + Unpin,
{
    let closed = inner.closed.clone();
    loop {
        tokio::select! {
            biased;
            message = outbound.recv() => {
                let Some(message) = message else { break };
                match sink.send(message.clone()).await {
                    Ok(()) => {}
                    // Refused before anything was written; only this frame is lost.
                    Err(err @ TransportError::MessageTooLarge { .. }) => inner.reject(&message, err),
                    Err(err) => {
                        warn!(error = %err, "transport write failed");
                        inner.shutdown(RpcError::TransportClosed);
                        return;
                    }
                }
            }
            _ = closed.cancelled() => {
                // Flush whatever was queued before the close.
                while let Ok(message) = outbound.try_recv() {
                    match sink.feed(message).await {
                        Ok(()) | Err(TransportError::MessageTooLarge { .. }) => {}
                        Err(_) => break,
                    }
                }
                break;
            }
        }
    }
    outbound.close();
    if let Err(err) = sink.close().await {
        debug!(error = %err, "transport close failed");
    }
}
