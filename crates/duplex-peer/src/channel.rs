use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use duplex_frame::{Frame, Headers};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{Codec, JsonCodec};
use crate::error::{Result, RpcError};
use crate::peer::Peer;

/// Prefix the far end uses when it has no handler for a method.
pub(crate) const UNKNOWN_METHOD_PREFIX: &str = "unknown method: ";

/// Lifecycle of a channel.
///
/// `Opening -> Open -> Closing -> Closed`. `Opening` only exists for
/// locally-initiated channels before the Open frame is queued. `Closing`
/// means one direction has ended with a Last frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opening => f.write_str("opening"),
            Self::Open => f.write_str("open"),
            Self::Closing => f.write_str("closing"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Which end created the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Allocated here; the far end runs the handler.
    Local,
    /// Created from an inbound Open frame; a local handler runs.
    Remote,
}

struct Lifecycle {
    phase: ChannelState,
    sent_last: bool,
    recv_last: bool,
}

/// State shared between a channel's handles and the peer's routing table.
pub(crate) struct ChannelShared {
    id: u32,
    origin: Origin,
    method: String,
    headers: Headers,
    lifecycle: Mutex<Lifecycle>,
    inbox_tx: mpsc::UnboundedSender<Frame>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    queued: AtomicUsize,
    done: CancellationToken,
    outcome: OnceLock<Option<RpcError>>,
    remote_reported: AtomicBool,
}

impl ChannelShared {
    /// A locally-initiated channel, not yet announced to the far end.
    pub(crate) fn outbound(id: u32, method: String, headers: Headers) -> Arc<Self> {
        Arc::new(Self::new(id, Origin::Local, method, headers, ChannelState::Opening))
    }

    /// A channel announced by an inbound Open frame.
    pub(crate) fn inbound(open: &Frame) -> Arc<Self> {
        Arc::new(Self::new(
            open.channel,
            Origin::Remote,
            open.method.clone(),
            open.headers.clone(),
            ChannelState::Open,
        ))
    }

    fn new(
        id: u32,
        origin: Origin,
        method: String,
        headers: Headers,
        phase: ChannelState,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            id,
            origin,
            method,
            headers,
            lifecycle: Mutex::new(Lifecycle {
                phase,
                sent_last: false,
                recv_last: false,
            }),
            inbox_tx,
            inbox: tokio::sync::Mutex::new(inbox_rx),
            queued: AtomicUsize::new(0),
            done: CancellationToken::new(),
            outcome: OnceLock::new(),
            remote_reported: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an inbound frame. Never blocks the read loop.
    pub(crate) fn deliver(&self, frame: Frame, backlog_hint: usize) {
        let depth = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
        if depth == backlog_hint {
            warn!(
                channel = self.id,
                method = %self.method,
                depth,
                "channel inbox backlog; consumer is not keeping up"
            );
        }
        // The receiver lives as long as `self`, so this cannot fail.
        let _ = self.inbox_tx.send(frame);
    }

    /// Move to `Closed` and publish the outcome. Returns false if the
    /// channel was already closed.
    pub(crate) fn complete(&self, outcome: Option<RpcError>) -> bool {
        let closed = self.mark_closed(&mut self.lock(), outcome);
        if closed {
            self.done.cancel();
        }
        closed
    }

    /// The locked half of [`complete`](Self::complete). Callers release
    /// waiters with `done.cancel()` once the lock is dropped.
    fn mark_closed(&self, lifecycle: &mut Lifecycle, outcome: Option<RpcError>) -> bool {
        if lifecycle.phase == ChannelState::Closed {
            return false;
        }
        lifecycle.phase = ChannelState::Closed;
        let _ = self.outcome.set(outcome);
        true
    }

    /// The error reported to sends attempted after `Closed`.
    fn closed_error(&self) -> RpcError {
        match self.outcome.get() {
            Some(Some(err)) if err.is_fatal() => err.clone(),
            _ => RpcError::ChannelClosed,
        }
    }

    /// The error reported to receives attempted after `Closed`. A failure
    /// sent by the far end is reported to exactly one receive.
    fn terminal_error(&self) -> RpcError {
        match self.outcome.get() {
            Some(Some(err @ (RpcError::RemoteError(_) | RpcError::UnknownMethod(_))))
                if !self.remote_reported.swap(true, Ordering::AcqRel) =>
            {
                err.clone()
            }
            _ => self.closed_error(),
        }
    }
}

/// A logical conversation multiplexed over a peer's connection.
///
/// Handles are cheap to clone and all refer to the same channel.
pub struct Channel<C: Codec = JsonCodec> {
    peer: Peer<C>,
    shared: Arc<ChannelShared>,
}

impl<C: Codec> Clone for Channel<C> {
    fn clone(&self) -> Self {
        Self {
            peer: self.peer.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Codec> fmt::Debug for Channel<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("method", &self.shared.method)
            .field("state", &self.state())
            .finish()
    }
}

impl<C: Codec> Channel<C> {
    pub(crate) fn new(peer: Peer<C>, shared: Arc<ChannelShared>) -> Self {
        Self { peer, shared }
    }

    /// Channel id, unique among this peer's open channels.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// The method named by the Open frame.
    pub fn method(&self) -> &str {
        &self.shared.method
    }

    /// Headers carried by the Open frame.
    pub fn headers(&self) -> &Headers {
        &self.shared.headers
    }

    pub fn state(&self) -> ChannelState {
        self.shared.lock().phase
    }

    /// The peer this channel belongs to.
    pub fn peer(&self) -> &Peer<C> {
        &self.peer
    }

    /// Encode `value` and queue it for transmission.
    ///
    /// The first send on a locally-opened channel carries the Open frame.
    /// `last` ends this side's stream.
    pub fn send<T>(&self, value: &T, last: bool) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = self.peer.codec().encode(value)?;
        self.send_payload(payload, last)
    }

    fn send_payload(&self, payload: Bytes, last: bool) -> Result<()> {
        let retire = {
            let mut lifecycle = self.shared.lock();
            if lifecycle.phase == ChannelState::Closed {
                return Err(self.shared.closed_error());
            }
            if lifecycle.sent_last {
                return Err(RpcError::ChannelClosed);
            }

            let frame = if lifecycle.phase == ChannelState::Opening {
                Frame::open(self.shared.id, self.shared.method.clone())
                    .with_headers(self.shared.headers.clone())
            } else {
                Frame::data(self.shared.id, Bytes::new())
            };
            // Enqueue under the lock so this channel's frames keep their order.
            self.peer.enqueue(&frame.with_payload(payload).with_last(last))?;

            if lifecycle.phase == ChannelState::Opening {
                lifecycle.phase = ChannelState::Open;
            }
            if !last {
                false
            } else {
                lifecycle.sent_last = true;
                if self.shared.origin == Origin::Remote || lifecycle.recv_last {
                    self.shared.mark_closed(&mut lifecycle, None)
                } else {
                    lifecycle.phase = ChannelState::Closing;
                    false
                }
            }
        };

        if retire {
            self.released();
        }
        Ok(())
    }

    /// Wait for the next frame and decode its payload.
    ///
    /// Returns the value and whether it was the last frame of the far end's
    /// stream.
    pub async fn recv<T: DeserializeOwned>(&self) -> Result<(T, bool)> {
        let frame = self.next_frame().await?;
        let value = self.peer.codec().decode(&frame.payload)?;
        Ok((value, frame.last))
    }

    /// [`recv`](Self::recv) bounded by `limit`. On timeout the channel is
    /// aborted.
    pub async fn recv_timeout<T: DeserializeOwned>(&self, limit: Duration) -> Result<(T, bool)> {
        match tokio::time::timeout(limit, self.recv()).await {
            Ok(result) => result,
            Err(_) => {
                self.close(Some("receive timed out"));
                Err(RpcError::Timeout(limit))
            }
        }
    }

    async fn next_frame(&self) -> Result<Frame> {
        self.check_readable()?;
        let mut inbox = self.shared.inbox.lock().await;
        self.check_readable()?;

        let frame = tokio::select! {
            biased;
            frame = inbox.recv() => frame,
            _ = self.shared.done.cancelled() => None,
        };
        drop(inbox);

        let Some(frame) = frame else {
            return Err(self.shared.terminal_error());
        };
        self.shared.queued.fetch_sub(1, Ordering::Relaxed);

        if frame.last {
            let retire = {
                let mut lifecycle = self.shared.lock();
                lifecycle.recv_last = true;
                if self.shared.origin == Origin::Local || lifecycle.sent_last {
                    self.shared.mark_closed(&mut lifecycle, None)
                } else {
                    if lifecycle.phase != ChannelState::Closed {
                        lifecycle.phase = ChannelState::Closing;
                    }
                    false
                }
            };
            if retire {
                self.released();
            }
        }
        Ok(frame)
    }

    fn check_readable(&self) -> Result<()> {
        let lifecycle = self.shared.lock();
        if lifecycle.phase == ChannelState::Closed {
            return Err(self.shared.terminal_error());
        }
        if lifecycle.recv_last {
            return Err(RpcError::ChannelClosed);
        }
        Ok(())
    }

    /// Close the channel. Idempotent.
    ///
    /// With a reason, a best-effort Error frame tells the far end to stop.
    /// Without one, this side's stream is ended with an empty Last frame if
    /// it has not ended already, otherwise the far end is told to stop.
    /// Every waiter is released.
    pub fn close(&self, reason: Option<&str>) {
        let closed = {
            let mut lifecycle = self.shared.lock();
            let frame = match lifecycle.phase {
                ChannelState::Closed => return,
                // The far end has never heard of this channel.
                ChannelState::Opening => None,
                _ => match reason {
                    Some(message) => Some(Frame::error(self.shared.id, message)),
                    None if !lifecycle.sent_last => {
                        Some(Frame::data(self.shared.id, Bytes::new()).with_last(true))
                    }
                    // Cancel the response still outstanding.
                    None => Some(Frame::error(self.shared.id, "channel closed")),
                },
            };

            // Queue and mark closed in one critical section so a racing
            // send or close cannot put a second terminal frame on the wire.
            if let Some(frame) = frame {
                if let Err(err) = self.peer.enqueue(&frame) {
                    debug!(channel = self.shared.id, error = %err, "close notification not sent");
                }
            }
            let outcome = reason.map(|message| RpcError::Aborted(message.to_string()));
            self.shared.mark_closed(&mut lifecycle, outcome)
        };

        if closed {
            self.released();
        }
    }

    /// Wait until the channel is closed and report how it ended.
    pub async fn done(&self) -> Result<()> {
        self.shared.done.cancelled().await;
        match self.shared.outcome.get() {
            Some(Some(err)) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Unary call on a new sibling channel of the same peer.
    pub async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.peer.call(method, request).await
    }

    /// Wake waiters and unroute after this handle moved the channel to
    /// `Closed`.
    fn released(&self) {
        self.shared.done.cancel();
        self.peer.unroute(&self.shared);
        debug!(channel = self.shared.id, method = %self.shared.method, "channel closed");
    }
}

/// Map the message of an inbound Error frame to the local error.
pub(crate) fn remote_error(message: &str) -> RpcError {
    match message.strip_prefix(UNKNOWN_METHOD_PREFIX) {
        Some(method) => RpcError::UnknownMethod(method.to_string()),
        None => RpcError::RemoteError(message.to_string()),
    }
}
