use bytes::Bytes;
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::codec::{MessageCodec, MessageConfig};
use crate::error::TransportError;

/// A bidirectional, ordered, message-oriented connection.
///
/// Each stream item is one complete inbound message and each sink item is
/// one complete outbound message. The stream yielding `None` means the
/// remote end closed the connection.
///
/// Implemented for every type with the right shape, so `Framed` sockets,
/// WebSocket adapters and test doubles all plug in directly.
pub trait Transport:
    Stream<Item = Result<Bytes, TransportError>>
    + Sink<Bytes, Error = TransportError>
    + Send
    + Unpin
    + 'static
{
}

impl<T> Transport for T where
    T: Stream<Item = Result<Bytes, TransportError>>
        + Sink<Bytes, Error = TransportError>
        + Send
        + Unpin
        + 'static
{
}

/// A byte stream wrapped in the length-prefixed message envelope.
pub type MessageStream<IO> = Framed<IO, MessageCodec>;

/// Wrap a byte stream with the default message configuration.
pub fn framed<IO>(io: IO) -> MessageStream<IO>
where
    IO: AsyncRead + AsyncWrite,
{
    framed_with_config(io, MessageConfig::default())
}

/// Wrap a byte stream with explicit message configuration.
pub fn framed_with_config<IO>(io: IO, config: MessageConfig) -> MessageStream<IO>
where
    IO: AsyncRead + AsyncWrite,
{
    Framed::new(io, MessageCodec::with_config(config))
}
