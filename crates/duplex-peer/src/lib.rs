//! Channels, peers and the RPC registry.
//!
//! This is the "just works" layer. A [`Peer`] owns one transport and
//! multiplexes any number of [`Channel`]s over it; an [`Rpc`] registry maps
//! method names to handlers and builds peers with [`Rpc::accept`] and
//! [`Rpc::connect`].
//!
//! Calls are strictly unary: [`Peer::call`] sends one request and expects
//! exactly one final response. Streaming goes through [`Peer::open`],
//! [`Channel::send`] and repeated [`Channel::recv`].

pub mod channel;
pub mod codec;
pub mod error;
pub mod peer;
pub mod rpc;

pub use channel::{Channel, ChannelState};
pub use codec::{Codec, CodecError, JsonCodec};
pub use error::{Result, RpcError};
pub use peer::{Peer, PeerConfig, Role, DEFAULT_CALL_TIMEOUT, DEFAULT_CHANNEL_QUEUE_HINT};
pub use rpc::{Handler, Rpc};
