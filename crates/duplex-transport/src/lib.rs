//! Message-oriented transports for duplex peers.
//!
//! A transport moves whole messages, never partial ones. Byte-stream
//! sockets are wrapped in a length-prefixed envelope:
//! - A 2-byte magic number ("DX") for stream synchronization
//! - A 4-byte little-endian body length
//!
//! This is the lowest layer of duplex. Everything else builds on top of
//! the [`Transport`] trait provided here.

pub mod codec;
pub mod error;
pub mod memory;
pub mod tcp;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use codec::{MessageCodec, MessageConfig, DEFAULT_MAX_MESSAGE, HEADER_SIZE, MAGIC};
pub use error::{Result, TransportError};
pub use traits::{framed, framed_with_config, MessageStream, Transport};
