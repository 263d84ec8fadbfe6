//! In-process transport pair.

use tokio::io::DuplexStream;

use crate::codec::MessageConfig;
use crate::traits::{framed_with_config, MessageStream};

/// Buffer size of each direction of the in-memory pipe.
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// One end of an in-memory connection.
pub type MemoryTransport = MessageStream<DuplexStream>;

/// Create two connected in-memory transports.
///
/// Messages sent on one end arrive, in order, on the other. Dropping one
/// end ends the other's stream.
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    pair_with_config(MessageConfig::default())
}

/// Create two connected in-memory transports with explicit configuration.
pub fn pair_with_config(config: MessageConfig) -> (MemoryTransport, MemoryTransport) {
    let (left, right) = tokio::io::duplex(PIPE_CAPACITY);
    (
        framed_with_config(left, config.clone()),
        framed_with_config(right, config),
    )
}
