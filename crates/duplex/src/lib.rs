//! Bidirectional multiplexed RPC over a single message transport.
//!
//! One connection carries many independent channels. Each channel is one
//! in-flight call or one open stream, named by a method. Either end can
//! call the other.
//!
//! # Crate Structure
//!
//! - [`transport`]: message transports (in-memory, Unix sockets, TCP)
//! - [`frame`]: the multiplexing frame and its wire encoding
//! - [`peer`]: channels, peers and the RPC registry (behind `peer` feature)
//!
//! # Example
//!
//! ```no_run
//! use duplex::peer::{Channel, Rpc};
//! use duplex::transport::memory;
//!
//! # async fn demo() -> duplex::peer::Result<()> {
//! let mut server = Rpc::json();
//! server.register("echo", |ch: Channel| async move {
//!     let (text, _last): (String, bool) = ch.recv().await?;
//!     ch.send(&text, true)
//! });
//!
//! let (a, b) = memory::pair();
//! let _server = server.accept(a);
//! let client = Rpc::json().connect(b);
//!
//! let reply: String = client.call("echo", "hi").await?;
//! assert_eq!(reply, "hi");
//! # Ok(())
//! # }
//! ```

/// Re-export transport types.
pub mod transport {
    pub use duplex_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use duplex_frame::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use duplex_peer::*;
}
