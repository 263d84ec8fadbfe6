//! Channel-multiplexed RPC frames.
//!
//! A frame is the atomic unit exchanged between two peers. Every frame
//! names the logical channel it belongs to; the first frame of a channel
//! is an `Open` frame naming the remote method, later ones are `Data`
//! frames. A frame with a non-empty error terminates its channel, a frame
//! with `last` set ends the sender's half of the stream.

pub mod codec;
pub mod error;
pub mod frame;

pub use codec::{decode_frame, encode_frame, peek_channel, FLAG_LAST};
pub use error::{FrameError, Result};
pub use frame::{Frame, FrameType, Headers};
