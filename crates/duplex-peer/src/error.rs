use std::time::Duration;

/// Errors reported by channels, peers and the RPC registry.
///
/// Cloneable so that one connection-level failure can complete every open
/// channel with the same value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// Undecodable wire data. Connection-fatal.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The far end has no handler for the requested method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The far end terminated the channel with an error frame.
    #[error("remote error: {0}")]
    RemoteError(String),

    /// Operation attempted after the channel reached a terminal state.
    #[error("channel closed")]
    ChannelClosed,

    /// The payload codec rejected an outbound value.
    #[error("encode error: {0}")]
    Encode(String),

    /// The payload codec could not interpret an inbound payload.
    #[error("decode error: {0}")]
    Decode(String),

    /// The underlying connection ended.
    #[error("transport closed")]
    TransportClosed,

    /// A unary call received a non-final response.
    #[error("unexpected continuation: call expects a single final response")]
    UnexpectedContinuation,

    /// No response within the allotted time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The channel was closed locally with a reason.
    #[error("channel aborted: {0}")]
    Aborted(String),

    /// Application-level failure raised by a handler.
    #[error("{0}")]
    Handler(String),

    /// A transport operation failed.
    #[error("transport error: {0}")]
    Transport(String),
}

impl RpcError {
    /// Build a handler error from any displayable value.
    pub fn handler(message: impl std::fmt::Display) -> Self {
        Self::Handler(message.to_string())
    }

    /// True for errors that tear down the whole connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MalformedFrame(_) | Self::TransportClosed)
    }
}

impl From<duplex_frame::FrameError> for RpcError {
    fn from(err: duplex_frame::FrameError) -> Self {
        match err {
            duplex_frame::FrameError::Malformed(reason) => Self::MalformedFrame(reason),
        }
    }
}

impl From<duplex_transport::TransportError> for RpcError {
    fn from(err: duplex_transport::TransportError) -> Self {
        match err {
            duplex_transport::TransportError::Closed => Self::TransportClosed,
            other => Self::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(RpcError::TransportClosed.is_fatal());
        assert!(RpcError::MalformedFrame("x".into()).is_fatal());
        assert!(!RpcError::ChannelClosed.is_fatal());
        assert!(!RpcError::RemoteError("boom".into()).is_fatal());
    }

    #[test]
    fn handler_error_displays_bare_message() {
        assert_eq!(RpcError::handler("boom").to_string(), "boom");
    }

    #[test]
    fn transport_closed_maps_through() {
        let err: RpcError = duplex_transport::TransportError::Closed.into();
        assert_eq!(err, RpcError::TransportClosed);
    }
}
