use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

/// Out-of-band string metadata carried by a frame.
///
/// Ordered so the wire encoding of a frame is deterministic.
pub type Headers = BTreeMap<String, String>;

/// Discriminates the first frame of a channel from the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Establishes a channel and names the method to invoke.
    Open = 0,
    /// Carries a payload chunk on an already-open channel.
    Data = 1,
}

impl FrameType {
    /// Parse the wire discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Open),
            1 => Some(Self::Data),
            _ => None,
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("OPEN"),
            Self::Data => f.write_str("DATA"),
        }
    }
}

/// A single multiplexed frame.
///
/// Fields unused by a given [`FrameType`] are present but empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Open or Data.
    pub kind: FrameType,
    /// The channel this frame belongs to.
    pub channel: u32,
    /// Method name; non-empty on Open frames only.
    pub method: String,
    /// Out-of-band metadata.
    pub headers: Headers,
    /// Codec-encoded application value.
    pub payload: Bytes,
    /// Non-empty when this frame terminates the channel with a failure.
    pub error: String,
    /// Final frame of the sender's half of the stream.
    pub last: bool,
}

impl Frame {
    /// An Open frame for `method` on `channel`.
    pub fn open(channel: u32, method: impl Into<String>) -> Self {
        Self {
            kind: FrameType::Open,
            channel,
            method: method.into(),
            headers: Headers::new(),
            payload: Bytes::new(),
            error: String::new(),
            last: false,
        }
    }

    /// A Data frame carrying `payload` on `channel`.
    pub fn data(channel: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameType::Data,
            channel,
            method: String::new(),
            headers: Headers::new(),
            payload: payload.into(),
            error: String::new(),
            last: false,
        }
    }

    /// A Data frame that fails `channel` with `message`.
    pub fn error(channel: u32, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            ..Self::data(channel, Bytes::new())
        }
    }

    /// Replace the payload.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Replace the headers.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Set the last flag.
    pub fn with_last(mut self, last: bool) -> Self {
        self.last = last;
        self
    }

    /// True for Open frames.
    pub fn is_open(&self) -> bool {
        self.kind == FrameType::Open
    }

    /// True if this frame carries an error.
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}
