use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Result, TransportError};

/// Envelope header: magic (2) + length (4) = 6 bytes.
pub const HEADER_SIZE: usize = 6;

/// Magic bytes: "DX" (0x44 0x58).
pub const MAGIC: [u8; 2] = [0x44, 0x58];

/// Default maximum message size: 16 MiB.
pub const DEFAULT_MAX_MESSAGE: usize = 16 * 1024 * 1024;

/// Configuration for the message codec.
#[derive(Debug, Clone)]
pub struct MessageConfig {
    /// Maximum message body size in bytes. Default: 16 MiB.
    pub max_message_size: usize,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE,
        }
    }
}

/// Length-prefixed message envelope over a byte stream.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬─────────────────┐
/// │ Magic (2B)   │ Length    │ Body            │
/// │ 0x44 0x58    │ (4B LE)   │ (Length bytes)  │
/// │ "DX"         │           │                 │
/// └──────────────┴───────────┴─────────────────┘
/// ```
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    config: MessageConfig,
}

impl MessageCodec {
    /// Create a codec with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec with explicit configuration.
    pub fn with_config(config: MessageConfig) -> Self {
        Self { config }
    }

    /// Current codec configuration.
    pub fn config(&self) -> &MessageConfig {
        &self.config
    }
}

impl Decoder for MessageCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        if src[0..2] != MAGIC {
            return Err(TransportError::InvalidMagic);
        }

        let len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if len > self.config.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: len,
                max: self.config.max_message_size,
            });
        }

        let total = HEADER_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        let max = self.config.max_message_size.min(u32::MAX as usize);
        if item.len() > max {
            return Err(TransportError::MessageTooLarge {
                size: item.len(),
                max,
            });
        }
        dst.reserve(HEADER_SIZE + item.len());
        dst.put_slice(&MAGIC);
        dst.put_u32_le(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(body: &'static [u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageCodec::new()
            .encode(Bytes::from_static(body), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut buf = encoded(b"hello, duplex!");
        assert_eq!(buf.len(), HEADER_SIZE + 14);

        let msg = MessageCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.as_ref(), b"hello, duplex!");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x44, 0x58, 0x00][..]);
        let result = MessageCodec::new().decode(&mut buf).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_decode_incomplete_body() {
        let mut buf = encoded(b"hello");
        buf.truncate(HEADER_SIZE + 2);

        let result = MessageCodec::new().decode(&mut buf).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_decode_invalid_magic() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00][..]);
        let result = MessageCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(TransportError::InvalidMagic)));
    }

    #[test]
    fn test_decode_message_too_large() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(1024 * 1024 * 32);

        let result = MessageCodec::new().decode(&mut buf);
        assert!(matches!(
            result,
            Err(TransportError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_respects_configured_limit() {
        let mut codec = MessageCodec::with_config(MessageConfig {
            max_message_size: 4,
        });
        let mut buf = BytesMut::new();
        let result = codec.encode(Bytes::from_static(b"oversized"), &mut buf);
        assert!(matches!(
            result,
            Err(TransportError::MessageTooLarge { size: 9, max: 4 })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_messages() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"first"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"second"), &mut buf).unwrap();

        let m1 = codec.decode(&mut buf).unwrap().unwrap();
        let m2 = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(m1.as_ref(), b"first");
        assert_eq!(m2.as_ref(), b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_message() {
        let mut buf = encoded(b"");
        let msg = MessageCodec::new().decode(&mut buf).unwrap().unwrap();
        assert!(msg.is_empty());
    }
}
