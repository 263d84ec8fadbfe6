use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::frame::{Frame, FrameType, Headers};

/// Flag bit: final frame of the sender's stream.
pub const FLAG_LAST: u8 = 0b0000_0001;

/// Fixed prefix: type (1) + flags (1) + channel (4).
const PREFIX_SIZE: usize = 6;

/// Encode a frame into the wire format.
///
/// Wire format (all integers little-endian, every field always present):
/// ```text
/// ┌──────┬───────┬─────────┬──────────┬─────────┬──────────────────┬─────────┬──────────┐
/// │ Type │ Flags │ Channel │ Method   │ Headers │ (Key, Value)*    │ Error   │ Payload  │
/// │ (1B) │ (1B)  │ (4B)    │ (str16)  │ (2B n)  │ (str16, str16)   │ (str32) │ (bytes32)│
/// └──────┴───────┴─────────┴──────────┴─────────┴──────────────────┴─────────┴──────────┘
/// ```
/// `str16` is a 2-byte length followed by UTF-8, `str32`/`bytes32` a 4-byte
/// length followed by the bytes.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    validate(frame)?;
    if frame.headers.len() > u16::MAX as usize {
        return Err(FrameError::malformed(format!(
            "too many headers ({}, max {})",
            frame.headers.len(),
            u16::MAX
        )));
    }

    dst.reserve(wire_size(frame));
    dst.put_u8(frame.kind as u8);
    dst.put_u8(if frame.last { FLAG_LAST } else { 0 });
    dst.put_u32_le(frame.channel);
    put_str16(dst, "method", &frame.method)?;
    dst.put_u16_le(frame.headers.len() as u16);
    for (key, value) in &frame.headers {
        put_str16(dst, "header key", key)?;
        put_str16(dst, "header value", value)?;
    }
    put_bytes32(dst, "error", frame.error.as_bytes())?;
    put_bytes32(dst, "payload", &frame.payload)?;
    Ok(())
}

/// Channel id of an encoded frame, read without decoding the rest.
pub fn peek_channel(src: &[u8]) -> Option<u32> {
    let raw = src.get(2..PREFIX_SIZE)?;
    <[u8; 4]>::try_from(raw).ok().map(u32::from_le_bytes)
}

/// Decode one frame from a complete transport message.
///
/// The whole message must be consumed; trailing bytes are rejected.
pub fn decode_frame(src: &[u8]) -> Result<Frame> {
    let mut buf = src;
    if buf.remaining() < PREFIX_SIZE {
        return Err(FrameError::malformed(format!(
            "truncated prefix ({} bytes)",
            buf.remaining()
        )));
    }

    let raw_kind = buf.get_u8();
    let kind = FrameType::from_u8(raw_kind)
        .ok_or_else(|| FrameError::malformed(format!("unknown frame type {raw_kind}")))?;
    let flags = buf.get_u8();
    if flags & !FLAG_LAST != 0 {
        return Err(FrameError::malformed(format!("unknown flags {flags:#04x}")));
    }
    let channel = buf.get_u32_le();
    let method = get_str16(&mut buf, "method")?;

    let header_count = get_u16(&mut buf, "header count")?;
    let mut headers = Headers::new();
    for _ in 0..header_count {
        let key = get_str16(&mut buf, "header key")?;
        let value = get_str16(&mut buf, "header value")?;
        headers.insert(key, value);
    }

    let error = into_string(get_bytes32(&mut buf, "error")?, "error")?;
    let payload = Bytes::copy_from_slice(get_bytes32(&mut buf, "payload")?);

    if buf.has_remaining() {
        return Err(FrameError::malformed(format!(
            "{} trailing bytes",
            buf.remaining()
        )));
    }

    let frame = Frame {
        kind,
        channel,
        method,
        headers,
        payload,
        error,
        last: flags & FLAG_LAST != 0,
    };
    validate(&frame)?;
    Ok(frame)
}

impl Frame {
    /// Encode this frame into a standalone transport message.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        encode_frame(self, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Exact number of bytes `encode` produces.
    pub fn wire_size(&self) -> usize {
        wire_size(self)
    }
}

fn wire_size(frame: &Frame) -> usize {
    PREFIX_SIZE
        + 2
        + frame.method.len()
        + 2
        + frame
            .headers
            .iter()
            .map(|(k, v)| 4 + k.len() + v.len())
            .sum::<usize>()
        + 4
        + frame.error.len()
        + 4
        + frame.payload.len()
}

/// Per-type field rules; no coercion between Open and Data.
fn validate(frame: &Frame) -> Result<()> {
    match frame.kind {
        FrameType::Open if frame.method.is_empty() => {
            Err(FrameError::malformed("open frame without method"))
        }
        FrameType::Data if !frame.method.is_empty() => Err(FrameError::malformed(format!(
            "data frame carries method '{}'",
            frame.method
        ))),
        _ => Ok(()),
    }
}

fn put_str16(dst: &mut BytesMut, field: &str, value: &str) -> Result<()> {
    if value.len() > u16::MAX as usize {
        return Err(FrameError::malformed(format!(
            "{field} too long ({} bytes, max {})",
            value.len(),
            u16::MAX
        )));
    }
    dst.put_u16_le(value.len() as u16);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn put_bytes32(dst: &mut BytesMut, field: &str, value: &[u8]) -> Result<()> {
    if value.len() > u32::MAX as usize {
        return Err(FrameError::malformed(format!(
            "{field} too long ({} bytes)",
            value.len()
        )));
    }
    dst.put_u32_le(value.len() as u32);
    dst.put_slice(value);
    Ok(())
}

fn get_u16(buf: &mut &[u8], field: &str) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(FrameError::malformed(format!("truncated {field}")));
    }
    Ok(buf.get_u16_le())
}

fn get_str16(buf: &mut &[u8], field: &str) -> Result<String> {
    let len = get_u16(buf, field)? as usize;
    let raw = take(buf, len, field)?;
    into_string(raw, field)
}

fn get_bytes32<'a>(buf: &mut &'a [u8], field: &str) -> Result<&'a [u8]> {
    if buf.remaining() < 4 {
        return Err(FrameError::malformed(format!("truncated {field} length")));
    }
    let len = buf.get_u32_le() as usize;
    take(buf, len, field)
}

fn take<'a>(buf: &mut &'a [u8], len: usize, field: &str) -> Result<&'a [u8]> {
    let slice: &'a [u8] = buf;
    if slice.len() < len {
        return Err(FrameError::malformed(format!(
            "truncated {field} ({} of {len} bytes)",
            slice.len()
        )));
    }
    let (head, rest) = slice.split_at(len);
    *buf = rest;
    Ok(head)
}

fn into_string(raw: &[u8], field: &str) -> Result<String> {
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| FrameError::malformed(format!("{field} is not valid UTF-8")))
}
