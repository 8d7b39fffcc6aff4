//! Byte-stuffed frame format.
//!
//! A frame wraps an opaque payload between a start and an end marker:
//!
//! ```text
//! +-----+----------------------------+-----+
//! | SOF | escaped payload (N..2N B)  | EOF |
//! +-----+----------------------------+-----+
//! ```
//!
//! Any payload byte equal to `SOF`, `EOF` or `ESC` is written as `ESC`
//! followed by the byte itself. Everything else passes through unchanged, so
//! the encoded size is at most `2 * N + 2`.

use crate::error::FramingError;
use bytes::{BufMut, Bytes, BytesMut};

/// Start-of-frame marker.
pub const SOF: u8 = 0x02;

/// End-of-frame marker.
pub const EOF: u8 = 0x03;

/// Escape byte; the byte following it is taken literally.
pub const ESC: u8 = 0x10;

#[inline]
fn needs_escape(byte: u8) -> bool {
    byte == SOF || byte == EOF || byte == ESC
}

/// Returns the exact encoded length of `payload`, markers included.
pub fn encoded_len(payload: &[u8]) -> usize {
    2 + payload.len() + payload.iter().filter(|&&b| needs_escape(b)).count()
}

/// Encodes a payload into a frame.
pub fn encode(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(payload));
    buf.put_u8(SOF);
    for &byte in payload {
        if needs_escape(byte) {
            buf.put_u8(ESC);
        }
        buf.put_u8(byte);
    }
    buf.put_u8(EOF);
    buf.freeze()
}

/// Decodes a frame back into its payload.
///
/// The leading `SOF` is optional: some peers drop it when redelivering a
/// frame, so it is stripped only when present.
pub fn decode(framed: &[u8]) -> Result<Bytes, FramingError> {
    if framed.len() < 2 {
        return Err(FramingError::Truncated { len: framed.len() });
    }

    let last = framed[framed.len() - 1];
    if last != EOF {
        return Err(FramingError::MissingTerminator(last));
    }

    let mut body = &framed[..framed.len() - 1];
    if body.first() == Some(&SOF) {
        body = &body[1..];
    }

    let mut out = BytesMut::with_capacity(body.len());
    let mut bytes = body.iter();
    while let Some(&byte) = bytes.next() {
        if byte == ESC {
            match bytes.next() {
                Some(&escaped) => out.put_u8(escaped),
                None => return Err(FramingError::DanglingEscape),
            }
        } else {
            out.put_u8(byte);
        }
    }

    Ok(out.freeze())
}
