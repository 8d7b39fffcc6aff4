//! Request envelopes.
//!
//! An envelope places the correlation id next to the opaque payload handed
//! over by the serializer, and finds it again in the peer's reply. Everything
//! else in the payload is left untouched.

use crate::correlation::{CorrelationId, NO_CORRELATION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Places and extracts correlation ids.
pub trait Envelope {
    /// Builds the request bytes for `payload` tagged with `id`.
    fn seal(&self, id: CorrelationId, payload: &[u8]) -> Bytes;

    /// Extracts the correlation id from a decoded reply.
    ///
    /// Returns `None` for replies without an id and for the reserved id 0,
    /// both of which answer no request.
    fn correlation_id(&self, reply: &[u8]) -> Option<CorrelationId>;
}

/// Built-in envelope layouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// 4-byte big-endian id prefix.
    #[default]
    Prefixed,
    /// Protobuf field 1 (varint).
    Varint,
}

impl EnvelopeKind {
    /// Returns the envelope implementation for this layout.
    pub fn build(self) -> Box<dyn Envelope + Send + Sync> {
        match self {
            EnvelopeKind::Prefixed => Box::new(PrefixedEnvelope),
            EnvelopeKind::Varint => Box::new(VarintEnvelope),
        }
    }
}

/// `[id: u32 BE][payload]`
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixedEnvelope;

impl Envelope for PrefixedEnvelope {
    fn seal(&self, id: CorrelationId, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(id);
        buf.put_slice(payload);
        buf.freeze()
    }

    fn correlation_id(&self, mut reply: &[u8]) -> Option<CorrelationId> {
        if reply.len() < 4 {
            return None;
        }
        match reply.get_u32() {
            NO_CORRELATION => None,
            id => Some(id),
        }
    }
}

/// Protobuf-compatible envelope: the id is field 1 as a varint, followed by
/// the already-encoded message fields.
///
/// Extraction walks the top-level fields of the reply, so the id does not
/// have to come first.
#[derive(Debug, Clone, Copy, Default)]
pub struct VarintEnvelope;

const ID_FIELD: u64 = 1;

const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_FIXED32: u64 = 5;

impl Envelope for VarintEnvelope {
    fn seal(&self, id: CorrelationId, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(6 + payload.len());
        put_varint(&mut buf, ID_FIELD << 3 | WIRE_VARINT);
        put_varint(&mut buf, u64::from(id));
        buf.put_slice(payload);
        buf.freeze()
    }

    fn correlation_id(&self, mut reply: &[u8]) -> Option<CorrelationId> {
        while reply.has_remaining() {
            let key = get_varint(&mut reply)?;
            match key & 0x7 {
                WIRE_VARINT => {
                    let value = get_varint(&mut reply)?;
                    if key >> 3 == ID_FIELD {
                        return CorrelationId::try_from(value)
                            .ok()
                            .filter(|&id| id != NO_CORRELATION);
                    }
                }
                WIRE_FIXED64 => skip(&mut reply, 8)?,
                WIRE_LEN => {
                    let len = usize::try_from(get_varint(&mut reply)?).ok()?;
                    skip(&mut reply, len)?;
                }
                WIRE_FIXED32 => skip(&mut reply, 4)?,
                _ => return None,
            }
        }
        None
    }
}

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn get_varint(buf: &mut &[u8]) -> Option<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        if !buf.has_remaining() {
            return None;
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

fn skip(buf: &mut &[u8], n: usize) -> Option<()> {
    if buf.remaining() < n {
        return None;
    }
    buf.advance(n);
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_layout() {
        let sealed = PrefixedEnvelope.seal(7, b"ping");
        assert_eq!(sealed.as_ref(), b"\x00\x00\x00\x07ping");
        assert_eq!(PrefixedEnvelope.correlation_id(&sealed), Some(7));
    }

    #[test]
    fn test_prefixed_short_or_unsolicited() {
        assert_eq!(PrefixedEnvelope.correlation_id(b"\x00\x01"), None);
        assert_eq!(PrefixedEnvelope.correlation_id(b"\x00\x00\x00\x00evt"), None);
    }

    #[test]
    fn test_varint_layout() {
        let sealed = VarintEnvelope.seal(1, &[]);
        assert_eq!(sealed.as_ref(), &[0x08, 0x01]);

        let sealed = VarintEnvelope.seal(300, &[0x12, 0x01, 0xAA]);
        assert_eq!(sealed.as_ref(), &[0x08, 0xAC, 0x02, 0x12, 0x01, 0xAA]);
        assert_eq!(VarintEnvelope.correlation_id(&sealed), Some(300));
    }

    #[test]
    fn test_varint_id_after_other_fields() {
        // field 2 (len 2), field 3 (fixed32), field 4 (fixed64), then field 1 = 7
        let reply = [
            0x12, 0x02, 0xDE, 0xAD, //
            0x1D, 0x01, 0x02, 0x03, 0x04, //
            0x21, 0, 0, 0, 0, 0, 0, 0, 0, //
            0x08, 0x07,
        ];
        assert_eq!(VarintEnvelope.correlation_id(&reply), Some(7));
    }

    #[test]
    fn test_varint_missing_or_malformed() {
        assert_eq!(VarintEnvelope.correlation_id(&[]), None);
        assert_eq!(VarintEnvelope.correlation_id(&[0x08, 0x00]), None);
        assert_eq!(VarintEnvelope.correlation_id(&[0x12, 0x05, 0x01]), None);
        assert_eq!(VarintEnvelope.correlation_id(&[0x08, 0x80]), None);
        // 2^32 does not fit a correlation id
        assert_eq!(
            VarintEnvelope.correlation_id(&[0x08, 0x80, 0x80, 0x80, 0x80, 0x10]),
            None
        );
    }

    #[test]
    fn test_varint_max_id() {
        let sealed = VarintEnvelope.seal(u32::MAX, b"x");
        assert_eq!(VarintEnvelope.correlation_id(&sealed), Some(u32::MAX));
    }

    #[test]
    fn test_envelope_kind_build() {
        let envelope = EnvelopeKind::Varint.build();
        assert_eq!(envelope.seal(1, &[]).as_ref(), &[0x08, 0x01]);

        let envelope = EnvelopeKind::default().build();
        assert_eq!(envelope.correlation_id(&envelope.seal(9, b"")), Some(9));
    }
}
