//! Attribute protocol PDUs.
//!
//! Only the subset a GATT client needs to talk to a single characteristic:
//!
//! ```text
//! +--------+---------------------------+
//! | opcode | parameters (little-endian)|
//! | 1 byte | 0..MTU-1 bytes            |
//! +--------+---------------------------+
//! ```

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Fixed L2CAP channel carrying ATT on LE links.
pub const ATT_CID: u16 = 4;

/// MTU every LE link starts with.
pub const DEFAULT_MTU: u16 = 23;

/// Largest MTU the protocol allows.
pub const MAX_MTU: u16 = 517;

/// Opcode + handle prefix of write requests and handle value PDUs.
pub const VALUE_HEADER_SIZE: usize = 3;

/// Client Characteristic Configuration descriptor type.
pub const CCCD_UUID16: u16 = 0x2902;

/// Characteristic declaration type.
pub const CHARACTERISTIC_UUID16: u16 = 0x2803;

pub mod opcode {
    pub const ERROR_RSP: u8 = 0x01;
    pub const EXCHANGE_MTU_REQ: u8 = 0x02;
    pub const EXCHANGE_MTU_RSP: u8 = 0x03;
    pub const FIND_INFO_REQ: u8 = 0x04;
    pub const FIND_INFO_RSP: u8 = 0x05;
    pub const READ_REQ: u8 = 0x0A;
    pub const READ_RSP: u8 = 0x0B;
    pub const WRITE_REQ: u8 = 0x12;
    pub const WRITE_RSP: u8 = 0x13;
    pub const HANDLE_VALUE_NTF: u8 = 0x1B;
    pub const HANDLE_VALUE_IND: u8 = 0x1D;
    pub const HANDLE_VALUE_CFM: u8 = 0x1E;
    pub const WRITE_CMD: u8 = 0x52;
}

/// ATT error codes this crate produces or inspects.
pub mod error_code {
    pub const REQUEST_NOT_SUPPORTED: u8 = 0x06;
    pub const ATTRIBUTE_NOT_FOUND: u8 = 0x0A;
}

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Expands a 16-bit SIG-assigned UUID.
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | (short as u128) << 96)
}

/// Returns the 16-bit alias of `uuid` if it lives in the Bluetooth base range.
pub fn as_uuid16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let short = (value >> 96) as u32;
    if value & !(0xFFFF_FFFFu128 << 96) == BLUETOOTH_BASE_UUID && short <= 0xFFFF {
        Some(short as u16)
    } else {
        None
    }
}

/// A decoded ATT PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    ErrorResponse { request: u8, handle: u16, code: u8 },
    ExchangeMtuRequest { mtu: u16 },
    ExchangeMtuResponse { mtu: u16 },
    FindInformationRequest { start: u16, end: u16 },
    FindInformationResponse { entries: Vec<(u16, Uuid)> },
    ReadRequest { handle: u16 },
    ReadResponse { value: Bytes },
    WriteRequest { handle: u16, value: Bytes },
    WriteResponse,
    WriteCommand { handle: u16, value: Bytes },
    Notification { handle: u16, value: Bytes },
    Indication { handle: u16, value: Bytes },
    Confirmation,
    /// Any opcode this crate does not interpret.
    Other { opcode: u8, params: Bytes },
}

impl Pdu {
    pub fn opcode(&self) -> u8 {
        match self {
            Pdu::ErrorResponse { .. } => opcode::ERROR_RSP,
            Pdu::ExchangeMtuRequest { .. } => opcode::EXCHANGE_MTU_REQ,
            Pdu::ExchangeMtuResponse { .. } => opcode::EXCHANGE_MTU_RSP,
            Pdu::FindInformationRequest { .. } => opcode::FIND_INFO_REQ,
            Pdu::FindInformationResponse { .. } => opcode::FIND_INFO_RSP,
            Pdu::ReadRequest { .. } => opcode::READ_REQ,
            Pdu::ReadResponse { .. } => opcode::READ_RSP,
            Pdu::WriteRequest { .. } => opcode::WRITE_REQ,
            Pdu::WriteResponse => opcode::WRITE_RSP,
            Pdu::WriteCommand { .. } => opcode::WRITE_CMD,
            Pdu::Notification { .. } => opcode::HANDLE_VALUE_NTF,
            Pdu::Indication { .. } => opcode::HANDLE_VALUE_IND,
            Pdu::Confirmation => opcode::HANDLE_VALUE_CFM,
            Pdu::Other { opcode, .. } => *opcode,
        }
    }

    /// Returns whether the peer expects an answer to this PDU.
    ///
    /// Requests carry even opcodes below 0x40; commands and the PDUs peers
    /// push on their own do not.
    pub fn is_request(&self) -> bool {
        let op = self.opcode();
        op & 0x40 == 0 && op % 2 == 0 && op != opcode::HANDLE_VALUE_CFM
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.opcode());
        match self {
            Pdu::ErrorResponse {
                request,
                handle,
                code,
            } => {
                buf.put_u8(*request);
                buf.put_u16_le(*handle);
                buf.put_u8(*code);
            }
            Pdu::ExchangeMtuRequest { mtu } | Pdu::ExchangeMtuResponse { mtu } => {
                buf.put_u16_le(*mtu);
            }
            Pdu::FindInformationRequest { start, end } => {
                buf.put_u16_le(*start);
                buf.put_u16_le(*end);
            }
            Pdu::FindInformationResponse { entries } => {
                let short: Option<Vec<u16>> = entries.iter().map(|(_, u)| as_uuid16(u)).collect();
                match short {
                    Some(short) => {
                        buf.put_u8(0x01);
                        for ((handle, _), uuid) in entries.iter().zip(short) {
                            buf.put_u16_le(*handle);
                            buf.put_u16_le(uuid);
                        }
                    }
                    None => {
                        buf.put_u8(0x02);
                        for (handle, uuid) in entries {
                            buf.put_u16_le(*handle);
                            buf.put_u128_le(uuid.as_u128());
                        }
                    }
                }
            }
            Pdu::ReadRequest { handle } => buf.put_u16_le(*handle),
            Pdu::ReadResponse { value } => buf.put_slice(value),
            Pdu::WriteRequest { handle, value }
            | Pdu::WriteCommand { handle, value }
            | Pdu::Notification { handle, value }
            | Pdu::Indication { handle, value } => {
                buf.put_u16_le(*handle);
                buf.put_slice(value);
            }
            Pdu::WriteResponse | Pdu::Confirmation => {}
            Pdu::Other { params, .. } => buf.put_slice(params),
        }
        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        1 + match self {
            Pdu::ErrorResponse { .. } => 4,
            Pdu::ExchangeMtuRequest { .. } | Pdu::ExchangeMtuResponse { .. } => 2,
            Pdu::FindInformationRequest { .. } => 4,
            Pdu::FindInformationResponse { entries } => 1 + entries.len() * 18,
            Pdu::ReadRequest { .. } => 2,
            Pdu::ReadResponse { value } => value.len(),
            Pdu::WriteRequest { value, .. }
            | Pdu::WriteCommand { value, .. }
            | Pdu::Notification { value, .. }
            | Pdu::Indication { value, .. } => 2 + value.len(),
            Pdu::WriteResponse | Pdu::Confirmation => 0,
            Pdu::Other { params, .. } => params.len(),
        }
    }

    pub fn decode(pdu: &[u8]) -> Result<Self, ProtocolError> {
        let Some((&op, mut params)) = pdu.split_first() else {
            return Err(ProtocolError::MalformedPdu("empty PDU".to_string()));
        };

        let decoded = match op {
            opcode::ERROR_RSP => {
                need(op, params, 4)?;
                Pdu::ErrorResponse {
                    request: params.get_u8(),
                    handle: params.get_u16_le(),
                    code: params.get_u8(),
                }
            }
            opcode::EXCHANGE_MTU_REQ => {
                need(op, params, 2)?;
                Pdu::ExchangeMtuRequest {
                    mtu: params.get_u16_le(),
                }
            }
            opcode::EXCHANGE_MTU_RSP => {
                need(op, params, 2)?;
                Pdu::ExchangeMtuResponse {
                    mtu: params.get_u16_le(),
                }
            }
            opcode::FIND_INFO_REQ => {
                need(op, params, 4)?;
                Pdu::FindInformationRequest {
                    start: params.get_u16_le(),
                    end: params.get_u16_le(),
                }
            }
            opcode::FIND_INFO_RSP => {
                need(op, params, 1)?;
                let entry_len = match params.get_u8() {
                    0x01 => 4,
                    0x02 => 18,
                    format => {
                        return Err(ProtocolError::MalformedPdu(format!(
                            "unknown find information format {:#04x}",
                            format
                        )))
                    }
                };
                if params.is_empty() || params.len() % entry_len != 0 {
                    return Err(ProtocolError::MalformedPdu(format!(
                        "find information response with {} trailing bytes",
                        params.len()
                    )));
                }
                let mut entries = Vec::with_capacity(params.len() / entry_len);
                while params.has_remaining() {
                    let handle = params.get_u16_le();
                    let uuid = if entry_len == 4 {
                        uuid16(params.get_u16_le())
                    } else {
                        Uuid::from_u128(params.get_u128_le())
                    };
                    entries.push((handle, uuid));
                }
                Pdu::FindInformationResponse { entries }
            }
            opcode::READ_REQ => {
                need(op, params, 2)?;
                Pdu::ReadRequest {
                    handle: params.get_u16_le(),
                }
            }
            opcode::READ_RSP => Pdu::ReadResponse {
                value: Bytes::copy_from_slice(params),
            },
            opcode::WRITE_RSP => Pdu::WriteResponse,
            opcode::HANDLE_VALUE_CFM => Pdu::Confirmation,
            opcode::WRITE_REQ
            | opcode::WRITE_CMD
            | opcode::HANDLE_VALUE_NTF
            | opcode::HANDLE_VALUE_IND => {
                need(op, params, 2)?;
                let handle = params.get_u16_le();
                let value = Bytes::copy_from_slice(params);
                match op {
                    opcode::WRITE_REQ => Pdu::WriteRequest { handle, value },
                    opcode::WRITE_CMD => Pdu::WriteCommand { handle, value },
                    opcode::HANDLE_VALUE_NTF => Pdu::Notification { handle, value },
                    _ => Pdu::Indication { handle, value },
                }
            }
            _ => Pdu::Other {
                opcode: op,
                params: Bytes::copy_from_slice(params),
            },
        };

        Ok(decoded)
    }
}

fn need(op: u8, params: &[u8], len: usize) -> Result<(), ProtocolError> {
    if params.len() < len {
        return Err(ProtocolError::MalformedPdu(format!(
            "opcode {:#04x} needs {} parameter bytes, got {}",
            op,
            len,
            params.len()
        )));
    }
    Ok(())
}
