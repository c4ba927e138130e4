// Codec for the 64-byte request/reply records

use std::fmt;

use uuid::Uuid;

use super::layout::{RawMessage, ACK_BYTE, HEADER_LEN, MESSAGE_SIZE, MESSAGE_VERSION, SIZE_HEX_DIGITS};
use crate::error::ProtocolError;

/// Operations a host may ask the coordinator to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Grow a thin-provisioned volume to a new size.
    Extend,
}

impl Opcode {
    pub const fn wire(self) -> [u8; 4] {
        match self {
            Opcode::Extend => *b"xtnd",
        }
    }

    pub fn from_wire(code: [u8; 4]) -> Result<Self, ProtocolError> {
        match &code {
            b"xtnd" => Ok(Opcode::Extend),
            _ => Err(ProtocolError::UnknownOpcode(code)),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.wire();
        f.write_str(std::str::from_utf8(&code).unwrap_or("????"))
    }
}

/// A decoded request or reply. Replies reuse the request's header and carry the
/// resulting size; a zero size on a reply means the operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub opcode: Opcode,
    pub domain_id: Uuid,
    pub volume_id: Uuid,
    pub size: u64,
}

/// What a 64-byte slot currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotContent {
    Empty,
    Acknowledged,
    Message(Message),
}

/// The all-`0x01` record a requester writes once it consumed a reply.
pub const ACK_RECORD: [u8; MESSAGE_SIZE] = [ACK_BYTE; MESSAGE_SIZE];

/// An all-zero record.
pub const EMPTY_RECORD: [u8; MESSAGE_SIZE] = [0; MESSAGE_SIZE];

impl Message {
    pub fn extend(domain_id: Uuid, volume_id: Uuid, size: u64) -> Self {
        Self {
            opcode: Opcode::Extend,
            domain_id,
            volume_id,
            size,
        }
    }

    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut raw = RawMessage::zeroed();
        raw.version = MESSAGE_VERSION;
        raw.opcode = self.opcode.wire();
        raw.domain_id = *self.domain_id.as_bytes();
        raw.volume_id = *self.volume_id.as_bytes();
        let hex = format!("{:0width$x}", self.size, width = SIZE_HEX_DIGITS);
        raw.size_hex.copy_from_slice(hex.as_bytes());
        raw.to_bytes()
    }

    /// Reply carrying the size the operation produced.
    pub fn reply(&self, resulting_size: u64) -> Self {
        Self {
            size: resulting_size,
            ..*self
        }
    }

    /// Reply telling the requester the operation failed.
    pub fn failure_reply(&self) -> Self {
        self.reply(0)
    }

    pub fn is_failure(&self) -> bool {
        self.size == 0
    }

    /// Whether `reply` answers this request: version, opcode and both UUIDs must match.
    pub fn answered_by(&self, reply: &[u8; MESSAGE_SIZE]) -> bool {
        self.encode()[..HEADER_LEN] == reply[..HEADER_LEN]
    }
}

/// Decode one slot. An empty slot and the acknowledged sentinel are normal
/// states, not errors.
pub fn decode(bytes: &[u8; MESSAGE_SIZE]) -> Result<SlotContent, ProtocolError> {
    if bytes[0] == 0 {
        return Ok(SlotContent::Empty);
    }
    if *bytes == ACK_RECORD {
        return Ok(SlotContent::Acknowledged);
    }

    let raw = RawMessage::from_bytes(bytes);
    if raw.version != MESSAGE_VERSION {
        return Err(ProtocolError::BadVersion(raw.version));
    }
    let opcode = Opcode::from_wire(raw.opcode)?;
    let size = parse_size(&raw.size_hex)?;

    Ok(SlotContent::Message(Message {
        opcode,
        domain_id: Uuid::from_bytes(raw.domain_id),
        volume_id: Uuid::from_bytes(raw.volume_id),
        size,
    }))
}

/// Decode from an arbitrary slice, checking its length first.
pub fn decode_slice(bytes: &[u8]) -> Result<SlotContent, ProtocolError> {
    let record: &[u8; MESSAGE_SIZE] = bytes.try_into().map_err(|_| ProtocolError::BadLength {
        expected: MESSAGE_SIZE,
        actual: bytes.len(),
    })?;
    decode(record)
}

fn parse_size(field: &[u8; SIZE_HEX_DIGITS]) -> Result<u64, ProtocolError> {
    let malformed = || ProtocolError::BadSizeField(String::from_utf8_lossy(field).into_owned());
    if !field.iter().all(u8::is_ascii_hexdigit) {
        return Err(malformed());
    }
    let text = std::str::from_utf8(field).map_err(|_| malformed())?;
    u64::from_str_radix(text, 16).map_err(|_| malformed())
}
