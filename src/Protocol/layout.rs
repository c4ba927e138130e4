/// Size of one host's mailbox in either shared area.
pub const MAILBOX_SIZE: usize = 4096;

/// Size of a single request or reply record.
pub const MESSAGE_SIZE: usize = 64;

/// Number of 64-byte positions in a mailbox, including the one that holds the checksum.
pub const SLOTS_PER_MAILBOX: usize = MAILBOX_SIZE / MESSAGE_SIZE;

/// Usable message slots. The last slot carries the checksum trailer.
pub const MESSAGES_PER_MAILBOX: usize = SLOTS_PER_MAILBOX - 1;

/// Width of the integrity trailer at the end of every mailbox.
pub const CHECKSUM_BYTES: usize = 4;

/// Offset of the checksum trailer; the checksum covers `[0, CHECKSUM_OFFSET)`.
pub const CHECKSUM_OFFSET: usize = MAILBOX_SIZE - CHECKSUM_BYTES;

/// Protocol version byte written at the head of every message.
pub const MESSAGE_VERSION: u8 = b'1';

/// Fill byte of the acknowledged sentinel record.
pub const ACK_BYTE: u8 = 0x01;

/// Bytes of a message that identify the request: version, opcode and both UUIDs.
/// A reply must repeat them verbatim.
pub const HEADER_LEN: usize = 1 + 4 + 16 + 16;

/// Number of ASCII hex digits in the size field.
pub const SIZE_HEX_DIGITS: usize = 16;

/// On-disk layout of one record.
///
/// Every field is a byte array so the struct has alignment 1 and no implicit
/// padding; its size is exactly `MESSAGE_SIZE`.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    /// Literal `b'1'`; zero means the slot is empty.
    pub version: u8,
    /// Four ASCII characters, e.g. `b"xtnd"`.
    pub opcode: [u8; 4],
    /// Packed (binary) storage domain UUID.
    pub domain_id: [u8; 16],
    /// Packed (binary) volume UUID.
    pub volume_id: [u8; 16],
    /// Size as 16 lowercase hex digits, zero-padded on the left.
    pub size_hex: [u8; SIZE_HEX_DIGITS],
    /// Always zero.
    pub padding: [u8; 11],
}

impl RawMessage {
    pub fn zeroed() -> Self {
        Self {
            version: 0,
            opcode: [0; 4],
            domain_id: [0; 16],
            volume_id: [0; 16],
            size_hex: [0; SIZE_HEX_DIGITS],
            padding: [0; 11],
        }
    }

    pub fn to_bytes(&self) -> [u8; MESSAGE_SIZE] {
        let mut out = [0u8; MESSAGE_SIZE];
        out[0] = self.version;
        out[1..5].copy_from_slice(&self.opcode);
        out[5..21].copy_from_slice(&self.domain_id);
        out[21..37].copy_from_slice(&self.volume_id);
        out[37..53].copy_from_slice(&self.size_hex);
        out[53..64].copy_from_slice(&self.padding);
        out
    }

    pub fn from_bytes(bytes: &[u8; MESSAGE_SIZE]) -> Self {
        let mut raw = Self::zeroed();
        raw.version = bytes[0];
        raw.opcode.copy_from_slice(&bytes[1..5]);
        raw.domain_id.copy_from_slice(&bytes[5..21]);
        raw.volume_id.copy_from_slice(&bytes[21..37]);
        raw.size_hex.copy_from_slice(&bytes[37..53]);
        raw.padding.copy_from_slice(&bytes[53..64]);
        raw
    }
}

/// Byte range of `host_id`'s mailbox inside either shared area.
#[inline]
pub fn mailbox_offset(host_id: usize) -> u64 {
    (host_id * MAILBOX_SIZE) as u64
}

/// Byte range of `slot` inside a mailbox.
#[inline]
pub fn slot_range(slot: usize) -> std::ops::Range<usize> {
    let start = slot * MESSAGE_SIZE;
    start..start + MESSAGE_SIZE
}
