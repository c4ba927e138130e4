// In-memory image of one host's 4096-byte slot table

use sha2::{Digest, Sha256};

use super::layout::{
    slot_range, CHECKSUM_BYTES, CHECKSUM_OFFSET, MAILBOX_SIZE, MESSAGES_PER_MAILBOX, MESSAGE_SIZE,
};
use super::Codec::{decode, SlotContent, ACK_RECORD, EMPTY_RECORD};
use crate::error::{MailboxError, ProtocolError};

/// Coarse state of a slot, derived from its bytes alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Active,
    Acknowledged,
}

/// One host's mailbox: 63 message slots followed by a 4-byte checksum trailer.
///
/// The buffer is heap allocated so a table of mailboxes can be moved around
/// cheaply. A mailbox never knows which area it belongs to; the owner decides
/// whether it is an outgoing image or a snapshot of what was last read.
#[derive(Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub(crate) host_id: usize,
    pub(crate) bytes: Box<[u8; MAILBOX_SIZE]>,
}

impl Mailbox {
    /// A pristine, all-zero mailbox.
    pub fn new(host_id: usize) -> Self {
        Self {
            host_id,
            bytes: Box::new([0u8; MAILBOX_SIZE]),
        }
    }

    pub fn from_bytes(host_id: usize, bytes: Box<[u8; MAILBOX_SIZE]>) -> Self {
        Self { host_id, bytes }
    }

    /// Copy a mailbox out of a larger region read in one shot.
    pub fn from_slice(host_id: usize, bytes: &[u8]) -> Result<Self, MailboxError> {
        let array: &[u8; MAILBOX_SIZE] = bytes.try_into().map_err(|_| {
            MailboxError::Protocol(ProtocolError::BadLength {
                expected: MAILBOX_SIZE,
                actual: bytes.len(),
            })
        })?;
        Ok(Self {
            host_id,
            bytes: Box::new(*array),
        })
    }

    pub fn host_id(&self) -> usize {
        self.host_id
    }

    pub fn as_bytes(&self) -> &[u8; MAILBOX_SIZE] {
        &self.bytes
    }

    /// Raw bytes of a message slot.
    ///
    /// # Panics
    /// If `slot` is not a message slot (`slot >= MESSAGES_PER_MAILBOX`).
    pub fn slot(&self, slot: usize) -> &[u8; MESSAGE_SIZE] {
        assert!(slot < MESSAGES_PER_MAILBOX, "slot {slot} out of range");
        let range = slot_range(slot);
        (&self.bytes[range])
            .try_into()
            .expect("slot range is MESSAGE_SIZE bytes")
    }

    /// Overwrite a message slot. The checksum is stale until `seal` is called.
    pub fn set_slot(&mut self, slot: usize, record: &[u8; MESSAGE_SIZE]) {
        assert!(slot < MESSAGES_PER_MAILBOX, "slot {slot} out of range");
        self.bytes[slot_range(slot)].copy_from_slice(record);
    }

    pub fn clear_slot(&mut self, slot: usize) {
        self.set_slot(slot, &EMPTY_RECORD);
    }

    pub fn acknowledge_slot(&mut self, slot: usize) {
        self.set_slot(slot, &ACK_RECORD);
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        let record = self.slot(slot);
        if record[0] == 0 {
            SlotState::Empty
        } else if *record == ACK_RECORD {
            SlotState::Acknowledged
        } else {
            SlotState::Active
        }
    }

    pub fn decode_slot(&self, slot: usize) -> Result<SlotContent, ProtocolError> {
        decode(self.slot(slot))
    }

    /// Integrity value over `[0, CHECKSUM_OFFSET)`: the first four bytes of a
    /// SHA-256 digest, read little-endian. Never zero, zero is the
    /// "never written" trailer.
    pub fn checksum(&self) -> u32 {
        let digest = Sha256::digest(&self.bytes[..CHECKSUM_OFFSET]);
        let mut word = [0u8; CHECKSUM_BYTES];
        word.copy_from_slice(&digest[..CHECKSUM_BYTES]);
        u32::from_le_bytes(word).max(1)
    }

    pub fn stored_checksum(&self) -> u32 {
        let mut word = [0u8; CHECKSUM_BYTES];
        word.copy_from_slice(&self.bytes[CHECKSUM_OFFSET..]);
        u32::from_le_bytes(word)
    }

    /// Recompute and store the trailer. Call before every write.
    pub fn seal(&mut self) {
        let sum = self.checksum();
        self.bytes[CHECKSUM_OFFSET..].copy_from_slice(&sum.to_le_bytes());
    }

    /// Whether the stored trailer matches the contents.
    ///
    /// An all-zero trailer marks a mailbox that was never written (or was reset);
    /// it is only valid when every other byte is zero as well.
    pub fn validate(&self) -> bool {
        let stored = self.stored_checksum();
        if stored == 0 {
            return self.bytes[..CHECKSUM_OFFSET].iter().all(|&b| b == 0);
        }
        stored == self.checksum()
    }

    /// [`Mailbox::validate`] as a `Result`, for callers that log or propagate.
    pub fn verify(&self) -> Result<(), MailboxError> {
        if self.validate() {
            Ok(())
        } else {
            Err(MailboxError::ChecksumMismatch {
                host_id: self.host_id,
            })
        }
    }

    /// Every byte is zero, trailer included.
    pub fn is_pristine(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }

    /// Cheap test that every message slot is empty, looking only at the
    /// version byte of each slot.
    pub fn looks_empty(&self) -> bool {
        (0..MESSAGES_PER_MAILBOX).all(|slot| self.bytes[slot * MESSAGE_SIZE] == 0)
    }

    /// Zero everything, trailer included.
    pub fn reset(&mut self) {
        self.bytes.fill(0);
    }

    /// Bring the buffer into its on-storage form and return it: a mailbox with
    /// no occupied slot goes out as all zeros, anything else is sealed.
    pub fn prepare_for_write(&mut self) -> &[u8; MAILBOX_SIZE] {
        if self.looks_empty() {
            self.reset();
        } else {
            self.seal();
        }
        &self.bytes
    }

    /// Slots whose bytes differ between `self` and `previous`.
    pub fn changed_slots<'a>(&'a self, previous: &'a Mailbox) -> impl Iterator<Item = usize> + 'a {
        (0..MESSAGES_PER_MAILBOX).filter(move |&slot| self.slot(slot) != previous.slot(slot))
    }

    /// Number of slots that are not empty.
    pub fn occupied(&self) -> usize {
        (0..MESSAGES_PER_MAILBOX)
            .filter(|&slot| self.slot_state(slot) != SlotState::Empty)
            .count()
    }
}
