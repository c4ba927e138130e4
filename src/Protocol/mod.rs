pub mod layout;
pub mod Codec;
pub mod SlotTable;

pub use layout::{MAILBOX_SIZE, MESSAGES_PER_MAILBOX, MESSAGE_SIZE, SLOTS_PER_MAILBOX};
pub use Codec::{decode, Message, Opcode, SlotContent, ACK_RECORD, EMPTY_RECORD};
pub use SlotTable::{Mailbox, SlotState};
