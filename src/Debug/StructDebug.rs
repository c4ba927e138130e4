use std::fmt;

use crate::Core::pool::WorkerPool;
use crate::Monitor::{Dispatcher, Requester};
use crate::Protocol::layout::MESSAGES_PER_MAILBOX;
use crate::Protocol::SlotTable::{Mailbox, SlotState};

/// Debug function for Mailbox
///
/// Never dumps the 4 KiB buffer. Shows:
/// - Host index
/// - Slot occupancy by state
/// - Stored checksum and whether it validates
pub fn debug_mailbox(mailbox: &Mailbox, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let (mut active, mut acked) = (0usize, 0usize);
    for slot in 0..MESSAGES_PER_MAILBOX {
        match mailbox.slot_state(slot) {
            SlotState::Active => active += 1,
            SlotState::Acknowledged => acked += 1,
            SlotState::Empty => {}
        }
    }
    f.debug_struct("Mailbox")
        .field("host_id", &mailbox.host_id())
        .field("active", &active)
        .field("acknowledged", &acked)
        .field("checksum", &format_args!("{:#010x}", mailbox.stored_checksum()))
        .field("valid", &mailbox.validate())
        .finish()
}

/// Debug function for Requester
pub fn debug_requester(requester: &Requester, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Requester")
        .field("host_id", &requester.host_id())
        .field("pending", &requester.pending_count())
        .field("free_slots", &requester.free_slots())
        .finish_non_exhaustive()
}

/// Debug function for Dispatcher
pub fn debug_dispatcher(dispatcher: &Dispatcher, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Dispatcher")
        .field("hosts", &dispatcher.hosts())
        .field("pool_size", &dispatcher.pool_size())
        .field("in_flight", &dispatcher.in_flight())
        .field("stats", &dispatcher.stats())
        .finish_non_exhaustive()
}

/// Debug function for WorkerPool
pub fn debug_worker_pool(pool: &WorkerPool, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerPool")
        .field("name", &pool.name)
        .field("size", &pool.size)
        .field("in_flight", &pool.in_flight())
        .finish()
}
