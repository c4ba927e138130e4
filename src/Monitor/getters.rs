use std::time::Duration;

use super::dispatcher::{DispatchStats, Dispatcher};
use super::requester::Requester;
use super::Structs::Request_Structs::RequestState;
use crate::Protocol::layout::MESSAGES_PER_MAILBOX;
use crate::Protocol::SlotTable::{Mailbox, SlotState};

/// Introspection for monitoring and tests. None of these touch storage.
impl Requester {
    pub fn host_id(&self) -> usize {
        self.inner.host_id
    }

    /// Requests placed in a slot and not yet answered.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn request_state(&self, slot: usize) -> Option<RequestState> {
        self.inner.state.lock().pending.get(&slot).map(|p| p.state)
    }

    /// State of `slot` in the outgoing request image, `None` past the last slot.
    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        (slot < MESSAGES_PER_MAILBOX).then(|| self.inner.state.lock().outgoing.slot_state(slot))
    }

    /// Slots a new request could use right now.
    pub fn free_slots(&self) -> usize {
        let state = self.inner.state.lock();
        (0..MESSAGES_PER_MAILBOX).filter(|&slot| state.is_free(slot)).count()
    }

    /// Reply callbacks waiting for room on the callback pool.
    pub fn deferred_callbacks(&self) -> usize {
        self.inner.backlog_len()
    }

    /// Copy of the outgoing request image.
    pub fn outgoing_image(&self) -> Mailbox {
        self.inner.state.lock().outgoing.clone()
    }

    /// Whether the outgoing image has changes not yet written.
    pub fn has_unwritten_changes(&self) -> bool {
        self.inner.state.lock().dirty
    }
}

impl Dispatcher {
    /// Number of host mailboxes scanned each tick.
    pub fn hosts(&self) -> usize {
        self.inner.core.state.lock().hosts()
    }

    pub fn stats(&self) -> DispatchStats {
        self.inner.core.state.lock().stats
    }

    /// Copy of the reply image for `host_id`.
    pub fn reply_image(&self, host_id: usize) -> Option<Mailbox> {
        self.inner.core.state.lock().outbox.get(host_id).cloned()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool.size
    }

    /// Requests queued or running on the worker pool.
    pub fn in_flight(&self) -> usize {
        self.inner.pool.in_flight()
    }

    /// Wait until every submitted request has been processed and its reply
    /// recorded. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.inner.pool.wait_idle(timeout)
    }
}
