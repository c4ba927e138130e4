// Host-side monitor: places requests in the host's own request mailbox and
// watches the matching reply mailbox written by the coordinator

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use super::builder::MailboxConfig;
use super::ticker::Ticker;
use super::Structs::Request_Structs::{ExtendReply, PendingRequest, ReplyCallback, RequestState};
use crate::error::{Area, MailboxError, Result};
use crate::Core::pool::{Job, WorkerPool};
use crate::Core::SharedStorage::SharedChannel;
use crate::Protocol::layout::MESSAGES_PER_MAILBOX;
use crate::Protocol::Codec::{decode, Message, SlotContent};
use crate::Protocol::SlotTable::{Mailbox, SlotState};

pub(crate) struct RequesterState {
    /// What this host wants the coordinator to see.
    pub(crate) outgoing: Mailbox,
    /// Last reply mailbox that passed validation.
    pub(crate) replies: Mailbox,
    pub(crate) pending: HashMap<usize, PendingRequest>,
    /// `outgoing` differs from what storage holds.
    pub(crate) dirty: bool,
}

impl RequesterState {
    fn new(host_id: usize) -> Self {
        Self {
            outgoing: Mailbox::new(host_id),
            replies: Mailbox::new(host_id),
            pending: HashMap::new(),
            // Clean start: the first tick writes an empty request mailbox.
            dirty: true,
        }
    }

    /// A slot is reusable once our copy is empty, nothing waits on it and the
    /// coordinator's reply slot has been cleared.
    pub(crate) fn is_free(&self, slot: usize) -> bool {
        self.outgoing.slot_state(slot) == SlotState::Empty
            && !self.pending.contains_key(&slot)
            && self.replies.slot_state(slot) == SlotState::Empty
    }

    fn free_slot(&self) -> Option<usize> {
        (0..MESSAGES_PER_MAILBOX).find(|&slot| self.is_free(slot))
    }

    /// Diff a freshly read reply mailbox against the last one and act on
    /// every slot that changed.
    ///
    /// A slot whose request is still only in memory keeps its previous reply
    /// bytes in the snapshot, so whatever the coordinator wrote there is looked
    /// at again once the request is on storage.
    fn absorb(&mut self, mut incoming: Mailbox, completed: &mut Vec<Job>) {
        let host_id = incoming.host_id();
        let changed: Vec<usize> = incoming.changed_slots(&self.replies).collect();

        for slot in changed {
            if self.pending.get(&slot).is_some_and(|p| p.state == RequestState::Sent) {
                incoming.set_slot(slot, self.replies.slot(slot));
                tracing::trace!(host_id, slot, "reply slot changed before request was written, rechecking later");
                continue;
            }

            let record = *incoming.slot(slot);
            match decode(&record) {
                Ok(SlotContent::Empty) => {
                    if self.outgoing.slot_state(slot) == SlotState::Acknowledged {
                        self.outgoing.clear_slot(slot);
                        self.dirty = true;
                        tracing::trace!(host_id, slot, "slot released");
                    }
                }
                Ok(SlotContent::Acknowledged) => {
                    tracing::warn!(host_id, slot, "acknowledged sentinel in reply slot, ignoring");
                }
                Ok(SlotContent::Message(reply)) => {
                    let matches = self.pending.get(&slot).map(|pending| {
                        pending.state == RequestState::AwaitingReply && pending.message.answered_by(&record)
                    });
                    match matches {
                        Some(true) => {
                            if let Some(mut pending) = self.pending.remove(&slot) {
                                pending.state = RequestState::Completed;
                                if let Some(callback) = pending.take_callback() {
                                    let result = ExtendReply::from_reply(&reply);
                                    completed.push(Box::new(move || callback(result)));
                                }
                            }
                            self.outgoing.acknowledge_slot(slot);
                            self.dirty = true;
                            tracing::debug!(host_id, slot, size = reply.size, "reply received");
                        }
                        Some(false) => {
                            tracing::warn!(host_id, slot, "reply does not answer the pending request, discarding");
                        }
                        None => {
                            tracing::warn!(host_id, slot, "reply without pending request, discarding");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(host_id, slot, error = %e, "undecodable reply ignored");
                }
            }
        }

        self.replies = incoming;
    }

    /// Write the outgoing image. Pending requests that were only in memory are
    /// now on storage.
    fn flush(&mut self, channel: &dyn SharedChannel) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let host_id = self.outgoing.host_id();
        let image = self.outgoing.prepare_for_write();
        channel.write_mailbox(Area::Requests, host_id, image)?;
        self.dirty = false;
        for pending in self.pending.values_mut() {
            if pending.state == RequestState::Sent {
                pending.state = RequestState::AwaitingReply;
            }
        }
        Ok(())
    }
}

pub(crate) struct RequesterInner {
    pub(crate) host_id: usize,
    pub(crate) channel: Arc<dyn SharedChannel>,
    pub(crate) config: MailboxConfig,
    pub(crate) state: Mutex<RequesterState>,
    pub(crate) callbacks: WorkerPool,
    /// Callbacks the pool had no room for, in completion order.
    pub(crate) backlog: Mutex<VecDeque<Job>>,
}

impl RequesterInner {
    fn tick(&self) -> Result<()> {
        let read = self.channel.read_mailbox(Area::Replies, self.host_id);

        let mut completed = Vec::new();
        let (read, flushed) = {
            let mut state = self.state.lock();
            let read = read.map(|bytes| {
                let incoming = Mailbox::from_bytes(self.host_id, bytes);
                match incoming.verify() {
                    Ok(()) => state.absorb(incoming, &mut completed),
                    Err(e) => tracing::warn!(error = %e, "ignoring reply mailbox, retrying next tick"),
                }
            });
            (read, state.flush(&*self.channel))
        };

        self.deliver(completed);

        read?;
        flushed
    }

    /// Hand callbacks to the pool in order. Whatever a busy pool cannot take
    /// stays in the backlog for the next tick. Only a closed pool makes the
    /// caller run them itself, and the polling thread is gone by then.
    fn deliver(&self, fresh: Vec<Job>) {
        let mut closed = Vec::new();
        {
            let mut backlog = self.backlog.lock();
            backlog.extend(fresh);
            while let Some(job) = backlog.pop_front() {
                match self.callbacks.offer(job) {
                    Ok(()) => {}
                    Err((MailboxError::PoolBusy, job)) => {
                        backlog.push_front(job);
                        tracing::debug!(host_id = self.host_id, waiting = backlog.len(), "callback pool busy, deferring");
                        break;
                    }
                    Err((_, job)) => closed.push(job),
                }
            }
        }

        for job in closed {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::error!(host_id = self.host_id, "reply callback panicked");
            }
        }
    }

    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }
}

/// Host-side end of the mailbox.
///
/// Requests are multiplexed into the 63 slots of this host's request mailbox;
/// callbacks run on a small dedicated pool once the coordinator's reply shows
/// up in the matching slot of the reply mailbox.
pub struct Requester {
    pub(crate) inner: Arc<RequesterInner>,
    ticker: Mutex<Option<Ticker>>,
}

impl Requester {
    pub(crate) fn new(host_id: usize, channel: Arc<dyn SharedChannel>, config: MailboxConfig) -> Result<Self> {
        let callbacks = WorkerPool::new(
            &format!("mailbox-cb-{host_id}"),
            config.callback_workers,
            config.pool_queue_depth.max(MESSAGES_PER_MAILBOX),
        )?;
        Ok(Self {
            inner: Arc::new(RequesterInner {
                host_id,
                channel,
                config,
                state: Mutex::new(RequesterState::new(host_id)),
                callbacks,
                backlog: Mutex::new(VecDeque::new()),
            }),
            ticker: Mutex::new(None),
        })
    }

    /// Start the polling thread. Before the first tick the current reply
    /// mailbox is read so replies left over from an earlier run are not
    /// mistaken for fresh ones.
    pub fn start(&self) -> Result<()> {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return Err(MailboxError::AlreadyRunning);
        }

        self.prime();

        let inner = Arc::clone(&self.inner);
        *ticker = Some(Ticker::spawn(
            &format!("mailbox-hsm-{}", self.inner.host_id),
            &self.inner.config,
            move || inner.tick(),
        )?);
        Ok(())
    }

    fn prime(&self) {
        let host_id = self.inner.host_id;
        match self.inner.channel.read_mailbox(Area::Replies, host_id) {
            Ok(bytes) => {
                let replies = Mailbox::from_bytes(host_id, bytes);
                if replies.validate() {
                    self.inner.state.lock().replies = replies;
                } else {
                    tracing::warn!(host_id, "reply mailbox checksum mismatch at start");
                }
            }
            Err(e) => tracing::warn!(host_id, error = %e, "cannot read reply mailbox at start"),
        }
    }

    /// One polling cycle: read replies, acknowledge, write, then hand
    /// finished callbacks to the callback pool.
    ///
    /// The monitor thread calls this on its own; it is public so a caller can
    /// drive the protocol by hand.
    pub fn tick(&self) -> Result<()> {
        self.inner.tick()
    }

    fn wake(&self) {
        if let Some(ticker) = self.ticker.lock().as_ref() {
            ticker.wake();
        }
    }

    fn try_enqueue(&self, message: Message, callback: ReplyCallback) -> std::result::Result<usize, (MailboxError, ReplyCallback)> {
        let host_id = self.inner.host_id;
        let slot = {
            let mut state = self.inner.state.lock();
            let Some(slot) = state.free_slot() else {
                return Err((MailboxError::MailboxFull { host_id }, callback));
            };
            let mut pending = PendingRequest::new(slot, message, callback);
            pending.state = RequestState::Sent;
            state.outgoing.set_slot(slot, &message.encode());
            state.pending.insert(slot, pending);
            state.dirty = true;
            slot
        };
        tracing::debug!(host_id, slot, opcode = %message.opcode, size = message.size, "request queued");
        self.wake();
        Ok(slot)
    }

    /// Place `message` in a free slot. Fails with `MailboxFull` when all 63
    /// slots are taken; the callback is then dropped without being called.
    pub fn enqueue<F>(&self, message: Message, callback: F) -> Result<usize>
    where
        F: FnOnce(Result<ExtendReply>) + Send + 'static,
    {
        self.try_enqueue(message, Box::new(callback)).map_err(|(e, _)| e)
    }

    /// Ask the coordinator to extend `volume_id` in `domain_id` to `new_size`
    /// bytes. `callback` runs exactly once: with the reply, or with the error
    /// if the request could not be placed.
    pub fn send_request<F>(&self, domain_id: Uuid, volume_id: Uuid, new_size: u64, callback: F)
    where
        F: FnOnce(Result<ExtendReply>) + Send + 'static,
    {
        let message = Message::extend(domain_id, volume_id, new_size);
        if let Err((e, callback)) = self.try_enqueue(message, Box::new(callback)) {
            tracing::warn!(host_id = self.inner.host_id, error = %e, "extend request rejected");
            let job: Job = Box::new(move || callback(Err(e)));
            self.inner.deliver(vec![job]);
            self.wake();
        }
    }

    /// Stop polling and release every slot by writing an all-zero request
    /// mailbox. Outstanding requests are abandoned without calling back;
    /// callbacks for replies already received still run, those the pool never
    /// picked up on the calling thread.
    pub fn stop(&self) -> Result<()> {
        let ticker = self.ticker.lock().take();
        if let Some(mut ticker) = ticker {
            ticker.stop();
        }
        self.inner.callbacks.shutdown();
        self.inner.deliver(Vec::new());

        let host_id = self.inner.host_id;
        let mut state = self.inner.state.lock();
        if !state.pending.is_empty() {
            tracing::info!(host_id, abandoned = state.pending.len(), "dropping outstanding requests");
            state.pending.clear();
        }
        state.outgoing.reset();
        state.dirty = true;
        state.flush(&*self.inner.channel)
    }
}

impl Drop for Requester {
    fn drop(&mut self) {
        if self.ticker.get_mut().is_some() {
            if let Err(e) = self.stop() {
                tracing::warn!(host_id = self.inner.host_id, error = %e, "failed to reset request mailbox");
            }
        }
    }
}
