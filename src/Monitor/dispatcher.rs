// Coordinator-side monitor: scans every host's request mailbox, runs new
// requests on the worker pool and writes replies into the hosts' reply mailboxes

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use super::builder::MailboxConfig;
use super::handlers::{Handler, HandlerTable};
use super::ticker::Ticker;
use super::Structs::Request_Structs::WorkItem;
use crate::error::{Area, MailboxError, Result};
use crate::Core::pool::WorkerPool;
use crate::Core::SharedStorage::SharedChannel;
use crate::Protocol::layout::MAILBOX_SIZE;
use crate::Protocol::Codec::{decode, Message, SlotContent};
use crate::Protocol::SlotTable::{Mailbox, SlotState};

/// Counters exposed for monitoring and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Requests handed to the pool.
    pub submitted: u64,
    /// Replies written with a resulting size.
    pub succeeded: u64,
    /// Replies written with the failure marker.
    pub failed: u64,
    /// Finished work whose slot had changed in the meantime.
    pub discarded: u64,
    /// Host mailboxes skipped because their checksum did not match.
    pub checksum_skips: u64,
}

pub(crate) struct DispatchState {
    /// Last accepted contents of every host's request mailbox.
    pub(crate) inbox: Vec<Mailbox>,
    /// Reply mailboxes as the coordinator wants hosts to see them.
    pub(crate) outbox: Vec<Mailbox>,
    /// Hosts whose reply mailbox must be written.
    pub(crate) dirty: BTreeSet<usize>,
    pub(crate) stats: DispatchStats,
}

impl DispatchState {
    fn new(hosts: usize) -> Self {
        Self {
            inbox: (0..hosts).map(Mailbox::new).collect(),
            outbox: (0..hosts).map(Mailbox::new).collect(),
            // Clean start: every reply mailbox is rewritten empty.
            dirty: (0..hosts).collect(),
            stats: DispatchStats::default(),
        }
    }

    pub(crate) fn hosts(&self) -> usize {
        self.inbox.len()
    }

    fn grow(&mut self, hosts: usize) {
        for host_id in self.hosts()..hosts {
            self.inbox.push(Mailbox::new(host_id));
            self.outbox.push(Mailbox::new(host_id));
            self.dirty.insert(host_id);
        }
    }

    fn clear_reply(&mut self, host_id: usize, slot: usize) {
        if self.outbox[host_id].slot_state(slot) != SlotState::Empty {
            self.outbox[host_id].clear_slot(slot);
            self.dirty.insert(host_id);
        }
    }

    /// Compare one host's freshly read mailbox with the accepted snapshot.
    /// Slots holding new requests are returned as work; the snapshot for
    /// those slots is only advanced once the work is accepted by the pool.
    fn scan_host(&mut self, host_id: usize, bytes: &[u8], handlers: &HandlerTable, work: &mut Vec<(WorkItem, Handler)>) -> Result<()> {
        let incoming = Mailbox::from_slice(host_id, bytes)?;

        if incoming.looks_empty() {
            if !self.inbox[host_id].looks_empty() {
                tracing::debug!(host_id, "request mailbox emptied");
            }
            self.inbox[host_id].reset();
            if self.outbox[host_id].occupied() > 0 {
                self.outbox[host_id].reset();
                self.dirty.insert(host_id);
            }
            return Ok(());
        }

        if let Err(e) = incoming.verify() {
            self.stats.checksum_skips += 1;
            tracing::warn!(error = %e, "skipping request mailbox this tick");
            return Ok(());
        }

        let changed: Vec<usize> = incoming.changed_slots(&self.inbox[host_id]).collect();
        for slot in changed {
            let record = *incoming.slot(slot);
            match decode(&record) {
                Ok(SlotContent::Empty) => {
                    self.inbox[host_id].set_slot(slot, &record);
                    self.clear_reply(host_id, slot);
                }
                Ok(SlotContent::Acknowledged) => {
                    self.inbox[host_id].set_slot(slot, &record);
                    self.clear_reply(host_id, slot);
                    tracing::trace!(host_id, slot, "reply acknowledged");
                }
                Ok(SlotContent::Message(message)) => match handlers.get(message.opcode) {
                    Some(handler) => work.push((
                        WorkItem {
                            host_id,
                            slot,
                            message,
                            raw: record,
                        },
                        handler,
                    )),
                    None => {
                        self.inbox[host_id].set_slot(slot, &record);
                        tracing::warn!(host_id, slot, opcode = %message.opcode, "no handler for opcode, ignoring request");
                    }
                },
                Err(e) => {
                    self.inbox[host_id].set_slot(slot, &record);
                    tracing::warn!(host_id, slot, error = %e, "undecodable request ignored");
                }
            }
        }
        Ok(())
    }

    /// Write every dirty reply mailbox. Stops at the first failure; the hosts
    /// not yet written stay dirty for the next attempt.
    fn flush(&mut self, channel: &dyn SharedChannel) -> Result<()> {
        while let Some(&host_id) = self.dirty.iter().next() {
            let image = self.outbox[host_id].prepare_for_write();
            channel.write_mailbox(Area::Replies, host_id, image)?;
            self.dirty.remove(&host_id);
        }
        Ok(())
    }
}

/// The part of the dispatcher that pool jobs hold on to.
pub(crate) struct DispatchCore {
    pub(crate) channel: Arc<dyn SharedChannel>,
    pub(crate) state: Mutex<DispatchState>,
}

impl DispatchCore {
    /// Record the reply for a finished work item and write it right away.
    fn complete(&self, item: WorkItem, reply: Message) {
        let mut state = self.state.lock();
        let still_current = item.host_id < state.hosts() && state.inbox[item.host_id].slot(item.slot) == &item.raw;
        if !still_current {
            state.stats.discarded += 1;
            tracing::debug!(host_id = item.host_id, slot = item.slot, "request changed while in progress, dropping reply");
            return;
        }

        if reply.is_failure() {
            state.stats.failed += 1;
        } else {
            state.stats.succeeded += 1;
        }
        state.outbox[item.host_id].set_slot(item.slot, &reply.encode());
        state.dirty.insert(item.host_id);
        if let Err(e) = state.flush(&*self.channel) {
            tracing::warn!(host_id = item.host_id, error = %e, "reply write failed, retrying next tick");
        }
    }
}

/// Run the handler, turning errors and panics into a failure reply.
fn process(handler: &Handler, item: &WorkItem) -> Message {
    let message = &item.message;
    match catch_unwind(AssertUnwindSafe(|| handler(message))) {
        Ok(Ok(size)) => {
            tracing::debug!(host_id = item.host_id, slot = item.slot, opcode = %message.opcode, size, "request processed");
            message.reply(size)
        }
        Ok(Err(e)) => {
            tracing::warn!(
                host_id = item.host_id,
                slot = item.slot,
                domain_id = %message.domain_id,
                volume_id = %message.volume_id,
                error = %e,
                "operation failed"
            );
            message.failure_reply()
        }
        Err(_) => {
            tracing::error!(host_id = item.host_id, slot = item.slot, "handler panicked");
            message.failure_reply()
        }
    }
}

pub(crate) struct DispatcherInner {
    pub(crate) core: Arc<DispatchCore>,
    pub(crate) handlers: HandlerTable,
    pub(crate) pool: WorkerPool,
    pub(crate) config: MailboxConfig,
}

impl DispatcherInner {
    fn tick(&self) -> Result<()> {
        let hosts = self.core.state.lock().hosts();
        let read = self.core.channel.read_mailboxes(Area::Requests, hosts);

        let mut state = self.core.state.lock();
        if let Ok(region) = &read {
            let mut work = Vec::new();
            for (host_id, bytes) in region.chunks_exact(MAILBOX_SIZE).enumerate().take(state.hosts()) {
                state.scan_host(host_id, bytes, &self.handlers, &mut work)?;
            }
            for (item, handler) in work {
                self.submit(&mut state, item, handler);
            }
        }
        let flushed = state.flush(&*self.core.channel);
        drop(state);

        read?;
        flushed
    }

    /// Hand a request to the pool. The job cannot observe the state before
    /// the tick releases the lock, by which time the snapshot is updated.
    fn submit(&self, state: &mut DispatchState, item: WorkItem, handler: Handler) {
        let core = Arc::clone(&self.core);
        let job = move || {
            let reply = process(&handler, &item);
            core.complete(item, reply);
        };
        match self.pool.try_submit(job) {
            Ok(()) => {
                state.inbox[item.host_id].set_slot(item.slot, &item.raw);
                state.stats.submitted += 1;
            }
            Err(MailboxError::PoolBusy) => {
                tracing::debug!(host_id = item.host_id, slot = item.slot, "worker pool busy, request deferred");
            }
            Err(e) => {
                tracing::warn!(host_id = item.host_id, slot = item.slot, error = %e, "cannot submit request");
            }
        }
    }
}

/// Coordinator end of the mailbox. Only one may run per storage pool; the
/// lease guaranteeing that lives outside this crate.
pub struct Dispatcher {
    pub(crate) inner: Arc<DispatcherInner>,
    ticker: Mutex<Option<Ticker>>,
}

impl Dispatcher {
    pub(crate) fn new(channel: Arc<dyn SharedChannel>, handlers: HandlerTable, config: MailboxConfig) -> Result<Self> {
        let pool = WorkerPool::with_fraction(
            "mailbox-spm",
            config.task_capacity,
            config.pool_fraction,
            config.pool_queue_depth,
        )?;
        let state = DispatchState::new(config.max_hosts);
        Ok(Self {
            inner: Arc::new(DispatcherInner {
                core: Arc::new(DispatchCore {
                    channel,
                    state: Mutex::new(state),
                }),
                handlers,
                pool,
                config,
            }),
            ticker: Mutex::new(None),
        })
    }

    pub fn start(&self) -> Result<()> {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return Err(MailboxError::AlreadyRunning);
        }
        let inner = Arc::clone(&self.inner);
        *ticker = Some(Ticker::spawn("mailbox-spm", &self.inner.config, move || inner.tick())?);
        Ok(())
    }

    /// One polling cycle: read all request mailboxes, submit new work,
    /// clear acknowledged replies, write changed reply mailboxes.
    pub fn tick(&self) -> Result<()> {
        self.inner.tick()
    }

    /// Scan `hosts` mailboxes from now on. The table only grows.
    pub fn set_max_hosts(&self, hosts: usize) -> Result<()> {
        let capacity = self.inner.core.channel.capacity();
        if hosts > capacity {
            return Err(MailboxError::HostOutOfRange {
                host_id: hosts - 1,
                max_hosts: capacity,
            });
        }
        let mut state = self.inner.core.state.lock();
        if hosts > state.hosts() {
            tracing::info!(from = state.hosts(), to = hosts, "growing host table");
            state.grow(hosts);
        }
        Ok(())
    }

    /// Stop polling, let in-flight work finish and write its replies.
    /// A stopped dispatcher cannot be started again.
    pub fn stop(&self) -> Result<()> {
        let ticker = self.ticker.lock().take();
        if let Some(mut ticker) = ticker {
            ticker.stop();
        }
        self.inner.pool.shutdown();
        let mut state = self.inner.core.state.lock();
        state.flush(&*self.inner.core.channel)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.ticker.get_mut().is_some() {
            if let Err(e) = self.stop() {
                tracing::warn!(error = %e, "failed to flush replies on shutdown");
            }
        }
    }
}
