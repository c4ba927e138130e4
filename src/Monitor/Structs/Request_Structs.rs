// Plain bookkeeping records used by the two monitors

use uuid::Uuid;

use crate::error::MailboxError;
use crate::Protocol::layout::MESSAGE_SIZE;
use crate::Protocol::Codec::Message;

/// What the caller gets back once a reply arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendReply {
    pub domain_id: Uuid,
    pub volume_id: Uuid,
    /// Size reported by the coordinator after the operation.
    pub new_size: u64,
}

impl ExtendReply {
    /// Turn a reply record into the caller-facing result. A zero size is the
    /// wire's only way of saying the operation failed.
    pub fn from_reply(reply: &Message) -> Result<Self, MailboxError> {
        if reply.is_failure() {
            return Err(MailboxError::OperationFailed {
                domain_id: reply.domain_id,
                volume_id: reply.volume_id,
            });
        }
        Ok(Self {
            domain_id: reply.domain_id,
            volume_id: reply.volume_id,
            new_size: reply.size,
        })
    }
}

pub type ReplyCallback = Box<dyn FnOnce(Result<ExtendReply, MailboxError>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Built but not yet placed in a slot.
    Queued,
    /// In the outgoing image, not yet written to storage.
    Sent,
    /// Written to storage; waiting for the coordinator.
    AwaitingReply,
    /// Reply seen and callback dispatched.
    Completed,
}

/// An outstanding request on the host side.
pub struct PendingRequest {
    pub slot: usize,
    pub message: Message,
    pub state: RequestState,
    pub(crate) callback: Option<ReplyCallback>,
}

impl PendingRequest {
    pub fn new(slot: usize, message: Message, callback: ReplyCallback) -> Self {
        Self {
            slot,
            message,
            state: RequestState::Queued,
            callback: Some(callback),
        }
    }

    pub(crate) fn take_callback(&mut self) -> Option<ReplyCallback> {
        self.callback.take()
    }
}

/// A request picked up by the coordinator, handed to the worker pool.
#[derive(Debug, Clone, Copy)]
pub struct WorkItem {
    pub host_id: usize,
    pub slot: usize,
    pub message: Message,
    /// Exact bytes the request was decoded from; the reply is only written if
    /// the slot still holds them when the work finishes.
    pub raw: [u8; MESSAGE_SIZE],
}
