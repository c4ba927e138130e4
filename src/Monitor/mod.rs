mod builder;
mod debug;
mod dispatcher;
mod getters;
mod handlers;
mod requester;
mod ticker;

pub use builder::{MailboxBuilder, MailboxConfig};
pub use dispatcher::{DispatchStats, Dispatcher};
pub use handlers::{Handler, HandlerError, HandlerTable, VolumeExtender};
pub use requester::Requester;

pub mod Structs {
    pub mod Request_Structs;
    pub use Request_Structs::{ExtendReply, PendingRequest, ReplyCallback, RequestState, WorkItem}; // re-export for stable path
}
