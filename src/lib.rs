//! Request/reply mailbox between the hosts of a storage pool and its elected
//! storage pool manager, carried over two shared block-storage regions.

// Module naming follows project convention (capitalised groups)
#[allow(non_snake_case)]
pub mod Core;
#[allow(non_snake_case)]
pub mod Protocol;
#[allow(non_snake_case)]
pub mod Monitor;
#[allow(non_snake_case)]
mod Debug;
pub mod error;

pub use error::{Area, MailboxError, ProtocolError};
pub use Monitor::{Dispatcher, HandlerTable, MailboxBuilder, MailboxConfig, Requester, VolumeExtender};
