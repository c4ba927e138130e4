//! Opcode dispatch on the coordinator side.
//!
//! Each opcode maps to a handler that performs the real storage operation and
//! returns the size to report back. The only storage contract the mailbox has
//! is [`VolumeExtender`].

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::Protocol::Codec::{Message, Opcode};

pub type HandlerError = Box<dyn Error + Send + Sync + 'static>;

/// Handler for one opcode. Returns the resulting size on success.
pub type Handler = Arc<dyn Fn(&Message) -> Result<u64, HandlerError> + Send + Sync + 'static>;

/// Storage layer operation invoked for extend requests.
pub trait VolumeExtender: Send + Sync {
    /// Grow `volume_id` in `domain_id` to at least `new_size` bytes and return
    /// the size it ended up with.
    fn extend_volume(&self, domain_id: Uuid, volume_id: Uuid, new_size: u64) -> Result<u64, HandlerError>;
}

impl<F> VolumeExtender for F
where
    F: Fn(Uuid, Uuid, u64) -> Result<u64, HandlerError> + Send + Sync,
{
    fn extend_volume(&self, domain_id: Uuid, volume_id: Uuid, new_size: u64) -> Result<u64, HandlerError> {
        self(domain_id, volume_id, new_size)
    }
}

#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<Opcode, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the extend handler wired to `extender`.
    pub fn with_extender(extender: Arc<dyn VolumeExtender>) -> Self {
        let mut table = Self::new();
        table.register(
            Opcode::Extend,
            Arc::new(move |msg: &Message| {
                extender.extend_volume(msg.domain_id, msg.volume_id, msg.size)
            }),
        );
        table
    }

    /// Install or replace the handler for `opcode`.
    pub fn register(&mut self, opcode: Opcode, handler: Handler) -> &mut Self {
        self.handlers.insert(opcode, handler);
        self
    }

    pub fn get(&self, opcode: Opcode) -> Option<Handler> {
        self.handlers.get(&opcode).cloned()
    }

    pub fn opcodes(&self) -> impl Iterator<Item = Opcode> + '_ {
        self.handlers.keys().copied()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
