// Error types shared by every layer of the mailbox

use std::fmt;
use std::io;

use thiserror::Error;
use uuid::Uuid;

/// Which of the two shared regions an operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Area {
    /// Written by every host at its own offset, read by the coordinator.
    Requests,
    /// Written by the coordinator at each host's offset, read by that host.
    Replies,
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Area::Requests => f.write_str("requests"),
            Area::Replies => f.write_str("replies"),
        }
    }
}

/// Failures decoding a single 64-byte slot.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unsupported message version {0:#04x}")]
    BadVersion(u8),

    #[error("unknown opcode {0:?}")]
    UnknownOpcode([u8; 4]),

    #[error("malformed size field {0:?}")]
    BadSizeField(String),

    #[error("expected {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("I/O error on {area} area at offset {offset}: {source}")]
    Io {
        area: Area,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("short transfer on {area} area at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        area: Area,
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("host {host_id} is outside the mailbox table ({max_hosts} hosts)")]
    HostOutOfRange { host_id: usize, max_hosts: usize },

    #[error("checksum mismatch in mailbox of host {host_id}")]
    ChecksumMismatch { host_id: usize },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no free slot in mailbox of host {host_id}")]
    MailboxFull { host_id: usize },

    #[error("operation failed for volume {volume_id} in domain {domain_id}")]
    OperationFailed { domain_id: Uuid, volume_id: Uuid },

    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("worker pool queue is full")]
    PoolBusy,

    #[error("worker pool is shut down")]
    PoolClosed,

    #[error("monitor is already running")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MailboxError {
    /// Transport-level failures, the ones that trigger polling backoff.
    pub fn is_transport(&self) -> bool {
        matches!(self, MailboxError::Io { .. } | MailboxError::ShortTransfer { .. })
    }
}

pub type Result<T> = std::result::Result<T, MailboxError>;
