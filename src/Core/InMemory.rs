// In-process stand-in for shared storage

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::SharedStorage::SharedChannel;
use crate::error::{Area, MailboxError, Result};
use crate::Protocol::layout::{mailbox_offset, MAILBOX_SIZE};

/// A write as seen by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub area: Area,
    pub offset: u64,
    pub len: usize,
}

/// Both regions held in memory. Every write is logged so tests can check
/// which byte ranges each host touched. Reads are counted, and transport
/// failures can be switched on and off.
#[derive(Debug)]
pub struct MemoryChannel {
    requests: Mutex<Vec<u8>>,
    replies: Mutex<Vec<u8>>,
    capacity: usize,
    writes: Mutex<Vec<WriteRecord>>,
    failing: AtomicBool,
    reads: AtomicUsize,
}

impl MemoryChannel {
    pub fn new(max_hosts: usize) -> Self {
        Self {
            requests: Mutex::new(vec![0; max_hosts * MAILBOX_SIZE]),
            replies: Mutex::new(vec![0; max_hosts * MAILBOX_SIZE]),
            capacity: max_hosts,
            writes: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        }
    }

    fn region(&self, area: Area) -> &Mutex<Vec<u8>> {
        match area {
            Area::Requests => &self.requests,
            Area::Replies => &self.replies,
        }
    }

    fn check_failing(&self, area: Area, offset: u64) -> Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(MailboxError::Io {
                area,
                offset,
                source: std::io::Error::new(std::io::ErrorKind::Other, "storage unreachable"),
            });
        }
        Ok(())
    }

    /// Make every subsequent transfer fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Overwrite raw bytes without going through the mailbox API and without
    /// logging, e.g. to simulate a torn write.
    pub fn poke(&self, area: Area, offset: usize, bytes: &[u8]) {
        let mut region = self.region(area).lock();
        region[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Copy of a whole region.
    pub fn snapshot(&self, area: Area) -> Vec<u8> {
        self.region(area).lock().clone()
    }

    /// Copy of one host's mailbox.
    pub fn mailbox_bytes(&self, area: Area, host_id: usize) -> Vec<u8> {
        let start = mailbox_offset(host_id) as usize;
        self.region(area).lock()[start..start + MAILBOX_SIZE].to_vec()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    /// Read transfers attempted so far, failed ones included.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }
}

impl SharedChannel for MemoryChannel {
    fn read_mailbox(&self, area: Area, host_id: usize) -> Result<Box<[u8; MAILBOX_SIZE]>> {
        if host_id >= self.capacity {
            return Err(MailboxError::HostOutOfRange {
                host_id,
                max_hosts: self.capacity,
            });
        }
        let offset = mailbox_offset(host_id);
        self.reads.fetch_add(1, Ordering::AcqRel);
        self.check_failing(area, offset)?;
        let start = offset as usize;
        let mut out = Box::new([0u8; MAILBOX_SIZE]);
        out.copy_from_slice(&self.region(area).lock()[start..start + MAILBOX_SIZE]);
        Ok(out)
    }

    fn write_mailbox(&self, area: Area, host_id: usize, data: &[u8; MAILBOX_SIZE]) -> Result<()> {
        if host_id >= self.capacity {
            return Err(MailboxError::HostOutOfRange {
                host_id,
                max_hosts: self.capacity,
            });
        }
        let offset = mailbox_offset(host_id);
        self.check_failing(area, offset)?;
        let start = offset as usize;
        self.region(area).lock()[start..start + MAILBOX_SIZE].copy_from_slice(data);
        self.writes.lock().push(WriteRecord {
            area,
            offset,
            len: MAILBOX_SIZE,
        });
        Ok(())
    }

    fn read_mailboxes(&self, area: Area, hosts: usize) -> Result<Vec<u8>> {
        if hosts > self.capacity {
            return Err(MailboxError::HostOutOfRange {
                host_id: hosts.saturating_sub(1),
                max_hosts: self.capacity,
            });
        }
        self.reads.fetch_add(1, Ordering::AcqRel);
        self.check_failing(area, 0)?;
        Ok(self.region(area).lock()[..hosts * MAILBOX_SIZE].to_vec())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
