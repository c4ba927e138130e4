// Transport over the two shared regions (requests and replies)
// Uses positioned reads/writes with O_DIRECT so the page cache never hides
// another host's latest write

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(target_os = "linux")]
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use crate::error::{Area, MailboxError, Result};
use crate::Protocol::layout::{mailbox_offset, MAILBOX_SIZE};

/// Alignment required for O_DIRECT buffers, offsets and lengths.
pub const DIRECT_IO_ALIGN: usize = 4096;

/// Byte-addressable shared storage holding every host's mailboxes.
///
/// Implementations must transfer whole mailboxes; a partial read or write is
/// an error, never a success.
pub trait SharedChannel: Send + Sync + Debug {
    /// Read `host_id`'s mailbox from `area`.
    fn read_mailbox(&self, area: Area, host_id: usize) -> Result<Box<[u8; MAILBOX_SIZE]>>;

    /// Write `host_id`'s mailbox into `area`. Touches exactly
    /// `[host_id * MAILBOX_SIZE, (host_id + 1) * MAILBOX_SIZE)`.
    fn write_mailbox(&self, area: Area, host_id: usize, data: &[u8; MAILBOX_SIZE]) -> Result<()>;

    /// Read the mailboxes of hosts `0..hosts` from `area` in a single transfer.
    fn read_mailboxes(&self, area: Area, hosts: usize) -> Result<Vec<u8>>;

    /// Number of host mailboxes each area can hold.
    fn capacity(&self) -> usize;
}

fn check_host(host_id: usize, capacity: usize) -> Result<()> {
    if host_id >= capacity {
        return Err(MailboxError::HostOutOfRange {
            host_id,
            max_hosts: capacity,
        });
    }
    Ok(())
}

/// Heap buffer aligned for direct I/O.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The buffer is uniquely owned; it is just bytes.
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    pub fn zeroed(len: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(len.max(DIRECT_IO_ALIGN), DIRECT_IO_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "aligned allocation failed")
        })?;
        Ok(Self { ptr, layout })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// One pre-allocated region file.
#[derive(Debug)]
struct RegionFile {
    area: Area,
    path: PathBuf,
    file: File,
    /// False when the filesystem refused O_DIRECT and we fell back to
    /// buffered I/O with explicit cache eviction.
    direct: bool,
}

impl RegionFile {
    fn open(area: Area, path: &Path, create: bool) -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        {
            match Self::options(create).custom_flags(libc::O_DIRECT).open(path) {
                Ok(file) => {
                    return Ok(Self {
                        area,
                        path: path.to_path_buf(),
                        file,
                        direct: true,
                    })
                }
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                    tracing::info!(
                        path = %path.display(),
                        %area,
                        "filesystem rejects O_DIRECT, using buffered I/O with cache eviction"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let file = Self::options(create).open(path)?;
        Ok(Self {
            area,
            path: path.to_path_buf(),
            file,
            direct: false,
        })
    }

    fn options(create: bool) -> OpenOptions {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(create);
        options
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Drop cached pages for a range so the next read goes to storage.
    #[cfg(target_os = "linux")]
    fn evict(&self, offset: u64, len: usize) {
        if self.direct {
            return;
        }
        let rc = unsafe {
            libc::posix_fadvise(
                self.file.as_raw_fd(),
                offset as libc::off_t,
                len as libc::off_t,
                libc::POSIX_FADV_DONTNEED,
            )
        };
        if rc != 0 {
            tracing::debug!(rc, offset, "posix_fadvise(DONTNEED) failed");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn evict(&self, _offset: u64, _len: usize) {}

    fn read_exact_at(&self, offset: u64, len: usize) -> Result<AlignedBuffer> {
        let io_err = |source| MailboxError::Io {
            area: self.area,
            offset,
            source,
        };
        let mut buffer = AlignedBuffer::zeroed(len).map_err(io_err)?;
        self.evict(offset, len);
        let read = self
            .file
            .read_at(&mut buffer.as_mut_slice()[..len], offset)
            .map_err(io_err)?;
        if read != len {
            return Err(MailboxError::ShortTransfer {
                area: self.area,
                offset,
                expected: len,
                actual: read,
            });
        }
        Ok(buffer)
    }

    fn write_exact_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let io_err = |source| MailboxError::Io {
            area: self.area,
            offset,
            source,
        };
        let mut buffer = AlignedBuffer::zeroed(data.len()).map_err(io_err)?;
        buffer.as_mut_slice()[..data.len()].copy_from_slice(data);
        let written = self
            .file
            .write_at(&buffer.as_slice()[..data.len()], offset)
            .map_err(io_err)?;
        if written != data.len() {
            return Err(MailboxError::ShortTransfer {
                area: self.area,
                offset,
                expected: data.len(),
                actual: written,
            });
        }
        if !self.direct {
            self.file.sync_data().map_err(io_err)?;
        }
        Ok(())
    }
}

/// Channel backed by two fixed-size files on shared storage.
#[derive(Debug)]
pub struct DirectFileChannel {
    requests: RegionFile,
    replies: RegionFile,
    capacity: usize,
}

impl DirectFileChannel {
    /// Create (or grow) both region files so each holds `max_hosts` mailboxes.
    /// Existing contents are preserved.
    pub fn create(requests: &Path, replies: &Path, max_hosts: usize) -> Result<Self> {
        let wanted = mailbox_offset(max_hosts);
        for (area, path) in [(Area::Requests, requests), (Area::Replies, replies)] {
            let region = RegionFile::open(area, path, true).map_err(|source| MailboxError::Io {
                area,
                offset: 0,
                source,
            })?;
            let len = region.len().map_err(|source| MailboxError::Io {
                area,
                offset: 0,
                source,
            })?;
            if len < wanted {
                region
                    .file
                    .set_len(wanted)
                    .map_err(|source| MailboxError::Io {
                        area,
                        offset: len,
                        source,
                    })?;
            }
        }
        Self::open(requests, replies)
    }

    /// Open existing region files. The host capacity is derived from the
    /// smaller of the two files.
    pub fn open(requests: &Path, replies: &Path) -> Result<Self> {
        let open = |area, path: &Path| -> Result<(RegionFile, u64)> {
            let region = RegionFile::open(area, path, false).map_err(|source| MailboxError::Io {
                area,
                offset: 0,
                source,
            })?;
            let len = region.len().map_err(|source| MailboxError::Io {
                area,
                offset: 0,
                source,
            })?;
            Ok((region, len))
        };
        let (requests, requests_len) = open(Area::Requests, requests)?;
        let (replies, replies_len) = open(Area::Replies, replies)?;
        let capacity = (requests_len.min(replies_len) / MAILBOX_SIZE as u64) as usize;

        tracing::debug!(
            requests = %requests.path.display(),
            replies = %replies.path.display(),
            capacity,
            direct = requests.direct && replies.direct,
            "opened mailbox regions"
        );

        Ok(Self {
            requests,
            replies,
            capacity,
        })
    }

    /// Whether both regions are using O_DIRECT.
    pub fn is_direct(&self) -> bool {
        self.requests.direct && self.replies.direct
    }

    fn region(&self, area: Area) -> &RegionFile {
        match area {
            Area::Requests => &self.requests,
            Area::Replies => &self.replies,
        }
    }
}

impl SharedChannel for DirectFileChannel {
    fn read_mailbox(&self, area: Area, host_id: usize) -> Result<Box<[u8; MAILBOX_SIZE]>> {
        check_host(host_id, self.capacity)?;
        let buffer = self
            .region(area)
            .read_exact_at(mailbox_offset(host_id), MAILBOX_SIZE)?;
        let mut out = Box::new([0u8; MAILBOX_SIZE]);
        out.copy_from_slice(&buffer.as_slice()[..MAILBOX_SIZE]);
        Ok(out)
    }

    fn write_mailbox(&self, area: Area, host_id: usize, data: &[u8; MAILBOX_SIZE]) -> Result<()> {
        check_host(host_id, self.capacity)?;
        self.region(area)
            .write_exact_at(mailbox_offset(host_id), data)
    }

    fn read_mailboxes(&self, area: Area, hosts: usize) -> Result<Vec<u8>> {
        if hosts > self.capacity {
            return Err(MailboxError::HostOutOfRange {
                host_id: hosts.saturating_sub(1),
                max_hosts: self.capacity,
            });
        }
        let len = hosts * MAILBOX_SIZE;
        if len == 0 {
            return Ok(Vec::new());
        }
        let buffer = self.region(area).read_exact_at(0, len)?;
        Ok(buffer.as_slice()[..len].to_vec())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
