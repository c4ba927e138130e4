use std::fs;

use spm_mailbox::Core::{DirectFileChannel, MemoryChannel, SharedChannel, WriteRecord};
use spm_mailbox::Protocol::{Mailbox, Message, MAILBOX_SIZE};
use spm_mailbox::{Area, MailboxError};
use tempfile::TempDir;
use uuid::Uuid;

fn sealed_image(host_id: usize, size: u64) -> [u8; MAILBOX_SIZE] {
    let mut mailbox = Mailbox::new(host_id);
    mailbox.set_slot(0, &Message::extend(Uuid::new_v4(), Uuid::new_v4(), size).encode());
    *mailbox.prepare_for_write()
}

fn create_channel(dir: &TempDir, hosts: usize) -> DirectFileChannel {
    DirectFileChannel::create(&dir.path().join("inbox"), &dir.path().join("outbox"), hosts)
        .expect("create region files")
}

#[test]
fn test_create_sizes_both_regions() {
    let dir = TempDir::new().unwrap();
    let channel = create_channel(&dir, 8);
    assert_eq!(channel.capacity(), 8);
    for name in ["inbox", "outbox"] {
        let len = fs::metadata(dir.path().join(name)).unwrap().len();
        assert_eq!(len, 8 * MAILBOX_SIZE as u64);
    }
}

#[test]
fn test_write_touches_only_own_range() {
    let dir = TempDir::new().unwrap();
    let channel = create_channel(&dir, 4);
    let image = sealed_image(2, 4096);

    channel.write_mailbox(Area::Requests, 2, &image).unwrap();

    let raw = fs::read(dir.path().join("inbox")).unwrap();
    let start = 2 * MAILBOX_SIZE;
    assert_eq!(&raw[start..start + MAILBOX_SIZE], &image[..]);
    assert!(raw[..start].iter().all(|&b| b == 0));
    assert!(raw[start + MAILBOX_SIZE..].iter().all(|&b| b == 0));

    // The other area is untouched.
    let replies = fs::read(dir.path().join("outbox")).unwrap();
    assert!(replies.iter().all(|&b| b == 0));

    let read_back = channel.read_mailbox(Area::Requests, 2).unwrap();
    assert_eq!(&read_back[..], &image[..]);
}

#[test]
fn test_read_mailboxes_returns_contiguous_region() {
    let dir = TempDir::new().unwrap();
    let channel = create_channel(&dir, 3);
    let first = sealed_image(0, 1);
    let last = sealed_image(2, 2);
    channel.write_mailbox(Area::Replies, 0, &first).unwrap();
    channel.write_mailbox(Area::Replies, 2, &last).unwrap();

    let region = channel.read_mailboxes(Area::Replies, 3).unwrap();
    assert_eq!(region.len(), 3 * MAILBOX_SIZE);
    assert_eq!(&region[..MAILBOX_SIZE], &first[..]);
    assert!(region[MAILBOX_SIZE..2 * MAILBOX_SIZE].iter().all(|&b| b == 0));
    assert_eq!(&region[2 * MAILBOX_SIZE..], &last[..]);
}

#[test]
fn test_host_out_of_range() {
    let dir = TempDir::new().unwrap();
    let channel = create_channel(&dir, 2);
    assert!(matches!(
        channel.read_mailbox(Area::Requests, 2),
        Err(MailboxError::HostOutOfRange { host_id: 2, max_hosts: 2 })
    ));
    assert!(matches!(
        channel.write_mailbox(Area::Replies, 5, &[0u8; MAILBOX_SIZE]),
        Err(MailboxError::HostOutOfRange { .. })
    ));
    assert!(channel.read_mailboxes(Area::Requests, 3).is_err());
}

#[test]
fn test_reopen_keeps_contents_and_derives_capacity() {
    let dir = TempDir::new().unwrap();
    let image = sealed_image(1, 77);
    {
        let channel = create_channel(&dir, 2);
        channel.write_mailbox(Area::Requests, 1, &image).unwrap();
    }
    // Growing keeps what was already there.
    let channel = create_channel(&dir, 5);
    assert_eq!(channel.capacity(), 5);
    assert_eq!(&channel.read_mailbox(Area::Requests, 1).unwrap()[..], &image[..]);

    let reopened = DirectFileChannel::open(&dir.path().join("inbox"), &dir.path().join("outbox")).unwrap();
    assert_eq!(reopened.capacity(), 5);
}

#[test]
fn test_truncated_region_is_a_transport_error() {
    let dir = TempDir::new().unwrap();
    let channel = create_channel(&dir, 2);
    // Another party shrinks the file under us.
    fs::OpenOptions::new()
        .write(true)
        .open(dir.path().join("outbox"))
        .unwrap()
        .set_len(MAILBOX_SIZE as u64)
        .unwrap();

    let err = channel.read_mailbox(Area::Replies, 1).unwrap_err();
    assert!(err.is_transport(), "unexpected error {err}");
}

#[test]
fn test_open_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    let err = DirectFileChannel::open(&dir.path().join("nope"), &dir.path().join("nada")).unwrap_err();
    assert!(matches!(err, MailboxError::Io { area: Area::Requests, .. }));
}

#[test]
fn test_memory_channel_logs_writes() {
    let channel = MemoryChannel::new(4);
    let image = sealed_image(3, 9);
    channel.write_mailbox(Area::Requests, 3, &image).unwrap();

    assert_eq!(
        channel.writes(),
        vec![WriteRecord {
            area: Area::Requests,
            offset: 3 * MAILBOX_SIZE as u64,
            len: MAILBOX_SIZE
        }]
    );
    assert_eq!(channel.mailbox_bytes(Area::Requests, 3), image.to_vec());

    channel.clear_writes();
    channel.poke(Area::Requests, 0, &[0xff; 8]);
    assert!(channel.writes().is_empty());
}

#[test]
fn test_memory_channel_failure_switch() {
    let channel = MemoryChannel::new(1);
    channel.set_failing(true);
    let err = channel.read_mailbox(Area::Replies, 0).unwrap_err();
    assert!(err.is_transport());
    assert!(channel.write_mailbox(Area::Requests, 0, &[0u8; MAILBOX_SIZE]).is_err());

    channel.set_failing(false);
    assert!(channel.read_mailboxes(Area::Requests, 1).is_ok());
}
