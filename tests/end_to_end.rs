// Requester and dispatcher talking over one in-memory channel.
// Most tests drive both sides by hand, tick by tick, so every step of the
// slot handshake can be observed.
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use spm_mailbox::Core::{MemoryChannel, SharedChannel};
use spm_mailbox::Monitor::Structs::ExtendReply;
use spm_mailbox::Monitor::{Dispatcher, HandlerError, HandlerTable, MailboxBuilder, Requester, VolumeExtender};
use spm_mailbox::Protocol::{Mailbox, Message, Opcode, SlotState, MESSAGES_PER_MAILBOX};
use spm_mailbox::{Area, MailboxError};
use uuid::Uuid;

type Outcome = Result<ExtendReply, MailboxError>;

const HOSTS: usize = 4;
const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

/// Storage stand-in: grows volumes by 1 GiB past the requested size, fails
/// for volumes it was told to refuse, and can hold every call on a gate.
#[derive(Default)]
struct FakeStorage {
    calls: Mutex<HashMap<Uuid, usize>>,
    refuse: Mutex<Vec<Uuid>>,
    gate: Mutex<Option<Receiver<()>>>,
    delay: Option<Duration>,
}

impl FakeStorage {
    fn calls_for(&self, volume_id: Uuid) -> usize {
        self.calls.lock().get(&volume_id).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

impl VolumeExtender for FakeStorage {
    fn extend_volume(&self, _domain_id: Uuid, volume_id: Uuid, new_size: u64) -> Result<u64, HandlerError> {
        if let Some(gate) = self.gate.lock().as_ref() {
            let _ = gate.recv_timeout(WAIT);
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        *self.calls.lock().entry(volume_id).or_insert(0) += 1;
        if self.refuse.lock().contains(&volume_id) {
            return Err("no space left in domain".into());
        }
        Ok(new_size + (1 << 30))
    }
}

fn builder(channel: &Arc<MemoryChannel>) -> MailboxBuilder {
    MailboxBuilder::new()
        .with_channel(channel.clone())
        .with_max_hosts(HOSTS)
        .with_task_capacity(4)
        .with_pool_fraction(1.0)
}

fn setup(storage: Arc<FakeStorage>) -> (Arc<MemoryChannel>, Dispatcher) {
    let channel = Arc::new(MemoryChannel::new(HOSTS));
    let dispatcher = builder(&channel)
        .build_dispatcher(HandlerTable::with_extender(storage))
        .unwrap();
    (channel, dispatcher)
}

fn extend(requester: &Requester, volume_id: Uuid, size: u64) -> (usize, Receiver<Outcome>) {
    let (tx, rx) = mpsc::channel();
    let slot = requester
        .enqueue(Message::extend(Uuid::nil(), volume_id, size), move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();
    (slot, rx)
}

/// Requester writes, dispatcher serves, requester reads the reply.
fn round(dispatcher: &Dispatcher, requesters: &[&Requester]) {
    for requester in requesters {
        requester.tick().unwrap();
    }
    dispatcher.tick().unwrap();
    assert!(dispatcher.wait_idle(WAIT));
    for requester in requesters {
        requester.tick().unwrap();
    }
}

fn mailbox(channel: &MemoryChannel, area: Area, host_id: usize) -> Mailbox {
    Mailbox::from_slice(host_id, &channel.mailbox_bytes(area, host_id)).unwrap()
}

#[test]
fn test_single_extend_full_handshake() {
    let storage = Arc::new(FakeStorage::default());
    let (channel, dispatcher) = setup(storage.clone());
    let requester = builder(&channel).build_requester(3).unwrap();
    let domain = Uuid::new_v4();
    let volume = Uuid::new_v4();

    let (tx, rx) = mpsc::channel();
    let slot = requester
        .enqueue(Message::extend(domain, volume, 10_000_000), move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();
    round(&dispatcher, &[&requester]);

    let reply = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(reply.domain_id, domain);
    assert_eq!(reply.volume_id, volume);
    assert_eq!(reply.new_size, 10_000_000 + (1 << 30));
    assert_eq!(storage.calls_for(volume), 1);

    assert_eq!(dispatcher.reply_image(3).unwrap().slot_state(slot), SlotState::Active);
    assert_eq!(requester.outgoing_image().slot_state(slot), SlotState::Acknowledged);

    // Requester acknowledged; the coordinator clears its reply.
    assert_eq!(mailbox(&channel, Area::Requests, 3).slot_state(slot), SlotState::Acknowledged);
    dispatcher.tick().unwrap();
    assert_eq!(mailbox(&channel, Area::Replies, 3).slot_state(slot), SlotState::Empty);

    // Requester sees the cleared reply and frees its slot.
    requester.tick().unwrap();
    assert!(mailbox(&channel, Area::Requests, 3).is_pristine());
    assert_eq!(requester.free_slots(), MESSAGES_PER_MAILBOX);

    dispatcher.tick().unwrap();
    assert!(mailbox(&channel, Area::Replies, 3).is_pristine());
    assert_eq!(storage.calls_for(volume), 1);
    assert_eq!(dispatcher.stats().succeeded, 1);
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn test_same_volume_from_two_hosts() {
    let storage = Arc::new(FakeStorage::default());
    let (channel, dispatcher) = setup(storage.clone());
    let first = builder(&channel).build_requester(0).unwrap();
    let second = builder(&channel).build_requester(1).unwrap();
    let volume = Uuid::new_v4();

    let (slot_a, rx_a) = extend(&first, volume, 1 << 30);
    let (slot_b, rx_b) = extend(&second, volume, 1 << 30);
    assert_eq!(slot_a, slot_b);
    round(&dispatcher, &[&first, &second]);

    assert_eq!(rx_a.recv_timeout(WAIT).unwrap().unwrap().new_size, 2 << 30);
    assert_eq!(rx_b.recv_timeout(WAIT).unwrap().unwrap().new_size, 2 << 30);
    assert_eq!(storage.calls_for(volume), 2);
    assert!(rx_a.recv_timeout(QUIET).is_err());
    assert!(rx_b.recv_timeout(QUIET).is_err());

    for write in channel.writes() {
        if write.area == Area::Requests {
            assert!(write.offset == 0 || write.offset == 4096);
        }
        assert_eq!(write.offset % 4096, 0);
    }
}

#[test]
fn test_operation_failure_reaches_caller() {
    let storage = Arc::new(FakeStorage::default());
    let volume = Uuid::new_v4();
    storage.refuse.lock().push(volume);
    let (channel, dispatcher) = setup(storage.clone());
    let requester = builder(&channel).build_requester(0).unwrap();

    let (_slot, rx) = extend(&requester, volume, 1 << 20);
    round(&dispatcher, &[&requester]);

    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(MailboxError::OperationFailed { volume_id, .. }) if volume_id == volume
    ));
    assert_eq!(dispatcher.stats().failed, 1);
}

#[test]
fn test_many_hosts_and_full_mailbox() {
    let storage = Arc::new(FakeStorage::default());
    let (channel, dispatcher) = setup(storage.clone());
    let busy = builder(&channel).build_requester(3).unwrap();
    let quiet = builder(&channel).build_requester(0).unwrap();

    let mut waiting = Vec::new();
    for n in 0..MESSAGES_PER_MAILBOX {
        waiting.push(extend(&busy, Uuid::new_v4(), n as u64 + 1).1);
    }
    waiting.push(extend(&quiet, Uuid::new_v4(), 7).1);

    round(&dispatcher, &[&busy, &quiet]);

    for rx in waiting {
        assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    }
    assert_eq!(storage.total_calls(), MESSAGES_PER_MAILBOX + 1);
    assert_eq!(dispatcher.stats().submitted, MESSAGES_PER_MAILBOX as u64 + 1);
}

#[test]
fn test_reply_writes_stay_in_host_range() {
    let storage = Arc::new(FakeStorage::default());
    let (channel, dispatcher) = setup(storage);
    let requester = builder(&channel).build_requester(2).unwrap();
    // Clean start writes every host once; only look at what follows.
    dispatcher.tick().unwrap();
    channel.clear_writes();

    let (_slot, rx) = extend(&requester, Uuid::new_v4(), 1);
    round(&dispatcher, &[&requester]);
    rx.recv_timeout(WAIT).unwrap().unwrap();

    let writes = channel.writes();
    assert!(writes.iter().any(|w| w.area == Area::Replies));
    for write in writes {
        assert_eq!(write.offset, 2 * 4096);
        assert_eq!(write.len, 4096);
    }
}

#[test]
fn test_busy_pool_defers_without_duplicates() {
    let storage = Arc::new(FakeStorage {
        delay: Some(Duration::from_millis(20)),
        ..FakeStorage::default()
    });
    let channel = Arc::new(MemoryChannel::new(HOSTS));
    let dispatcher = MailboxBuilder::new()
        .with_channel(channel.clone())
        .with_max_hosts(HOSTS)
        .with_task_capacity(1)
        .with_pool_queue_depth(1)
        .build_dispatcher(HandlerTable::with_extender(storage.clone()))
        .unwrap();
    assert_eq!(dispatcher.pool_size(), 1);
    let requester = builder(&channel).build_requester(1).unwrap();

    let volumes: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
    let receivers: Vec<_> = volumes.iter().map(|&v| extend(&requester, v, 1).1).collect();

    // Some requests bounce off the full queue and are picked up later.
    for _ in 0..20 {
        round(&dispatcher, &[&requester]);
        if storage.total_calls() == volumes.len() {
            break;
        }
    }
    requester.tick().unwrap();

    for rx in receivers {
        assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    }
    for volume in volumes {
        assert_eq!(storage.calls_for(volume), 1);
    }
    assert_eq!(dispatcher.stats().submitted, 5);
}

#[test]
fn test_reply_for_withdrawn_request_is_dropped() {
    let (release, gate) = mpsc::channel();
    let storage = Arc::new(FakeStorage {
        gate: Mutex::new(Some(gate)),
        ..FakeStorage::default()
    });
    let (channel, dispatcher) = setup(storage.clone());
    let requester = builder(&channel).build_requester(1).unwrap();

    let (_slot, rx) = extend(&requester, Uuid::new_v4(), 1);
    requester.tick().unwrap();
    dispatcher.tick().unwrap();
    assert_eq!(dispatcher.in_flight(), 1);

    // Host gives up while the operation is still running.
    requester.stop().unwrap();
    dispatcher.tick().unwrap();

    release.send(()).unwrap();
    assert!(dispatcher.wait_idle(WAIT));

    assert_eq!(dispatcher.stats().discarded, 1);
    assert!(mailbox(&channel, Area::Replies, 1).is_pristine());
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn test_torn_request_mailbox_is_retried() {
    let storage = Arc::new(FakeStorage::default());
    let (channel, dispatcher) = setup(storage.clone());
    let requester = builder(&channel).build_requester(1).unwrap();

    let (_slot, rx) = extend(&requester, Uuid::new_v4(), 1);
    requester.tick().unwrap();

    // Writer caught mid-update: one byte of the volume UUID is not there yet.
    let offset = 4096 + 30;
    let original = channel.mailbox_bytes(Area::Requests, 1)[30];
    channel.poke(Area::Requests, offset, &[!original]);

    dispatcher.tick().unwrap();
    assert!(dispatcher.wait_idle(WAIT));
    assert_eq!(dispatcher.stats().checksum_skips, 1);
    assert_eq!(storage.total_calls(), 0);

    // Write completes; the next tick picks the request up.
    channel.poke(Area::Requests, offset, &[original]);
    round(&dispatcher, &[&requester]);
    assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    assert_eq!(storage.total_calls(), 1);
}

#[test]
fn test_clean_start_clears_leftover_replies() {
    let storage = Arc::new(FakeStorage::default());
    let (channel, dispatcher) = setup(storage);

    let mut leftover = Mailbox::new(2);
    leftover.set_slot(5, &Message::extend(Uuid::new_v4(), Uuid::new_v4(), 9).encode());
    channel.write_mailbox(Area::Replies, 2, leftover.prepare_for_write()).unwrap();

    dispatcher.tick().unwrap();
    assert!(channel.snapshot(Area::Replies).iter().all(|&b| b == 0));
}

#[test]
fn test_unhandled_opcode_gets_no_reply() {
    let channel = Arc::new(MemoryChannel::new(HOSTS));
    let handlers = HandlerTable::new();
    assert_eq!(handlers.opcodes().count(), 0);
    let dispatcher = builder(&channel).build_dispatcher(handlers).unwrap();
    let requester = builder(&channel).build_requester(0).unwrap();

    let (_slot, rx) = extend(&requester, Uuid::new_v4(), 1);
    round(&dispatcher, &[&requester]);

    assert!(rx.recv_timeout(QUIET).is_err());
    assert_eq!(dispatcher.stats().submitted, 0);
    assert!(mailbox(&channel, Area::Replies, 0).is_pristine());
}

#[test]
fn test_panicking_handler_replies_failure() {
    let channel = Arc::new(MemoryChannel::new(HOSTS));
    let mut handlers = HandlerTable::new();
    handlers.register(
        Opcode::Extend,
        Arc::new(|_: &Message| -> Result<u64, HandlerError> { panic!("storage layer exploded") }),
    );
    let dispatcher = builder(&channel).build_dispatcher(handlers).unwrap();
    let requester = builder(&channel).build_requester(0).unwrap();

    let (_slot, rx) = extend(&requester, Uuid::new_v4(), 1);
    round(&dispatcher, &[&requester]);

    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Err(MailboxError::OperationFailed { .. })));
}

#[test]
fn test_restarted_host_resending_same_request_gets_reply() {
    let storage = Arc::new(FakeStorage::default());
    let (channel, dispatcher) = setup(storage.clone());
    let volume = Uuid::new_v4();
    let message = Message::extend(Uuid::nil(), volume, 1 << 30);

    // A previous run of host 2 left this request in slot 0 and the
    // coordinator answered it before the host came back.
    let mut previous_run = Mailbox::new(2);
    previous_run.set_slot(0, &message.encode());
    channel
        .write_mailbox(Area::Requests, 2, previous_run.prepare_for_write())
        .unwrap();
    dispatcher.tick().unwrap();
    assert!(dispatcher.wait_idle(WAIT));
    assert_eq!(mailbox(&channel, Area::Replies, 2).slot_state(0), SlotState::Active);

    let requester = builder(&channel).build_requester(2).unwrap();
    let (tx, rx) = mpsc::channel();
    let slot = requester
        .enqueue(message, move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();
    assert_eq!(slot, 0);

    round(&dispatcher, &[&requester]);
    let reply = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(reply.volume_id, volume);
    assert_eq!(reply.new_size, 2 << 30);
    assert_eq!(requester.pending_count(), 0);
    assert_eq!(storage.calls_for(volume), 1);
    assert_eq!(dispatcher.stats().submitted, 1);
}

#[test]
fn test_host_table_grows() {
    let storage = Arc::new(FakeStorage::default());
    let channel = Arc::new(MemoryChannel::new(8));
    let dispatcher = MailboxBuilder::new()
        .with_channel(channel.clone())
        .with_max_hosts(2)
        .build_dispatcher(HandlerTable::with_extender(storage.clone()))
        .unwrap();
    let requester = MailboxBuilder::new()
        .with_channel(channel.clone())
        .with_max_hosts(8)
        .build_requester(5)
        .unwrap();

    let (_slot, rx) = extend(&requester, Uuid::new_v4(), 1);
    round(&dispatcher, &[&requester]);
    assert!(rx.recv_timeout(QUIET).is_err());
    assert_eq!(storage.total_calls(), 0);

    dispatcher.set_max_hosts(6).unwrap();
    assert_eq!(dispatcher.hosts(), 6);
    round(&dispatcher, &[&requester]);
    assert!(rx.recv_timeout(WAIT).unwrap().is_ok());

    // Shrinking is ignored; the storage bounds still apply.
    dispatcher.set_max_hosts(3).unwrap();
    assert_eq!(dispatcher.hosts(), 6);
    assert!(matches!(
        dispatcher.set_max_hosts(9),
        Err(MailboxError::HostOutOfRange { .. })
    ));
}

#[test]
fn test_dispatcher_reports_transport_failure() {
    let storage = Arc::new(FakeStorage::default());
    let (channel, dispatcher) = setup(storage);
    channel.set_failing(true);
    assert!(dispatcher.tick().unwrap_err().is_transport());
    channel.set_failing(false);
    dispatcher.tick().unwrap();
}

#[test]
#[serial_test::serial]
fn test_threads_exchange_request() {
    let storage = Arc::new(FakeStorage::default());
    let channel = Arc::new(MemoryChannel::new(HOSTS));
    let fast = |channel: &Arc<MemoryChannel>| {
        builder(channel)
            .with_poll_interval(Duration::from_millis(10))
            .with_error_backoff(Duration::from_millis(50))
    };
    let dispatcher = fast(&channel)
        .build_dispatcher(HandlerTable::with_extender(storage.clone()))
        .unwrap();
    let requester = fast(&channel).build_requester(2).unwrap();
    dispatcher.start().unwrap();
    requester.start().unwrap();

    let volume = Uuid::new_v4();
    let (tx, rx) = mpsc::channel();
    requester.send_request(Uuid::new_v4(), volume, 4 << 30, move |outcome| {
        let _ = tx.send(outcome);
    });
    let reply = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(reply.volume_id, volume);
    assert_eq!(reply.new_size, 5 << 30);

    requester.stop().unwrap();
    dispatcher.stop().unwrap();
    assert_eq!(storage.calls_for(volume), 1);
    assert!(mailbox(&channel, Area::Requests, 2).is_pristine());
}
