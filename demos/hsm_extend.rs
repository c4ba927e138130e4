// Host side: ask the coordinator to extend one or more volumes and wait for
// the replies.
// Usage: hsm_extend <requests-file> <replies-file> <host_id> <new_size> [count]
use spm_mailbox::Core::{DirectFileChannel, SharedChannel};
use spm_mailbox::Monitor::MailboxBuilder;
use std::env;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 5 {
        eprintln!(
            "Usage: {} <requests-file> <replies-file> <host_id> <new_size> [count]",
            args[0]
        );
        std::process::exit(1);
    }
    let host_id: usize = args[3].parse().expect("Invalid host id");
    let new_size: u64 = args[4].parse().expect("Invalid size");
    let count: usize = args.get(5).map(|n| n.parse().expect("Invalid count")).unwrap_or(1);

    let channel = DirectFileChannel::open(Path::new(&args[1]), Path::new(&args[2]))?;
    let max_hosts = channel.capacity();
    let requester = MailboxBuilder::new()
        .with_channel(Arc::new(channel))
        .with_max_hosts(max_hosts)
        .with_poll_interval(Duration::from_millis(500))
        .with_error_backoff(Duration::from_secs(5))
        .build_requester(host_id)?;

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_for_handler.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");

    requester.start()?;

    let domain_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel();
    for _ in 0..count {
        let volume_id = Uuid::new_v4();
        let tx = tx.clone();
        requester.send_request(domain_id, volume_id, new_size, move |outcome| {
            let _ = tx.send((volume_id, outcome));
        });
    }
    drop(tx);
    println!("Host {host_id}: sent {count} extend requests");

    let mut answered = 0;
    while answered < count && running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok((volume_id, Ok(reply))) => {
                answered += 1;
                println!("Host {host_id}: {volume_id} is now {} bytes", reply.new_size);
            }
            Ok((volume_id, Err(e))) => {
                answered += 1;
                eprintln!("Host {host_id}: {volume_id} failed: {e}");
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    requester.stop()?;
    println!("Host {host_id}: {answered}/{count} answered, mailbox released");
    Ok(())
}
