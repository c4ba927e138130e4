// Coordinator side: serve extend requests from every host until Ctrl+C.
// Usage: spm_dispatch <requests-file> <replies-file> [max_hosts]
use spm_mailbox::Core::DirectFileChannel;
use spm_mailbox::Monitor::{HandlerError, HandlerTable, MailboxBuilder, VolumeExtender};
use std::env;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <requests-file> <replies-file> [max_hosts]", args[0]);
        std::process::exit(1);
    }
    let max_hosts: usize = match args.get(3) {
        Some(n) => n.parse().expect("Invalid host count"),
        None => 250,
    };

    let channel = DirectFileChannel::create(Path::new(&args[1]), Path::new(&args[2]), max_hosts)?;
    println!("Dispatcher: {} host mailboxes, direct I/O: {}", max_hosts, channel.is_direct());

    // Pretend storage: every extend succeeds with the requested size.
    let extender: Arc<dyn VolumeExtender> = Arc::new(
        |domain_id: Uuid, volume_id: Uuid, new_size: u64| -> Result<u64, HandlerError> {
            println!("Dispatcher: extend {domain_id}/{volume_id} to {new_size} bytes");
            Ok(new_size)
        },
    );

    let dispatcher = MailboxBuilder::new()
        .with_channel(Arc::new(channel))
        .with_max_hosts(max_hosts)
        .build_dispatcher(HandlerTable::with_extender(extender))?;

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_for_handler.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");

    dispatcher.start()?;
    println!("Dispatcher: running, press Ctrl+C to stop");

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    dispatcher.stop()?;
    let stats = dispatcher.stats();
    println!(
        "Dispatcher: stopped after {} requests ({} ok, {} failed, {} dropped)",
        stats.submitted, stats.succeeded, stats.failed, stats.discarded
    );
    Ok(())
}
