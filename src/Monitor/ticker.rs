// Fixed-interval polling thread shared by both monitors

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_utils::sync::{Parker, Unparker};

use super::builder::MailboxConfig;
use crate::error::{MailboxError, Result};

/// Handle the owner keeps to stop and wake a polling thread.
pub(crate) struct Ticker {
    running: Arc<AtomicBool>,
    unparker: Unparker,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Spawn a thread calling `tick` every `poll_interval` until stopped.
    /// `tick` can be cut short with [`Ticker::wake`].
    pub(crate) fn spawn<F>(name: &str, config: &MailboxConfig, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let running = Arc::new(AtomicBool::new(true));
        let config = config.clone();
        let thread_running = Arc::clone(&running);
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                tracing::info!(monitor = %thread_name, "monitor started");
                let mut failures = 0u32;
                while thread_running.load(Ordering::Acquire) {
                    match tick() {
                        Ok(()) => {
                            if failures > 0 {
                                tracing::info!(monitor = %thread_name, failures, "storage reachable again");
                            }
                            failures = 0;
                        }
                        Err(e) if e.is_transport() => {
                            failures = failures.saturating_add(1);
                            tracing::warn!(monitor = %thread_name, failures, error = %e, "mailbox transfer failed");
                        }
                        Err(e) => {
                            tracing::warn!(monitor = %thread_name, error = %e, "tick failed");
                        }
                    }
                    if !thread_running.load(Ordering::Acquire) {
                        break;
                    }
                    parker.park_timeout(config.next_delay(failures));
                }
                tracing::info!(monitor = %thread_name, "monitor stopped");
            })
            .map_err(|source| MailboxError::Spawn {
                name: name.to_string(),
                source,
            })?;

        Ok(Self {
            running,
            unparker,
            handle: Some(handle),
        })
    }

    /// Run the next tick now instead of at the end of the current interval.
    pub(crate) fn wake(&self) {
        self.unparker.unpark();
    }

    /// Stop the thread and wait for the tick in progress to finish.
    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.unparker.unpark();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("monitor thread panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
