use std::sync::Arc;
use std::time::Duration;

use super::dispatcher::Dispatcher;
use super::handlers::HandlerTable;
use super::requester::Requester;
use crate::error::{MailboxError, Result};
use crate::Core::SharedStorage::SharedChannel;

/// Tunables shared by both monitors.
#[derive(Debug, Clone, PartialEq)]
pub struct MailboxConfig {
    /// Time between two polling ticks while storage is healthy.
    pub poll_interval: Duration,
    /// Time between ticks once transfers keep failing.
    pub error_backoff: Duration,
    /// Number of host mailboxes the coordinator scans.
    pub max_hosts: usize,
    /// General task capacity of the host; the dispatch pool gets a fraction of it.
    pub task_capacity: usize,
    /// Share of `task_capacity` given to the dispatch pool, in (0, 1].
    pub pool_fraction: f64,
    /// Jobs that may wait in the dispatch pool queue.
    pub pool_queue_depth: usize,
    /// Threads running requester callbacks.
    pub callback_workers: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            error_backoff: Duration::from_secs(20),
            max_hosts: 250,
            task_capacity: 10,
            pool_fraction: 0.5,
            pool_queue_depth: 64,
            callback_workers: 2,
        }
    }
}

impl MailboxConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(MailboxError::InvalidConfig(msg.to_string()));
        if self.poll_interval.is_zero() {
            return invalid("poll_interval must be positive");
        }
        if self.error_backoff < self.poll_interval {
            return invalid("error_backoff must not be shorter than poll_interval");
        }
        if self.max_hosts == 0 {
            return invalid("max_hosts must be positive");
        }
        if !(self.pool_fraction > 0.0 && self.pool_fraction <= 1.0) {
            return invalid("pool_fraction must be in (0, 1]");
        }
        if self.pool_queue_depth == 0 {
            return invalid("pool_queue_depth must be positive");
        }
        if self.callback_workers == 0 {
            return invalid("callback_workers must be positive");
        }
        Ok(())
    }

    /// Delay before the next tick given the number of consecutive transport failures.
    /// The first failure retries on the normal cadence; repeated failures back off.
    pub fn next_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures >= 2 {
            self.error_backoff
        } else {
            self.poll_interval
        }
    }
}

pub struct MailboxBuilder {
    config: MailboxConfig,
    channel: Option<Arc<dyn SharedChannel>>,
}

impl Default for MailboxBuilder {
    fn default() -> Self {
        Self {
            config: MailboxConfig::default(),
            channel: None,
        }
    }
}

impl MailboxBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: MailboxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_channel(mut self, channel: Arc<dyn SharedChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.config.error_backoff = backoff;
        self
    }

    pub fn with_max_hosts(mut self, max_hosts: usize) -> Self {
        self.config.max_hosts = max_hosts;
        self
    }

    pub fn with_task_capacity(mut self, capacity: usize) -> Self {
        self.config.task_capacity = capacity;
        self
    }

    pub fn with_pool_fraction(mut self, fraction: f64) -> Self {
        self.config.pool_fraction = fraction;
        self
    }

    pub fn with_pool_queue_depth(mut self, depth: usize) -> Self {
        self.config.pool_queue_depth = depth;
        self
    }

    pub fn with_callback_workers(mut self, workers: usize) -> Self {
        self.config.callback_workers = workers;
        self
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    fn parts(self) -> Result<(MailboxConfig, Arc<dyn SharedChannel>)> {
        self.config.validate()?;
        let channel = self
            .channel
            .ok_or_else(|| MailboxError::InvalidConfig("no shared channel configured".into()))?;
        if channel.capacity() < self.config.max_hosts {
            return Err(MailboxError::InvalidConfig(format!(
                "channel holds {} mailboxes, max_hosts is {}",
                channel.capacity(),
                self.config.max_hosts
            )));
        }
        Ok((self.config, channel))
    }

    /// Requester for `host_id`. The monitor thread is not started.
    pub fn build_requester(self, host_id: usize) -> Result<Requester> {
        let (config, channel) = self.parts()?;
        if host_id >= config.max_hosts {
            return Err(MailboxError::HostOutOfRange {
                host_id,
                max_hosts: config.max_hosts,
            });
        }
        Requester::new(host_id, channel, config)
    }

    /// Coordinator-side dispatcher. The monitor thread is not started.
    pub fn build_dispatcher(self, handlers: HandlerTable) -> Result<Dispatcher> {
        let (config, channel) = self.parts()?;
        Dispatcher::new(channel, handlers, config)
    }
}
