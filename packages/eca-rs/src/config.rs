use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Default bounded wait of a context loop on its queue.
pub const DEFAULT_QUEUE_WAIT: Duration = Duration::from_secs(1);

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a context loop blocks on an empty queue before re-checking
    /// its stop flag.
    pub queue_wait: Duration,
    /// Per-context queue capacity. `None` means unbounded; when bounded, events
    /// arriving at a full queue are dropped with a warning.
    pub queue_capacity: Option<usize>,
    /// Worker threads of the runtime driving delayed publishes and stop waits.
    pub timer_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_wait: DEFAULT_QUEUE_WAIT,
            queue_capacity: None,
            timer_threads: 1,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// - `ECA_QUEUE_WAIT_MS` (default 1000)
    /// - `ECA_QUEUE_CAPACITY` (unset or `0` for unbounded)
    /// - `ECA_TIMER_THREADS` (default 1)
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();

        let queue_wait = match env::var("ECA_QUEUE_WAIT_MS") {
            Ok(ms) => Duration::from_millis(
                ms.parse()
                    .context("ECA_QUEUE_WAIT_MS must be a number of milliseconds")?,
            ),
            Err(_) => defaults.queue_wait,
        };

        let queue_capacity = match env::var("ECA_QUEUE_CAPACITY") {
            Ok(n) => {
                let n: usize = n
                    .parse()
                    .context("ECA_QUEUE_CAPACITY must be a valid number")?;
                (n > 0).then_some(n)
            }
            Err(_) => defaults.queue_capacity,
        };

        let timer_threads = match env::var("ECA_TIMER_THREADS") {
            Ok(n) => n
                .parse::<usize>()
                .context("ECA_TIMER_THREADS must be a valid number")?
                .max(1),
            Err(_) => defaults.timer_threads,
        };

        Ok(Self {
            queue_wait,
            queue_capacity,
            timer_threads,
        })
    }

    /// Override the queue wait.
    pub fn with_queue_wait(mut self, wait: Duration) -> Self {
        self.queue_wait = wait;
        self
    }

    /// Bound every context queue to `capacity` events.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }
}
