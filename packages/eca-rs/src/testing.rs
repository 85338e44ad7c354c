//! Testing utilities for rules and contexts.
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! eca = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Recording what rules see
//!
//! Context loops run on their own threads, so assertions need to wait for
//! events to arrive. A [`Recorder`] collects events and lets the test block
//! until enough have been seen:
//!
//! ```ignore
//! use eca::testing::{recording_rule, init_tracing};
//!
//! init_tracing();
//! let seen = recording_rule(engine.rules(), "seen", &["ping"]);
//!
//! ctx.fire("ping", json!({"a": 10}));
//! assert!(seen.wait_for(1, Duration::from_secs(1)));
//! ```

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::event::Event;
use crate::rule::RuleRegistry;

/// Thread-safe log of events with blocking waits.
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    changed: Condvar,
}

impl Recorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Event>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an event and wake waiters.
    pub fn record(&self, event: Event) {
        self.lock().push(event);
        self.changed.notify_all();
    }

    /// Copy of everything recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.lock().clone()
    }

    /// Names of everything recorded so far.
    pub fn names(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.name().to_string()).collect()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Block until at least `count` events were recorded or `timeout` passes.
    ///
    /// Returns whether the count was reached.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.lock();
        while events.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = match self.changed.wait_timeout(events, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

/// Register a rule recording every event named in `events`.
pub fn recording_rule(rules: &RuleRegistry, name: &str, events: &[&str]) -> Arc<Recorder> {
    let recorder = Arc::new(Recorder::new());
    let sink = recorder.clone();
    let mut builder = rules.rule(name);
    for event in events {
        builder = builder.on(*event);
    }
    builder.action(move |_, event| {
        sink.record(event.clone());
        Ok(())
    });
    recorder
}

/// Install a test-friendly tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("eca=debug")),
        )
        .with_test_writer()
        .try_init();
}
