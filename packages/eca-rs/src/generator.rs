//! Auxiliary event generators.
//!
//! A generator runs a producer on its own thread and fires one event per
//! payload at the context it was created for. Producers receive a
//! [`StopSignal`] they use both to notice a stop request and to sleep
//! interruptibly between payloads:
//!
//! ```ignore
//! eca::start_generator("ticker", "tick", |stop| {
//!     (0..).map_while(move |n| {
//!         (!stop.wait(Duration::from_secs(1))).then(|| json!({"n": n}))
//!     })
//! })?;
//! ```
//!
//! The signal is tied to the owning context: stopping the context (or shutting
//! down its engine) also stops its generators.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::active;
use crate::context::{Context, WeakContext};
use crate::error::{EcaError, Result};

/// Stop flag shared between a generator and whoever controls it.
#[derive(Clone)]
pub struct StopSignal {
    token: CancellationToken,
    timers: Handle,
}

impl StopSignal {
    pub(crate) fn new(token: CancellationToken, timers: Handle) -> Self {
        Self { token, timers }
    }

    /// Whether a stop was requested.
    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Request a stop.
    pub fn set(&self) {
        self.token.cancel();
    }

    /// Sleep for up to `timeout`, waking early on a stop request.
    ///
    /// Returns `true` if a stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        self.timers.block_on(async {
            tokio::time::timeout(timeout, self.token.cancelled())
                .await
                .is_ok()
        })
    }
}

impl fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSignal")
            .field("is_set", &self.is_set())
            .finish()
    }
}

type Producer = Box<dyn FnOnce(StopSignal) -> Box<dyn Iterator<Item = Value>> + Send>;

/// A producer bound to a context and an event name.
///
/// The generator only references its context weakly, so registering it as an
/// auxiliary of that same context does not keep the context alive. Its thread
/// holds the context while it runs.
pub struct EventGenerator {
    context: WeakContext,
    context_name: String,
    event_name: String,
    producer: Mutex<Option<Producer>>,
    stop: StopSignal,
    produced: Arc<AtomicUsize>,
    finished: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EventGenerator {
    /// Create a generator firing `event_name` at `context`. Nothing runs until
    /// [`EventGenerator::start`].
    pub fn new<F, I>(context: &Context, event_name: impl Into<String>, producer: F) -> Self
    where
        F: FnOnce(StopSignal) -> I + Send + 'static,
        I: Iterator<Item = Value> + 'static,
    {
        let producer: Producer =
            Box::new(move |stop: StopSignal| -> Box<dyn Iterator<Item = Value>> {
                Box::new(producer(stop))
            });
        Self {
            context: context.downgrade(),
            context_name: context.name().to_string(),
            event_name: event_name.into(),
            producer: Mutex::new(Some(producer)),
            stop: StopSignal::new(context.stop_token().child_token(), context.timers()),
            produced: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Run the producer on a dedicated thread bound to the context.
    ///
    /// Fails with [`EcaError::NoActiveContext`] if the context is already gone.
    pub fn start(&self) -> Result<()> {
        let producer = lock(&self.producer)
            .take()
            .ok_or_else(|| EcaError::AlreadyStarted {
                name: self.event_name.clone(),
            })?;

        let context = self
            .context
            .upgrade()
            .ok_or_else(|| EcaError::no_context("start a generator"))?;
        let event_name = self.event_name.clone();
        let stop = self.stop.clone();
        let produced = self.produced.clone();
        let finished = self.finished.clone();

        let handle = thread::Builder::new()
            .name(format!("eca-gen-{}", self.event_name))
            .spawn(move || {
                let _active = active::switch(context);
                debug!(event = %event_name, "generator running");

                for payload in producer(stop.clone()) {
                    if stop.is_set() {
                        break;
                    }
                    if let Err(e) = crate::api::fire(&event_name, payload) {
                        warn!(event = %event_name, error = %e, "generator could not fire");
                        break;
                    }
                    produced.fetch_add(1, Ordering::Relaxed);
                }

                finished.store(true, Ordering::Release);
                info!(
                    event = %event_name,
                    produced = produced.load(Ordering::Relaxed),
                    stopped = stop.is_set(),
                    "generator finished"
                );
            })
            .map_err(|source| EcaError::ThreadSpawn {
                name: self.event_name.clone(),
                source,
            })?;

        *lock(&self.thread) = Some(handle);
        Ok(())
    }

    /// Ask the producer to stop. It is observed between payloads and by
    /// [`StopSignal::wait`].
    pub fn stop(&self) {
        self.stop.set();
    }

    /// Wait for the generator thread to exit.
    pub fn join(&self) -> Result<()> {
        match lock(&self.thread).take() {
            Some(handle) => handle.join().map_err(|_| EcaError::GeneratorPanicked {
                event: self.event_name.clone(),
            }),
            None => Ok(()),
        }
    }

    /// The signal handed to the producer.
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Name of the events fired.
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Number of events fired so far.
    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::Relaxed)
    }

    /// Whether the producer ran to completion or stopped.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl fmt::Debug for EventGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventGenerator")
            .field("context", &self.context_name)
            .field("event_name", &self.event_name)
            .field("produced", &self.produced())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

/// Create a generator for the active context, register it as an auxiliary
/// under `aux_name` and start it.
pub fn start_generator<F, I>(
    aux_name: impl Into<String>,
    event_name: impl Into<String>,
    producer: F,
) -> Result<Arc<EventGenerator>>
where
    F: FnOnce(StopSignal) -> I + Send + 'static,
    I: Iterator<Item = Value> + 'static,
{
    let context = active::require("start a generator")?;
    let generator = Arc::new(EventGenerator::new(&context, event_name, producer));
    context.register_auxiliary(aux_name, generator.clone());
    generator.start()?;
    Ok(generator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::ContextOptions;
    use crate::engine::Engine;
    use crate::testing::recording_rule;
    use serde_json::json;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default().with_queue_wait(Duration::from_millis(20))).unwrap()
    }

    #[test]
    fn test_generator_fires_each_payload_in_order() {
        let engine = engine();
        let recorder = recording_rule(engine.rules(), "numbers", &["number"]);
        let ctx = engine.spawn_context(ContextOptions::named("gen")).unwrap();

        let generator =
            EventGenerator::new(&ctx, "number", |_| (0..3).map(|i| json!({"i": i})));
        generator.start().unwrap();
        generator.join().unwrap();

        assert!(recorder.wait_for(3, Duration::from_secs(2)));
        let order: Vec<_> = recorder
            .events()
            .iter()
            .map(|e| e.get("i").cloned().unwrap())
            .collect();
        assert_eq!(order, vec![json!(0), json!(1), json!(2)]);
        assert_eq!(generator.produced(), 3);
        assert!(generator.is_finished());
    }

    #[test]
    fn test_stop_interrupts_waiting_producer() {
        let engine = engine();
        let ctx = engine.spawn_context(ContextOptions::named("gen")).unwrap();

        let generator = EventGenerator::new(&ctx, "tick", |stop| {
            std::iter::from_fn(move || (!stop.wait(Duration::from_secs(30))).then(|| json!({})))
        });
        generator.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = std::time::Instant::now();
        generator.stop();
        generator.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(generator.produced(), 0);
    }

    #[test]
    fn test_stopping_context_stops_generator() {
        let engine = engine();
        let ctx = engine.spawn_context(ContextOptions::named("owner")).unwrap();
        let generator = EventGenerator::new(&ctx, "tick", |stop| {
            std::iter::from_fn(move || (!stop.wait(Duration::from_secs(30))).then(|| json!({})))
        });
        generator.start().unwrap();

        ctx.stop();
        generator.join().unwrap();
        assert!(generator.stop_signal().is_set());
    }

    #[test]
    fn test_start_twice_fails() {
        let engine = engine();
        let ctx = engine.context(ContextOptions::named("gen"));
        let generator = EventGenerator::new(&ctx, "x", |_| std::iter::empty());
        generator.start().unwrap();
        assert!(matches!(generator.start(), Err(EcaError::AlreadyStarted { .. })));
        generator.join().unwrap();
    }

    #[test]
    fn test_start_generator_registers_auxiliary() {
        let engine = engine();
        let recorder = recording_rule(engine.rules(), "lines", &["line"]);
        engine.rules().rule("start").on("init").action(|_, _| {
            start_generator("reader", "line", |_| {
                vec![json!("a"), json!("b")].into_iter()
            })?;
            Ok(())
        });

        let ctx = engine.spawn_context(ContextOptions::named("main")).unwrap();
        assert!(recorder.wait_for(2, Duration::from_secs(2)));

        let generator = ctx.auxiliary::<EventGenerator>("reader").unwrap();
        generator.join().unwrap();
        assert_eq!(generator.event_name(), "line");
        assert_eq!(recorder.events()[0].data(), &json!("a"));
    }

    #[test]
    fn test_contexts_with_generators_are_released() {
        let engine = engine();
        engine.rules().rule("start").on("init").action(|_, _| {
            start_generator("ticker", "tick", |stop| {
                std::iter::from_fn(move || {
                    (!stop.wait(Duration::from_secs(30))).then(|| json!({}))
                })
            })?;
            Ok(())
        });

        let contexts: Vec<Context> = (0..3)
            .map(|i| {
                engine
                    .spawn_context(ContextOptions::named(format!("gen-{i}")))
                    .unwrap()
            })
            .collect();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let generators: Vec<Arc<EventGenerator>> = contexts
            .iter()
            .map(|ctx| loop {
                if let Ok(generator) = ctx.auxiliary::<EventGenerator>("ticker") {
                    break generator;
                }
                assert!(std::time::Instant::now() < deadline, "generator never registered");
                thread::sleep(Duration::from_millis(5));
            })
            .collect();

        for ctx in &contexts {
            assert!(ctx.stop());
            ctx.join().unwrap();
        }
        for generator in &generators {
            generator.join().unwrap();
            assert!(generator.is_finished());
        }
        drop(generators);
        drop(contexts);

        assert!(engine.contexts().is_empty());
    }

    #[test]
    fn test_start_after_context_dropped_fails() {
        let engine = engine();
        let ctx = engine.context(ContextOptions::named("gone"));
        let generator = EventGenerator::new(&ctx, "x", |_| std::iter::empty());
        drop(ctx);

        assert!(matches!(generator.start(), Err(EcaError::NoActiveContext { .. })));
    }

    #[test]
    fn test_start_generator_requires_active_context() {
        active::reset();
        let result = start_generator("x", "y", |_| std::iter::empty());
        assert!(matches!(result, Err(EcaError::NoActiveContext { .. })));
    }
}
