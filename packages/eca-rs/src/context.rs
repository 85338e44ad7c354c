//! Contexts: the unit of execution.
//!
//! A [`Context`] owns a scope, a FIFO queue of events, a private
//! [`PubSubChannel`] and a table of named auxiliaries. Once started, a dedicated
//! OS thread drains the queue and runs the matching rules of every event,
//! strictly one action at a time.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──start()──► Running ──stop()──► Stopping ──► Stopped
//!                         │
//!                         └── action error / panic ──► Failed
//! ```
//!
//! On construction a context enqueues an `init` event carrying its init data
//! and subscribes its queue to the engine's process-wide channel. When the loop
//! exits it unsubscribes again, so global publishes stop reaching it.
//!
//! A stop request wakes an idle loop immediately; an action already running is
//! never preempted. Events still queued when the loop exits are discarded.

use std::any::{type_name, Any};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::active;
use crate::channel::{PubSubChannel, SubscriptionId, EMIT_TOPIC, EVENT_TOPIC};
use crate::engine::EngineCore;
use crate::error::{EcaError, Result};
use crate::event::{names, EmitEnvelope, Event};
use crate::rule::RuleRegistry;
use crate::scope::Scope;

/// Tracing target for per-event dispatch lines.
pub const TRACE_TARGET: &str = "eca::trace";

/// Unique identifier of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Options for creating a context.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Name used for the thread and in logs.
    pub name: String,
    /// Payload of the `init` event.
    pub init_data: Value,
    /// Rules to dispatch against. Defaults to the engine's registry.
    pub rules: Option<RuleRegistry>,
    /// Daemon contexts refuse `stop()` and only end at engine shutdown.
    pub daemon: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            name: "<unnamed context>".to_string(),
            init_data: Value::Null,
            rules: None,
            daemon: false,
        }
    }
}

impl ContextOptions {
    /// Options for a named, non-daemon context.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the `init` payload.
    pub fn with_init_data(mut self, data: impl Into<Value>) -> Self {
        self.init_data = data.into();
        self
    }

    /// Dispatch against a specific rule set.
    pub fn with_rules(mut self, rules: RuleRegistry) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Mark the context as a daemon.
    pub fn daemon(mut self) -> Self {
        self.daemon = true;
        self
    }
}

/// Lifecycle state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextState {
    /// Constructed, loop not started.
    Created = 0,
    /// Loop running.
    Running = 1,
    /// Stop requested, loop not yet exited.
    Stopping = 2,
    /// Loop exited normally.
    Stopped = 3,
    /// Loop ended by an action error or panic.
    Failed = 4,
}

impl ContextState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ContextState::Created,
            1 => ContextState::Running,
            2 => ContextState::Stopping,
            3 => ContextState::Stopped,
            _ => ContextState::Failed,
        }
    }

    /// Whether the loop has exited.
    pub fn is_terminal(self) -> bool {
        matches!(self, ContextState::Stopped | ContextState::Failed)
    }
}

// =============================================================================
// Queue
// =============================================================================

#[derive(Clone)]
enum QueueSender {
    Unbounded(mpsc::UnboundedSender<Event>),
    Bounded(mpsc::Sender<Event>),
}

enum QueueReceiver {
    Unbounded(mpsc::UnboundedReceiver<Event>),
    Bounded(mpsc::Receiver<Event>),
}

fn queue(capacity: Option<usize>) -> (QueueSender, QueueReceiver) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
        }
    }
}

impl QueueSender {
    /// Enqueue without ever blocking. Full or closed queues drop the event.
    fn push(&self, context: &str, event: Event) {
        match self {
            QueueSender::Unbounded(tx) => {
                if let Err(mpsc::error::SendError(event)) = tx.send(event) {
                    trace!(context, event = %event.name(), "queue closed, dropping event");
                }
            }
            QueueSender::Bounded(tx) => match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    warn!(context, event = %event.name(), "queue full, dropping event");
                }
                Err(TrySendError::Closed(event)) => {
                    trace!(context, event = %event.name(), "queue closed, dropping event");
                }
            },
        }
    }
}

impl QueueReceiver {
    async fn recv(&mut self) -> Option<Event> {
        match self {
            QueueReceiver::Unbounded(rx) => rx.recv().await,
            QueueReceiver::Bounded(rx) => rx.recv().await,
        }
    }
}

enum Wake {
    Event(Event),
    Idle,
    Stop,
}

// =============================================================================
// Context
// =============================================================================

type Auxiliary = Arc<dyn Any + Send + Sync>;

pub(crate) struct ContextInner {
    id: ContextId,
    name: String,
    daemon: bool,
    engine: Arc<EngineCore>,
    rules: RuleRegistry,
    channel: PubSubChannel,
    queue: QueueSender,
    receiver: Mutex<Option<QueueReceiver>>,
    scope: Mutex<Scope>,
    auxiliaries: DashMap<String, Auxiliary>,
    state: AtomicU8,
    stop: CancellationToken,
    global_subscription: Mutex<Option<SubscriptionId>>,
    thread: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // An unstarted context dropped by its owner never ran the loop exit path.
        let subscription = self
            .global_subscription
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(id) = subscription {
            let _ = self.engine.global.unsubscribe(EVENT_TOPIC, id);
        }
    }
}

/// Handle to a context. Cloning is cheap and clones refer to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

/// Non-owning reference kept by the engine to reach live contexts.
#[derive(Clone)]
pub(crate) struct WeakContext(Weak<ContextInner>);

impl WeakContext {
    pub(crate) fn upgrade(&self) -> Option<Context> {
        self.0.upgrade().map(|inner| Context { inner })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Context {
    pub(crate) fn new(engine: Arc<EngineCore>, options: ContextOptions) -> Self {
        let ContextOptions {
            name,
            init_data,
            rules,
            daemon,
        } = options;

        let (sender, receiver) = queue(engine.config.queue_capacity);
        let channel = PubSubChannel::new(engine.timers.clone());
        let rules = rules.unwrap_or_else(|| engine.rules.clone());

        let inner = Arc::new(ContextInner {
            id: ContextId::new(),
            name,
            daemon,
            rules,
            channel,
            queue: sender,
            receiver: Mutex::new(Some(receiver)),
            scope: Mutex::new(Scope::new()),
            auxiliaries: DashMap::new(),
            state: AtomicU8::new(ContextState::Created as u8),
            stop: engine.shutdown_token().child_token(),
            global_subscription: Mutex::new(None),
            thread: Mutex::new(None),
            engine,
        });
        let context = Context { inner };

        context
            .inner
            .channel
            .subscribe(EVENT_TOPIC, context.enqueuer());
        context.receive(Event::new(names::INIT, init_data));

        let global = context
            .inner
            .engine
            .global
            .subscribe(EVENT_TOPIC, context.enqueuer());
        *lock(&context.inner.global_subscription) = Some(global);

        debug!(context = %context.name(), id = %context.id(), daemon, "created context");
        context
    }

    /// Subscriber callback that only enqueues. Captures the sender, never the
    /// context itself.
    fn enqueuer(&self) -> impl Fn(&str, &Event) + Send + Sync + 'static {
        let queue = self.inner.queue.clone();
        let name = self.inner.name.clone();
        move |_, event| queue.push(&name, event.clone())
    }

    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext(Arc::downgrade(&self.inner))
    }

    pub(crate) fn engine(&self) -> &Arc<EngineCore> {
        &self.inner.engine
    }

    pub(crate) fn timers(&self) -> Handle {
        self.inner.engine.timers.clone()
    }

    pub(crate) fn stop_token(&self) -> &CancellationToken {
        &self.inner.stop
    }

    /// Unique id.
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Name given at creation.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether `stop()` is refused.
    pub fn is_daemon(&self) -> bool {
        self.inner.daemon
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        ContextState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ContextState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Whether a stop was requested (or the engine is shutting down).
    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// The rules this context dispatches against.
    pub fn rules(&self) -> &RuleRegistry {
        &self.inner.rules
    }

    /// The context's private channel. Subscribe to [`EMIT_TOPIC`] here to
    /// observe `emit` output.
    pub fn channel(&self) -> &PubSubChannel {
        &self.inner.channel
    }

    /// Enqueue an event directly, bypassing the channel.
    pub fn receive(&self, event: Event) {
        trace!(target: TRACE_TARGET, context = %self.name(), event = %event, "received event");
        self.inner.queue.push(&self.inner.name, event);
    }

    // =========================================================================
    // Firing
    // =========================================================================

    /// Publish an event to this context.
    pub fn fire(&self, name: &str, data: impl Into<Value>) {
        self.inner.channel.publish(EVENT_TOPIC, &Event::new(name, data));
    }

    /// Publish an event to this context after `delay`.
    pub fn fire_after(&self, name: &str, data: impl Into<Value>, delay: Duration) {
        self.inner
            .channel
            .publish_after(EVENT_TOPIC, Event::new(name, data), delay);
    }

    /// Publish an event to this context, now or after an optional `delay`.
    pub fn fire_with_delay(&self, name: &str, data: impl Into<Value>, delay: Option<Duration>) {
        self.inner
            .channel
            .publish_maybe_delayed(EVENT_TOPIC, Event::new(name, data), delay);
    }

    /// Publish an event to every context of the engine.
    pub fn fire_global(&self, name: &str, data: impl Into<Value>) {
        self.inner.engine.fire_global(name, data);
    }

    /// Publish an event to every context of the engine after `delay`.
    pub fn fire_global_after(&self, name: &str, data: impl Into<Value>, delay: Duration) {
        self.inner.engine.fire_global_after(name, data, delay);
    }

    /// Serialize `data` and publish it on this context's `emit` topic.
    ///
    /// Emitted events never reach rules; they are for external observers.
    pub fn emit<T: Serialize + ?Sized>(&self, name: &str, data: &T, id: Option<&str>) -> Result<()> {
        let envelope = EmitEnvelope {
            json: serde_json::to_string(data)?,
            id: id.map(str::to_string),
        };
        let event = Event::new(name, serde_json::to_value(&envelope)?);
        self.inner.channel.publish(EMIT_TOPIC, &event);
        Ok(())
    }

    // =========================================================================
    // Auxiliaries
    // =========================================================================

    /// Attach a named helper object (such as an event generator), replacing
    /// any previous one with the same name.
    pub fn register_auxiliary<T: Any + Send + Sync>(&self, name: impl Into<String>, value: Arc<T>) {
        let name = name.into();
        debug!(context = %self.name(), auxiliary = %name, "registered auxiliary");
        self.inner.auxiliaries.insert(name, value);
    }

    /// Look up a named helper object by type.
    pub fn auxiliary<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        let value = self
            .inner
            .auxiliaries
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EcaError::AuxiliaryNotFound {
                name: name.to_string(),
            })?;

        value
            .downcast::<T>()
            .map_err(|_| EcaError::AuxiliaryTypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Detach a named helper object. Returns whether one was registered.
    pub fn remove_auxiliary(&self, name: &str) -> bool {
        self.inner.auxiliaries.remove(name).is_some()
    }

    // =========================================================================
    // Scope
    // =========================================================================

    /// Read the scope.
    ///
    /// Must not be called from one of this context's own actions, which
    /// already hold the scope.
    pub fn with_scope<R>(&self, f: impl FnOnce(&Scope) -> R) -> R {
        f(&*lock(&self.inner.scope))
    }

    /// Modify the scope from outside the loop, e.g. to seed variables before
    /// `start()`. Same restriction as [`Context::with_scope`].
    pub fn with_scope_mut<R>(&self, f: impl FnOnce(&mut Scope) -> R) -> R {
        f(&mut *lock(&self.inner.scope))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the dispatch loop on a dedicated thread.
    pub fn start(&self) -> Result<()> {
        let receiver = lock(&self.inner.receiver)
            .take()
            .ok_or_else(|| EcaError::AlreadyStarted {
                name: self.name().to_string(),
            })?;

        self.set_state(ContextState::Running);
        let context = self.clone();
        let handle = thread::Builder::new()
            .name(format!("eca-{}", self.name()))
            .spawn(move || context.run(receiver))
            .map_err(|source| {
                self.set_state(ContextState::Failed);
                EcaError::ThreadSpawn {
                    name: self.name().to_string(),
                    source,
                }
            })?;

        *lock(&self.inner.thread) = Some(handle);
        info!(context = %self.name(), "started context");
        Ok(())
    }

    /// Ask the loop to exit after the event in progress.
    ///
    /// Daemon contexts refuse and return `false`.
    pub fn stop(&self) -> bool {
        if self.inner.daemon {
            warn!(context = %self.name(), "refusing to stop daemon context");
            return false;
        }
        self.request_stop();
        true
    }

    /// Stop regardless of the daemon flag. Used by engine shutdown.
    pub(crate) fn request_stop(&self) {
        let transitioned = self
            .inner
            .state
            .compare_exchange(
                ContextState::Running as u8,
                ContextState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        // Never started: there is no loop to notice the flag.
        if self.state() == ContextState::Created {
            self.set_state(ContextState::Stopped);
            self.detach_from_global();
        }

        if transitioned {
            debug!(context = %self.name(), "stop requested");
        }
        self.inner.stop.cancel();
    }

    /// Wait for the loop thread to exit and return how it ended.
    ///
    /// Returns immediately for a context that was never started, was already
    /// joined, or when called from the context's own thread.
    pub fn join(&self) -> Result<()> {
        let handle = {
            let mut slot = lock(&self.inner.thread);
            let own_thread = slot
                .as_ref()
                .is_some_and(|handle| handle.thread().id() == thread::current().id());
            if own_thread {
                return Ok(());
            }
            slot.take()
        };

        match handle {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(EcaError::ContextPanicked {
                    context: self.name().to_string(),
                })
            }),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Dispatch loop
    // =========================================================================

    fn run(self, receiver: QueueReceiver) -> Result<()> {
        let _active = active::switch(self.clone());
        info!(context = %self.name(), daemon = self.inner.daemon, "context loop running");

        let result = catch_unwind(AssertUnwindSafe(|| self.dispatch(receiver))).unwrap_or_else(
            |panic_info| {
                let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                error!(context = %self.name(), panic = %panic_msg, "rule panicked");
                Err(EcaError::ContextPanicked {
                    context: self.name().to_string(),
                })
            },
        );

        self.detach_from_global();
        match &result {
            Ok(()) => {
                self.set_state(ContextState::Stopped);
                info!(context = %self.name(), "context loop stopped");
            }
            Err(e) => {
                self.set_state(ContextState::Failed);
                error!(context = %self.name(), error = %e, "context loop failed");
            }
        }
        result
    }

    fn dispatch(&self, mut receiver: QueueReceiver) -> Result<()> {
        let timers = self.timers();
        let queue_wait = self.inner.engine.config.queue_wait;

        loop {
            if self.is_stop_requested() {
                return Ok(());
            }

            let wake = timers.block_on(async {
                tokio::select! {
                    biased;
                    _ = self.inner.stop.cancelled() => Wake::Stop,
                    received = tokio::time::timeout(queue_wait, receiver.recv()) => match received {
                        Ok(Some(event)) => Wake::Event(event),
                        // The context holds a sender itself, so the queue only
                        // closes if the context is being torn down.
                        Ok(None) => Wake::Stop,
                        Err(_) => Wake::Idle,
                    },
                }
            });

            match wake {
                Wake::Event(event) if !self.is_stop_requested() => self.handle(&event)?,
                Wake::Idle => continue,
                Wake::Event(_) | Wake::Stop => return Ok(()),
            }
        }
    }

    fn handle(&self, event: &Event) -> Result<()> {
        trace!(target: TRACE_TARGET, context = %self.name(), event = %event, "working on event");

        let candidates = self.inner.rules.candidates(event);
        let mut scope = lock(&self.inner.scope);
        for rule in candidates {
            if !rule.matches(&scope, event) {
                continue;
            }
            trace!(
                target: TRACE_TARGET,
                context = %self.name(),
                rule = rule.name(),
                event = %event.name(),
                "running action"
            );
            rule.execute(&mut scope, event)
                .map_err(|source| EcaError::ActionFailed {
                    context: self.name().to_string(),
                    rule: rule.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    fn detach_from_global(&self) {
        if let Some(id) = lock(&self.inner.global_subscription).take() {
            if let Err(e) = self.inner.engine.global.unsubscribe(EVENT_TOPIC, id) {
                warn!(context = %self.name(), error = %e, "failed to leave global channel");
            }
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("daemon", &self.inner.daemon)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
