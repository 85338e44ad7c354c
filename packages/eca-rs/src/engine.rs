//! The engine: owner of the shared pieces every context needs.
//!
//! An [`Engine`] holds the process-wide channel, the default rule registry,
//! the configuration and a small tokio runtime that drives delayed publishes
//! and stop waits. Contexts are created through it and keep a reference to its
//! shared core, never to the `Engine` value itself, so dropping the `Engine`
//! is what tears everything down.
//!
//! # Usage
//!
//! ```ignore
//! use eca::{Engine, EngineConfig, ContextOptions};
//! use eca::event::names;
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! engine.rules().rule("hello").on(names::MAIN).action(|_, _| {
//!     println!("hello");
//!     eca::shutdown()?;
//!     Ok(())
//! });
//!
//! let main = engine.spawn_context(ContextOptions::named("main"))?;
//! main.fire(names::MAIN, serde_json::Value::Null);
//! engine.wait_for_shutdown();
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::{Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::{PubSubChannel, EVENT_TOPIC};
use crate::config::EngineConfig;
use crate::context::{Context, ContextOptions, WeakContext};
use crate::error::{EcaError, Result};
use crate::event::Event;
use crate::rule::RuleRegistry;

// =============================================================================
// Engine Core
// =============================================================================

/// State shared by the engine and all of its contexts.
pub(crate) struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) timers: Handle,
    pub(crate) global: PubSubChannel,
    pub(crate) rules: RuleRegistry,
    contexts: Mutex<Vec<WeakContext>>,
    shutdown: CancellationToken,
}

impl EngineCore {
    fn contexts(&self) -> MutexGuard<'_, Vec<WeakContext>> {
        self.contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn context(self: &Arc<Self>, options: ContextOptions) -> Context {
        let context = Context::new(self.clone(), options);
        let mut contexts = self.contexts();
        contexts.retain(|weak| weak.upgrade().is_some());
        contexts.push(context.downgrade());
        context
    }

    pub(crate) fn spawn_context(self: &Arc<Self>, options: ContextOptions) -> Result<Context> {
        if self.shutdown.is_cancelled() {
            warn!(context = %options.name, "spawning context on an engine that is shut down");
        }
        let context = self.context(options);
        context.start()?;
        Ok(context)
    }

    pub(crate) fn live_contexts(&self) -> Vec<Context> {
        self.contexts()
            .iter()
            .filter_map(WeakContext::upgrade)
            .collect()
    }

    pub(crate) fn fire_global(&self, name: &str, data: impl Into<Value>) {
        self.global.publish(EVENT_TOPIC, &Event::new(name, data));
    }

    pub(crate) fn fire_global_after(&self, name: &str, data: impl Into<Value>, delay: Duration) {
        self.global
            .publish_after(EVENT_TOPIC, Event::new(name, data), delay);
    }

    pub(crate) fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let contexts = self.live_contexts();
        info!(contexts = contexts.len(), "engine shutting down");
        for context in &contexts {
            context.request_stop();
        }
        self.shutdown.cancel();
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Owner of the runtime, the global channel and the default rules.
///
/// Dropping the engine shuts it down and joins every context thread.
pub struct Engine {
    core: Arc<EngineCore>,
    runtime: Option<Runtime>,
}

impl Engine {
    /// Create an engine with an empty rule registry.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_rules(config, RuleRegistry::new())
    }

    /// Create an engine whose contexts dispatch against `rules` by default.
    pub fn with_rules(config: EngineConfig, rules: RuleRegistry) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.timer_threads.max(1))
            .thread_name("eca-timer")
            .enable_time()
            .build()
            .map_err(EcaError::Runtime)?;

        let timers = runtime.handle().clone();
        info!(
            queue_wait_ms = config.queue_wait.as_millis() as u64,
            queue_capacity = ?config.queue_capacity,
            timer_threads = config.timer_threads,
            "engine started"
        );

        Ok(Self {
            core: Arc::new(EngineCore {
                global: PubSubChannel::new(timers.clone()),
                timers,
                config,
                rules,
                contexts: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
            runtime: Some(runtime),
        })
    }

    /// Create an engine configured from the environment (and `.env`).
    pub fn from_env() -> anyhow::Result<Self> {
        let config = EngineConfig::from_env()?;
        Ok(Self::new(config)?)
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Default rules of new contexts.
    pub fn rules(&self) -> &RuleRegistry {
        &self.core.rules
    }

    /// The process-wide channel every context listens on.
    pub fn global(&self) -> &PubSubChannel {
        &self.core.global
    }

    /// Create a context without starting it.
    ///
    /// Events fired at it queue up until [`Context::start`] is called.
    pub fn context(&self, options: ContextOptions) -> Context {
        self.core.context(options)
    }

    /// Create and start a context.
    pub fn spawn_context(&self, options: ContextOptions) -> Result<Context> {
        self.core.spawn_context(options)
    }

    /// Contexts created by this engine that are still referenced.
    pub fn contexts(&self) -> Vec<Context> {
        self.core.live_contexts()
    }

    /// Publish an event to every context.
    pub fn fire_global(&self, name: &str, data: impl Into<Value>) {
        self.core.fire_global(name, data);
    }

    /// Publish an event to every context after `delay`.
    pub fn fire_global_after(&self, name: &str, data: impl Into<Value>, delay: Duration) {
        self.core.fire_global_after(name, data, delay);
    }

    /// Stop every context, daemons included, and release
    /// [`Engine::wait_for_shutdown`]. Idempotent.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    /// Whether shutdown was requested.
    pub fn is_shut_down(&self) -> bool {
        self.core.shutdown.is_cancelled()
    }

    /// Block until shutdown is requested, from here or from a rule.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait_for_shutdown(&self) {
        self.core.timers.block_on(self.core.shutdown.cancelled());
    }

    /// Like [`Engine::wait_for_shutdown`] with a deadline. Returns whether
    /// shutdown was requested in time.
    pub fn wait_for_shutdown_timeout(&self, timeout: Duration) -> bool {
        if self.is_shut_down() {
            return true;
        }
        self.core.timers.block_on(async {
            tokio::time::timeout(timeout, self.core.shutdown.cancelled())
                .await
                .is_ok()
        })
    }

    /// Shut down and wait for every context thread, collecting failures.
    pub fn join(&self) -> Vec<EcaError> {
        self.shutdown();
        self.core
            .live_contexts()
            .iter()
            .filter_map(|context| context.join().err())
            .collect()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for error in self.join() {
            warn!(error = %error, "context ended with error");
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.core.config)
            .field("rules", &self.core.rules)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextState;
    use crate::testing::Recorder;
    use serde_json::json;
    use std::thread;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default().with_queue_wait(Duration::from_millis(20))).unwrap()
    }

    #[test]
    fn test_fire_global_reaches_every_context() {
        let engine = engine();
        let recorder = Arc::new(Recorder::new());
        {
            let recorder = recorder.clone();
            engine.rules().rule("tick").on("tick").action(move |_, event| {
                recorder.record(event.clone());
                Ok(())
            });
        }

        engine.spawn_context(ContextOptions::named("a")).unwrap();
        engine.spawn_context(ContextOptions::named("b")).unwrap();
        engine.fire_global("tick", Value::Null);

        assert!(recorder.wait_for(2, Duration::from_secs(2)));
    }

    #[test]
    fn test_stopped_context_leaves_global_channel() {
        let engine = engine();
        let a = engine.spawn_context(ContextOptions::named("a")).unwrap();
        let _b = engine.spawn_context(ContextOptions::named("b")).unwrap();
        assert_eq!(engine.global().subscriber_count(EVENT_TOPIC), 2);

        a.stop();
        a.join().unwrap();
        assert_eq!(engine.global().subscriber_count(EVENT_TOPIC), 1);
    }

    #[test]
    fn test_shutdown_from_rule_releases_waiter() {
        let engine = engine();
        engine.rules().rule("quit").on("quit").action(|_, _| {
            crate::api::shutdown()?;
            Ok(())
        });

        let ctx = engine.spawn_context(ContextOptions::named("main")).unwrap();
        ctx.fire("quit", Value::Null);

        assert!(engine.wait_for_shutdown_timeout(Duration::from_secs(2)));
        assert!(engine.join().is_empty());
        assert_eq!(ctx.state(), ContextState::Stopped);
    }

    #[test]
    fn test_wait_for_shutdown_times_out() {
        let engine = engine();
        assert!(!engine.wait_for_shutdown_timeout(Duration::from_millis(30)));
    }

    #[test]
    fn test_shutdown_stops_daemons_and_unstarted_contexts() {
        let engine = engine();
        let daemon = engine
            .spawn_context(ContextOptions::named("daemon").daemon())
            .unwrap();
        let idle = engine.context(ContextOptions::named("idle"));

        engine.shutdown();
        assert!(engine.join().is_empty());
        assert_eq!(daemon.state(), ContextState::Stopped);
        assert_eq!(idle.state(), ContextState::Stopped);
    }

    #[test]
    fn test_join_reports_failed_contexts() {
        let engine = engine();
        engine
            .rules()
            .rule("fail")
            .on("init")
            .action(|_, _| Err(anyhow::anyhow!("init failed")));

        let ctx = engine.spawn_context(ContextOptions::named("doomed")).unwrap();
        while !ctx.state().is_terminal() {
            thread::sleep(Duration::from_millis(5));
        }

        let errors = engine.join();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], EcaError::ActionFailed { .. }));
    }

    #[test]
    fn test_context_specific_rules() {
        let engine = engine();
        let recorder = Arc::new(Recorder::new());
        let own_rules = RuleRegistry::new();
        {
            let recorder = recorder.clone();
            own_rules.rule("mine").on("ping").action(move |_, event| {
                recorder.record(event.clone());
                Ok(())
            });
        }

        let plain = engine.spawn_context(ContextOptions::named("plain")).unwrap();
        let special = engine
            .spawn_context(ContextOptions::named("special").with_rules(own_rules))
            .unwrap();

        plain.fire("ping", json!({"from": "plain"}));
        special.fire("ping", json!({"from": "special"}));

        assert!(recorder.wait_for(1, Duration::from_secs(2)));
        assert!(!recorder.wait_for(2, Duration::from_millis(100)));
        assert_eq!(recorder.events()[0].get("from"), Some(&json!("special")));
    }

    #[test]
    fn test_dropped_engine_joins_contexts() {
        let engine = engine();
        let ctx = engine.spawn_context(ContextOptions::named("worker")).unwrap();
        drop(engine);
        assert_eq!(ctx.state(), ContextState::Stopped);
    }
}
