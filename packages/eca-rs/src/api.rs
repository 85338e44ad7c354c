//! Free functions operating on the calling thread's active context.
//!
//! These are what rule actions and generator producers use. Each one resolves
//! the context bound by [`crate::active`] and fails with
//! [`EcaError::NoActiveContext`](crate::EcaError::NoActiveContext) on a thread
//! with no binding. Every function has a method counterpart on
//! [`Context`] for callers holding a context explicitly.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::active;
use crate::context::{Context, ContextOptions};
use crate::error::Result;

/// Publish an event to the active context.
pub fn fire(name: &str, data: impl Into<Value>) -> Result<()> {
    active::require("fire")?.fire(name, data);
    Ok(())
}

/// Publish an event to the active context after `delay`.
pub fn fire_after(name: &str, data: impl Into<Value>, delay: Duration) -> Result<()> {
    active::require("fire")?.fire_after(name, data, delay);
    Ok(())
}

/// Publish an event to the active context, now or after an optional `delay`.
pub fn fire_with_delay(name: &str, data: impl Into<Value>, delay: Option<Duration>) -> Result<()> {
    active::require("fire")?.fire_with_delay(name, data, delay);
    Ok(())
}

/// Publish an event to every context of the active context's engine.
pub fn fire_global(name: &str, data: impl Into<Value>) -> Result<()> {
    active::require("fire_global")?.fire_global(name, data);
    Ok(())
}

/// Publish an event to every context after `delay`.
pub fn fire_global_after(name: &str, data: impl Into<Value>, delay: Duration) -> Result<()> {
    active::require("fire_global")?.fire_global_after(name, data, delay);
    Ok(())
}

/// Serialize `data` and publish it on the active context's `emit` topic.
pub fn emit<T: Serialize + ?Sized>(name: &str, data: &T, id: Option<&str>) -> Result<()> {
    active::require("emit")?.emit(name, data, id)
}

/// Create and start a context on the active context's engine.
pub fn spawn_context(options: ContextOptions) -> Result<Context> {
    let parent = active::require("spawn a context")?;
    parent.engine().spawn_context(options)
}

/// Shut down the active context's engine.
pub fn shutdown() -> Result<()> {
    active::require("shut down")?.engine().shutdown();
    Ok(())
}

/// Attach a named helper object to the active context.
pub fn register_auxiliary<T: Any + Send + Sync>(name: impl Into<String>, value: Arc<T>) -> Result<()> {
    active::require("register an auxiliary")?.register_auxiliary(name, value);
    Ok(())
}

/// Look up a named helper object on the active context.
pub fn auxiliary<T: Any + Send + Sync>(name: &str) -> Result<Arc<T>> {
    active::require("look up an auxiliary")?.auxiliary(name)
}

/// The active context, if any.
pub fn current_context() -> Option<Context> {
    active::current()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::error::EcaError;
    use crate::testing::{recording_rule, Recorder};
    use serde_json::json;
    use std::time::Instant;

    #[test]
    fn test_free_functions_need_an_active_context() {
        active::reset();
        assert!(matches!(
            fire("ping", json!({"a": 10})),
            Err(EcaError::NoActiveContext { operation: "fire" })
        ));
        assert!(matches!(
            emit("x", &1, None),
            Err(EcaError::NoActiveContext { .. })
        ));
        assert!(matches!(shutdown(), Err(EcaError::NoActiveContext { .. })));
        assert!(auxiliary::<u32>("x").is_err());
        assert!(current_context().is_none());
    }

    #[test]
    fn test_fire_targets_bound_context() {
        let engine =
            Engine::new(EngineConfig::default().with_queue_wait(Duration::from_millis(20))).unwrap();
        let recorder = Arc::new(Recorder::new());
        {
            let recorder = recorder.clone();
            engine.rules().rule("ping").on("ping").action(move |_, event| {
                recorder.record(event.clone());
                Ok(())
            });
        }

        let target = engine.spawn_context(ContextOptions::named("target")).unwrap();
        let _other = engine.spawn_context(ContextOptions::named("other")).unwrap();

        active::with_context(&target, || fire("ping", json!({"a": 10}))).unwrap();

        assert!(recorder.wait_for(1, Duration::from_secs(2)));
        assert!(!recorder.wait_for(2, Duration::from_millis(100)));
    }

    #[test]
    fn test_fire_with_delay_publishes_now_or_later() {
        let engine =
            Engine::new(EngineConfig::default().with_queue_wait(Duration::from_millis(20))).unwrap();
        let recorder = recording_rule(engine.rules(), "record", &["now", "later"]);
        let ctx = engine.spawn_context(ContextOptions::named("main")).unwrap();

        let started = Instant::now();
        active::with_context(&ctx, || {
            fire_with_delay("later", Value::Null, Some(Duration::from_millis(80)))?;
            fire_with_delay("now", Value::Null, None)
        })
        .unwrap();

        assert!(recorder.wait_for(1, Duration::from_secs(2)));
        assert_eq!(recorder.events()[0].name(), "now");
        assert!(recorder.wait_for(2, Duration::from_secs(2)));
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(recorder.events()[1].name(), "later");
    }

    #[test]
    fn test_spawn_from_rule_uses_same_engine() {
        let engine =
            Engine::new(EngineConfig::default().with_queue_wait(Duration::from_millis(20))).unwrap();
        let recorder = Arc::new(Recorder::new());
        engine.rules().rule("spawn").on("spawn").action(|_, _| {
            spawn_context(ContextOptions::named("child").with_init_data(json!({"child": true})))?;
            Ok(())
        });
        {
            let recorder = recorder.clone();
            engine
                .rules()
                .rule("child_init")
                .on("init")
                .when(|_, event| event.get("child").is_some())
                .action(move |_, event| {
                    recorder.record(event.clone());
                    Ok(())
                });
        }

        let parent = engine.spawn_context(ContextOptions::named("parent")).unwrap();
        parent.fire("spawn", Value::Null);

        assert!(recorder.wait_for(1, Duration::from_secs(2)));
        assert_eq!(engine.contexts().len(), 2);
    }
}
