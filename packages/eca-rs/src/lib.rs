//! # eca
//!
//! An embeddable Event-Condition-Action rule engine.
//!
//! Programs are written as rules: when an *event* arrives and every
//! *condition* holds, run the *action*. Rules run inside isolated
//! [`Context`]s, each with its own variable [`Scope`], its own FIFO queue and
//! its own thread. Events travel between and within contexts over topic-keyed
//! [`PubSubChannel`]s.
//!
//! ## Architecture
//!
//! ```text
//!  fire() ──► context channel ─┐
//!                              ├──► queue ──► dispatch loop ──► matching actions
//!  fire_global() ──► engine ───┘                  │
//!                    channel                      └──► emit() ──► `emit` topic
//! ```
//!
//! ## Guarantees
//!
//! - **Sequential per context**: actions of one context never overlap, and a
//!   context sees its events in the order they were enqueued.
//! - **No cross-context ordering**: contexts run concurrently.
//! - **Isolation**: a scope is only ever touched by its own context.
//! - **Delays are lower bounds**: a delayed publish is never delivered early.
//! - **Failure is contained**: a failing action ends its own context only.
//!
//! ## Example
//!
//! ```ignore
//! use eca::{ContextOptions, Engine, EngineConfig};
//! use eca::event::names;
//! use serde_json::json;
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! let rules = engine.rules();
//!
//! rules.rule("setup").on(names::INIT).action(|scope, _| {
//!     scope.set("count", 0);
//!     Ok(())
//! });
//!
//! rules.rule("count").on(names::LINE).action(|scope, _| {
//!     let n = scope.get_i64("count").unwrap_or(0);
//!     scope.set("count", n + 1);
//!     Ok(())
//! });
//!
//! rules.rule("done").on(names::END_OF_INPUT).action(|scope, _| {
//!     println!("{} lines", scope.get_i64("count").unwrap_or(0));
//!     eca::shutdown()?;
//!     Ok(())
//! });
//!
//! let main = engine.spawn_context(ContextOptions::named("main"))?;
//! for line in std::io::stdin().lines() {
//!     main.fire(names::LINE, json!(line?));
//! }
//! main.fire(names::END_OF_INPUT, json!({}));
//! engine.wait_for_shutdown();
//! ```

pub mod active;
pub mod api;
pub mod channel;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod generator;
pub mod replay;
pub mod rule;
pub mod scope;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use api::{
    auxiliary, current_context, emit, fire, fire_after, fire_global, fire_global_after,
    fire_with_delay, register_auxiliary, shutdown, spawn_context,
};
pub use channel::{PubSubChannel, SubscriptionId};
pub use config::EngineConfig;
pub use context::{Context, ContextId, ContextOptions, ContextState};
pub use engine::Engine;
pub use error::{EcaError, Result};
pub use event::{EmitEnvelope, Event};
pub use generator::{start_generator, EventGenerator, StopSignal};
pub use rule::{Rule, RuleBuilder, RuleId, RuleRegistry};
pub use scope::Scope;
