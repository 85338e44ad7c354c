//! Thread-scoped "current context" binding.
//!
//! Rule actions, generator threads and top-level drivers call [`crate::fire`]
//! and friends without passing a context around. Those free functions resolve
//! the context bound to the calling thread here.
//!
//! Each context loop binds itself for its whole lifetime, and so does each
//! generator thread. Timer tasks delivering delayed publishes never bind: they
//! only enqueue, they do not fire.
//!
//! The interface: [`current`], [`activate`], the scoped
//! [`switch`] guard and [`reset`] for tests that simulate several contexts on
//! one thread.

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::context::Context;
use crate::error::{EcaError, Result};

thread_local! {
    static ACTIVE: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// The context bound to the calling thread, if any.
pub fn current() -> Option<Context> {
    ACTIVE.with(|active| active.borrow().clone())
}

/// Bind `context` (or nothing) to the calling thread, returning the previous
/// binding.
pub fn activate(context: Option<Context>) -> Option<Context> {
    ACTIVE.with(|active| active.replace(context))
}

/// Clear the calling thread's binding.
pub fn reset() {
    activate(None);
}

/// Bind `context` until the returned guard is dropped.
///
/// The previous binding is restored on drop, including during unwinding, so
/// switches nest.
pub fn switch(context: Context) -> ContextGuard {
    ContextGuard {
        previous: activate(Some(context)),
        _thread_bound: PhantomData,
    }
}

/// Run `f` with `context` bound to the calling thread.
pub fn with_context<R>(context: &Context, f: impl FnOnce() -> R) -> R {
    let _guard = switch(context.clone());
    f()
}

pub(crate) fn require(operation: &'static str) -> Result<Context> {
    current().ok_or_else(|| EcaError::no_context(operation))
}

/// RAII guard restoring the previous binding on drop.
///
/// Not `Send`: it must be dropped on the thread that created it.
#[must_use = "the previous context is restored as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<Context>,
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        activate(self.previous.take());
    }
}

impl std::fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextGuard")
            .field("previous", &self.previous.as_ref().map(Context::name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextOptions;
    use crate::engine::Engine;
    use crate::EngineConfig;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_unbound_thread_has_no_context() {
        reset();
        assert!(current().is_none());
        assert!(matches!(
            require("fire"),
            Err(EcaError::NoActiveContext { operation: "fire" })
        ));
    }

    #[test]
    fn test_switches_nest_and_restore() {
        reset();
        let engine = engine();
        let outer = engine.context(ContextOptions::named("outer"));
        let inner = engine.context(ContextOptions::named("inner"));

        {
            let _outer = switch(outer.clone());
            assert_eq!(current().map(|c| c.id()), Some(outer.id()));
            {
                let _inner = switch(inner.clone());
                assert_eq!(current().map(|c| c.id()), Some(inner.id()));
            }
            assert_eq!(current().map(|c| c.id()), Some(outer.id()));
        }
        assert!(current().is_none());
    }

    #[test]
    fn test_switch_restores_on_panic() {
        reset();
        let engine = engine();
        let ctx = engine.context(ContextOptions::named("panicky"));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            with_context(&ctx, || panic!("boom"))
        }));

        assert!(result.is_err());
        assert!(current().is_none());
    }

    #[test]
    fn test_activate_returns_previous() {
        reset();
        let engine = engine();
        let a = engine.context(ContextOptions::named("a"));
        let b = engine.context(ContextOptions::named("b"));

        assert!(activate(Some(a.clone())).is_none());
        let previous = activate(Some(b));
        assert_eq!(previous.map(|c| c.id()), Some(a.id()));
        reset();
    }

    #[test]
    fn test_binding_is_per_thread() {
        reset();
        let engine = engine();
        let ctx = engine.context(ContextOptions::named("local"));
        let _guard = switch(ctx);

        let seen_elsewhere = std::thread::spawn(|| current().is_some()).join().unwrap();
        assert!(!seen_elsewhere);
        assert!(current().is_some());
    }
}
