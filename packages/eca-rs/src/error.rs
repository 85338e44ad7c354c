//! Structured error types for the eca runtime.
//!
//! `EcaError` provides pattern-matchable errors instead of generic `anyhow::Error`
//! for everything the runtime itself can get wrong. Rule actions keep using
//! `anyhow::Result` internally; when an action fails, the error is wrapped in
//! [`EcaError::ActionFailed`] together with the context and rule that raised it.
//!
//! # Propagation Policy
//!
//! - Missing context, unknown rules and absent subscriptions are programmer
//!   errors: they are always surfaced to the caller.
//! - A failing action terminates its own context's thread and nothing else.
//! - Malformed data at a generator boundary never reaches this type; generators
//!   log and skip it.

use thiserror::Error;

use crate::rule::RuleId;

/// Convenience alias used throughout the crate.
pub type Result<T, E = EcaError> = std::result::Result<T, E>;

/// Structured error type for eca operations.
#[derive(Debug, Error)]
pub enum EcaError {
    /// A free function needed the thread's active context but none is bound.
    #[error("cannot {operation} without an active context")]
    NoActiveContext {
        /// The operation that was attempted (e.g. `"fire"`).
        operation: &'static str,
    },

    /// `unsubscribe` was called for a subscription that is not registered.
    #[error("not subscribed to topic '{topic}'")]
    NotSubscribed {
        /// The topic the caller tried to unsubscribe from.
        topic: String,
    },

    /// A rule handle does not belong to this registry.
    #[error("unknown rule {id}")]
    UnknownRule {
        /// The offending handle.
        id: RuleId,
    },

    /// No auxiliary is registered under this name.
    #[error("no auxiliary named '{name}'")]
    AuxiliaryNotFound {
        /// The requested auxiliary name.
        name: String,
    },

    /// An auxiliary exists but is not of the requested type.
    #[error("auxiliary '{name}' is not a {expected}")]
    AuxiliaryTypeMismatch {
        /// The requested auxiliary name.
        name: String,
        /// Type name the caller asked for.
        expected: &'static str,
    },

    /// `start()` was called on a context or generator that already ran.
    #[error("'{name}' has already been started")]
    AlreadyStarted {
        /// Name of the context or generator.
        name: String,
    },

    /// The operating system refused to spawn a thread.
    #[error("failed to spawn thread for '{name}'")]
    ThreadSpawn {
        /// Name of the thread that could not be spawned.
        name: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A generator's producer panicked.
    #[error("generator for '{event}' panicked")]
    GeneratorPanicked {
        /// Name of the events the generator fired.
        event: String,
    },

    /// A replay source could not be opened.
    #[error("failed to open replay source {}", path.display())]
    ReplayOpen {
        /// Path of the source.
        path: std::path::PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The timer runtime could not be built.
    #[error("failed to build timer runtime")]
    Runtime(#[source] std::io::Error),

    /// An emitted payload could not be serialized.
    #[error("failed to encode emitted payload")]
    Encode(#[from] serde_json::Error),

    /// A rule action returned an error, terminating its context.
    #[error("rule '{rule}' failed in context '{context}'")]
    ActionFailed {
        /// Name of the context whose loop terminated.
        context: String,
        /// Name of the rule whose action failed.
        rule: String,
        /// The action's error.
        #[source]
        source: anyhow::Error,
    },

    /// A condition or action panicked, terminating its context.
    #[error("context '{context}' panicked")]
    ContextPanicked {
        /// Name of the context whose thread panicked.
        context: String,
    },
}

impl EcaError {
    pub(crate) fn no_context(operation: &'static str) -> Self {
        EcaError::NoActiveContext { operation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_active_context_display() {
        let err = EcaError::no_context("fire");
        assert_eq!(err.to_string(), "cannot fire without an active context");
    }

    #[test]
    fn test_not_subscribed_display() {
        let err = EcaError::NotSubscribed {
            topic: "message".into(),
        };
        assert!(err.to_string().contains("'message'"));
    }

    #[test]
    fn test_action_failed_keeps_source() {
        let err = EcaError::ActionFailed {
            context: "main".into(),
            rule: "on_ping".into(),
            source: anyhow::anyhow!("boom"),
        };
        assert!(err.to_string().contains("on_ping"));
        assert!(err.to_string().contains("main"));

        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("boom"));
    }

    #[test]
    fn test_error_is_pattern_matchable() {
        let err = EcaError::AuxiliaryTypeMismatch {
            name: "tweeter".into(),
            expected: "EventGenerator",
        };

        match &err {
            EcaError::AuxiliaryTypeMismatch { name, expected } => {
                assert_eq!(name, "tweeter");
                assert_eq!(*expected, "EventGenerator");
            }
            _ => panic!("Expected AuxiliaryTypeMismatch"),
        }
    }

    #[test]
    fn test_error_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = EcaError::no_context("emit").into();
        let eca_err = err.downcast_ref::<EcaError>();
        assert!(matches!(
            eca_err,
            Some(EcaError::NoActiveContext { operation: "emit" })
        ));
    }
}
