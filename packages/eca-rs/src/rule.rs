//! Rules and the registry that holds them.
//!
//! A [`Rule`] is an action guarded by a set of event names and an ordered list
//! of conditions. A rule matches an event iff the event's name is one of the
//! rule's events and every condition holds. A rule without events never matches.
//!
//! # Registration
//!
//! Registration mirrors a declare-then-decorate style: an action is prepared
//! once, returning an opaque [`RuleId`], and events and conditions are attached
//! to that handle afterwards. Attaching is additive: event names are unioned and
//! conditions appended, so the same action can be extended from several places.
//!
//! ```ignore
//! let rules = RuleRegistry::new();
//!
//! let id = rules.prepare_action("fizz_bang", |_scope, event| {
//!     println!("{event}");
//!     Ok(())
//! });
//! rules.event(id, "message")?;
//! rules.condition(id, |scope, _| !scope.get_bool("silent").unwrap_or(false))?;
//!
//! // Or, equivalently:
//! rules
//!     .rule("on_ping")
//!     .on("ping")
//!     .action(|_, event| {
//!         println!("ping with {:?}", event.get("a"));
//!         Ok(())
//!     });
//! ```
//!
//! # Ordering
//!
//! Rules are evaluated in registration order. Dispatch works on a frozen
//! snapshot, so rules registered while a context is dispatching only take
//! effect from the next event on.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::error::{EcaError, Result};
use crate::event::Event;
use crate::scope::Scope;

/// Guard predicate evaluated against a context's scope and the current event.
pub type Condition = Arc<dyn Fn(&Scope, &Event) -> bool + Send + Sync>;

/// Procedure executed when a rule matches.
pub type Action = Arc<dyn Fn(&mut Scope, &Event) -> anyhow::Result<()> + Send + Sync>;

/// Opaque handle identifying a rule inside its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An (events, conditions, action) triple.
#[derive(Clone)]
pub struct Rule {
    id: RuleId,
    name: Arc<str>,
    events: BTreeSet<String>,
    conditions: Vec<Condition>,
    action: Action,
}

impl Rule {
    /// The rule's handle.
    pub fn id(&self) -> RuleId {
        self.id
    }

    /// Human-readable name, used for tracing only.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event names this rule listens to.
    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(String::as_str)
    }

    /// Whether the rule listens to the given event name.
    pub fn listens_to(&self, event_name: &str) -> bool {
        self.events.contains(event_name)
    }

    /// Number of attached conditions.
    pub fn condition_count(&self) -> usize {
        self.conditions.len()
    }

    /// Whether every condition holds, evaluated in registration order.
    pub fn conditions_hold(&self, scope: &Scope, event: &Event) -> bool {
        self.conditions.iter().all(|condition| condition(scope, event))
    }

    /// Full match test: event name and all conditions.
    pub fn matches(&self, scope: &Scope, event: &Event) -> bool {
        self.listens_to(event.name()) && self.conditions_hold(scope, event)
    }

    /// Run the action.
    pub fn execute(&self, scope: &mut Scope, event: &Event) -> anyhow::Result<()> {
        (self.action)(scope, event)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("events", &self.events)
            .field("condition_count", &self.conditions.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Rule Registry
// =============================================================================

#[derive(Default)]
struct RegistryInner {
    rules: RwLock<Vec<Arc<Rule>>>,
    next_id: AtomicU64,
}

/// Shared, cloneable collection of rules.
///
/// Clones share the same rules. Every context dispatching against a registry
/// reads it concurrently; registration takes a write lock and replaces the
/// affected rule, so readers holding a snapshot never observe a half-updated
/// rule.
#[derive(Clone, Default)]
pub struct RuleRegistry {
    inner: Arc<RegistryInner>,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Rule>>> {
        self.inner
            .rules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Rule>>> {
        self.inner
            .rules
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an action with no events and no conditions yet.
    ///
    /// The rule cannot match until at least one event is attached via
    /// [`RuleRegistry::event`].
    pub fn prepare_action<F>(&self, name: impl Into<Arc<str>>, action: F) -> RuleId
    where
        F: Fn(&mut Scope, &Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = RuleId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        info!(rule = %name, %id, "defined action");

        self.write().push(Arc::new(Rule {
            id,
            name,
            events: BTreeSet::new(),
            conditions: Vec::new(),
            action: Arc::new(action),
        }));
        id
    }

    /// Attach the rule to an event name. Repeated calls union the names.
    pub fn event(&self, id: RuleId, event_name: impl Into<String>) -> Result<()> {
        let event_name = event_name.into();
        self.modify(id, |rule| {
            debug!(rule = %rule.name, event = %event_name, "attached to event");
            rule.events.insert(event_name);
        })
    }

    /// Append a condition to the rule.
    pub fn condition<F>(&self, id: RuleId, condition: F) -> Result<()>
    where
        F: Fn(&Scope, &Event) -> bool + Send + Sync + 'static,
    {
        self.modify(id, |rule| {
            rule.conditions.push(Arc::new(condition));
            debug!(
                rule = %rule.name,
                condition_count = rule.conditions.len(),
                "added condition"
            );
        })
    }

    fn modify(&self, id: RuleId, f: impl FnOnce(&mut Rule)) -> Result<()> {
        let mut rules = self.write();
        let slot = rules
            .iter_mut()
            .find(|rule| rule.id == id)
            .ok_or(EcaError::UnknownRule { id })?;
        f(Arc::make_mut(slot));
        Ok(())
    }

    /// Start building a rule fluently.
    pub fn rule(&self, name: impl Into<Arc<str>>) -> RuleBuilder<'_> {
        RuleBuilder {
            registry: self,
            name: name.into(),
            events: Vec::new(),
            conditions: Vec::new(),
        }
    }

    /// Look up a rule by handle.
    pub fn get(&self, id: RuleId) -> Option<Arc<Rule>> {
        self.read().iter().find(|rule| rule.id == id).cloned()
    }

    /// Frozen copy of the rule set, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<Rule>> {
        self.read().clone()
    }

    /// Rules that listen to the event's name, in registration order.
    ///
    /// Conditions are not evaluated here; they depend on the scope at the
    /// moment each action is about to run.
    pub fn candidates(&self, event: &Event) -> Vec<Arc<Rule>> {
        self.read()
            .iter()
            .filter(|rule| rule.listens_to(event.name()))
            .cloned()
            .collect()
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no rule is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("rule_count", &self.len())
            .finish()
    }
}

// =============================================================================
// Rule Builder
// =============================================================================

/// Fluent sugar over `prepare_action` + `event` + `condition`.
#[must_use = "a rule is only registered once `action` is called"]
pub struct RuleBuilder<'a> {
    registry: &'a RuleRegistry,
    name: Arc<str>,
    events: Vec<String>,
    conditions: Vec<Condition>,
}

impl RuleBuilder<'_> {
    /// Listen to an event name.
    pub fn on(mut self, event_name: impl Into<String>) -> Self {
        self.events.push(event_name.into());
        self
    }

    /// Add a guard condition.
    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Scope, &Event) -> bool + Send + Sync + 'static,
    {
        self.conditions.push(Arc::new(condition));
        self
    }

    /// Register the rule with its action and return its handle.
    pub fn action<F>(self, action: F) -> RuleId
    where
        F: Fn(&mut Scope, &Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let RuleBuilder {
            registry,
            name,
            events,
            conditions,
        } = self;

        let id = registry.prepare_action(name, action);
        let mut rules = registry.write();
        if let Some(slot) = rules.iter_mut().find(|rule| rule.id == id) {
            let rule = Arc::make_mut(slot);
            rule.events.extend(events);
            rule.conditions.extend(conditions);
        }
        id
    }
}
