//! Named events and their payloads.
//!
//! An [`Event`] is a name plus arbitrary JSON data. Once constructed it is never
//! mutated: the data lives behind an `Arc` and every receiver shares the same
//! allocation. There is no implicit schema; what the data means is a contract
//! between the rule that fires an event and the rules that consume it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event names with a reserved meaning.
pub mod names {
    /// Fired automatically when a context is constructed.
    pub const INIT: &str = "init";
    /// Fired once by a top-level driver after startup.
    pub const MAIN: &str = "main";
    /// Fired once per line of external input.
    pub const LINE: &str = "line";
    /// Fired once when external input is exhausted.
    pub const END_OF_INPUT: &str = "end-of-input";
}

/// A named, immutable payload consumed by rules.
#[derive(Clone, PartialEq)]
pub struct Event {
    name: Arc<str>,
    data: Arc<Value>,
}

impl Event {
    /// Create an event. `null` data is normalized to an empty mapping.
    pub fn new(name: impl Into<Arc<str>>, data: impl Into<Value>) -> Self {
        let data = match data.into() {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        Self {
            name: name.into(),
            data: Arc::new(data),
        }
    }

    /// Create an event without data.
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, Value::Null)
    }

    /// The event name rules are matched against.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The event payload.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Read one field of mapping data. Returns `None` for opaque payloads.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.as_object().and_then(|map| map.get(key))
    }

    /// Deserialize the payload into a concrete type.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(self.data.as_ref())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' with {{", self.name)?;
        match self.data.as_ref() {
            Value::Object(map) => {
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}={v}")?;
                }
            }
            other => write!(f, "{other}")?,
        }
        f.write_str("}")
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("data", &self.data)
            .finish()
    }
}

/// Payload of an event published on a context's `emit` topic.
///
/// The data is serialized once by the emitter so external observers (such as a
/// server-sent-events bridge) can forward it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitEnvelope {
    /// JSON-encoded payload.
    pub json: String,
    /// Optional client-side identifier.
    pub id: Option<String>,
}
