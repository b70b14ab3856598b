//! Stateful shared data types built on the operation algebra.
//!
//! Each type holds `(value, version, clientId)`, exposes validating
//! mutators that return shippable operations, and rehydrates from opaque
//! snapshots. [`SharedDoc`] is the schema-indexed union used by sessions
//! that hold documents of any kind.

pub mod events;
pub mod list;
pub mod map;
pub mod text;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OtError;
use crate::operation::{ClientId, Operation, Version};
use crate::value::Schema;

pub use events::{EventRegistry, SharedEvent};
pub use list::SharedList;
pub use map::SharedMap;
pub use text::SharedText;

/// Opaque state capture: full value plus the version it was taken at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub value: Value,
    pub version: Version,
}

/// Schema-indexed shared document.
pub enum SharedDoc {
    Text(SharedText),
    List(SharedList),
    Map(SharedMap),
}

impl SharedDoc {
    pub fn new(schema: Schema, client_id: impl Into<ClientId>) -> Self {
        match schema {
            Schema::Text => SharedDoc::Text(SharedText::new(client_id)),
            Schema::List => SharedDoc::List(SharedList::new(client_id)),
            Schema::Map => SharedDoc::Map(SharedMap::new(client_id)),
        }
    }

    pub fn schema(&self) -> Schema {
        match self {
            SharedDoc::Text(_) => Schema::Text,
            SharedDoc::List(_) => Schema::List,
            SharedDoc::Map(_) => Schema::Map,
        }
    }

    pub fn version(&self) -> Version {
        match self {
            SharedDoc::Text(t) => t.version(),
            SharedDoc::List(l) => l.version(),
            SharedDoc::Map(m) => m.version(),
        }
    }

    pub fn value_json(&self) -> Value {
        match self {
            SharedDoc::Text(t) => Value::String(t.value()),
            SharedDoc::List(l) => Value::Array(l.items()),
            SharedDoc::Map(m) => Value::Object(m.entries()),
        }
    }

    pub fn apply(&mut self, op: &Operation) -> Result<(), OtError> {
        match self {
            SharedDoc::Text(t) => t.apply(op),
            SharedDoc::List(l) => l.apply(op),
            SharedDoc::Map(m) => m.apply(op),
        }
    }

    pub fn observe_version(&mut self, version: Version) {
        match self {
            SharedDoc::Text(t) => t.observe_version(version),
            SharedDoc::List(l) => l.observe_version(version),
            SharedDoc::Map(m) => m.observe_version(version),
        }
    }

    pub fn to_snapshot(&self) -> Snapshot {
        match self {
            SharedDoc::Text(t) => t.to_snapshot(),
            SharedDoc::List(l) => l.to_snapshot(),
            SharedDoc::Map(m) => m.to_snapshot(),
        }
    }

    pub fn restore(&mut self, snapshot: Snapshot) -> Result<(), OtError> {
        match self {
            SharedDoc::Text(t) => t.restore(snapshot),
            SharedDoc::List(l) => l.restore(snapshot),
            SharedDoc::Map(m) => m.restore(snapshot),
        }
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&SharedEvent) + Send + 'static) {
        match self {
            SharedDoc::Text(t) => t.subscribe(listener),
            SharedDoc::List(l) => l.subscribe(listener),
            SharedDoc::Map(m) => m.subscribe(listener),
        }
    }

    pub fn as_text_mut(&mut self) -> Option<&mut SharedText> {
        match self {
            SharedDoc::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut SharedList> {
        match self {
            SharedDoc::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut SharedMap> {
        match self {
            SharedDoc::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl std::fmt::Debug for SharedDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDoc")
            .field("schema", &self.schema().as_str())
            .field("version", &self.version())
            .finish()
    }
}
