//! Shared keyed map with optimistic local editing.

use serde_json::{Map, Value};

use crate::error::OtError;
use crate::operation::{ClientId, MapEntryOp, OpBody, OpFamily, Operation, Version};
use crate::shared::events::{EventRegistry, SharedEvent};
use crate::shared::Snapshot;
use crate::value::apply_map;

/// A collaboratively edited keyed map of JSON values.
pub struct SharedMap {
    client_id: ClientId,
    entries: Map<String, Value>,
    version: Version,
    events: EventRegistry,
}

impl SharedMap {
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self::with_entries(client_id, Map::new())
    }

    pub fn with_entries(client_id: impl Into<ClientId>, entries: Map<String, Value>) -> Self {
        SharedMap {
            client_id: client_id.into(),
            entries,
            version: 0,
            events: EventRegistry::new(),
        }
    }

    /// Current entries (deep copy).
    pub fn entries(&self) -> Map<String, Value> {
        self.entries.clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&SharedEvent) + Send + 'static) {
        self.events.subscribe(listener);
    }

    /// Write `key`, recording the value it replaces.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Result<Operation, OtError> {
        let key = key.into();
        if key.is_empty() {
            return Err(OtError::invalid("map key must not be empty"));
        }
        let previous_value = self.entries.get(&key).cloned();
        let op = Operation::new(
            self.client_id.clone(),
            self.version,
            OpBody::MapSet {
                key,
                value,
                previous_value,
            },
        );
        self.apply(&op)?;
        Ok(op)
    }

    /// Remove `key`. Removing an absent key is accepted and applies as a
    /// no-op so concurrent deletes stay symmetric.
    pub fn delete(&mut self, key: impl Into<String>) -> Result<Operation, OtError> {
        let key = key.into();
        if key.is_empty() {
            return Err(OtError::invalid("map key must not be empty"));
        }
        let previous_value = self.entries.get(&key).cloned();
        let op = Operation::new(
            self.client_id.clone(),
            self.version,
            OpBody::MapDelete {
                key,
                previous_value,
            },
        );
        self.apply(&op)?;
        Ok(op)
    }

    /// Apply several entry edits atomically.
    pub fn batch(&mut self, operations: Vec<MapEntryOp>) -> Result<Operation, OtError> {
        if operations.iter().any(|e| e.key().is_empty()) {
            return Err(OtError::invalid("map key must not be empty"));
        }
        let op = Operation::new(
            self.client_id.clone(),
            self.version,
            OpBody::MapBatch { operations },
        );
        self.apply(&op)?;
        Ok(op)
    }

    /// Remove every key in one atomic batch.
    pub fn clear(&mut self) -> Result<Operation, OtError> {
        let operations = self
            .entries
            .iter()
            .map(|(key, value)| MapEntryOp::Delete {
                key: key.clone(),
                previous_value: Some(value.clone()),
            })
            .collect();
        self.batch(operations)
    }

    /// The single mutation point: applies, emits events, advances version.
    pub fn apply(&mut self, op: &Operation) -> Result<(), OtError> {
        if !matches!(op.body.family(), OpFamily::Map | OpFamily::Neutral) {
            return Err(OtError::KindMismatch {
                op: op.kind(),
                doc: "map",
            });
        }
        let old = self.entries.clone();
        apply_map(&mut self.entries, &op.body)?;

        match &op.body {
            OpBody::MapSet { key, value, .. } => {
                self.events.emit(&SharedEvent::Set {
                    key: key.clone(),
                    value: value.clone(),
                    previous: old.get(key).cloned(),
                });
            }
            OpBody::MapDelete { key, .. } => {
                self.events.emit(&SharedEvent::Unset {
                    key: key.clone(),
                    previous: old.get(key).cloned(),
                });
            }
            OpBody::MapBatch { operations } => {
                self.events.emit(&SharedEvent::Batch {
                    entries: operations.len(),
                });
            }
            _ => {}
        }
        self.events.emit(&SharedEvent::Change {
            new_value: Value::Object(self.entries.clone()),
            old_value: Value::Object(old),
        });
        self.events.emit(&SharedEvent::Operation(op.clone()));

        self.version = self.version.max(op.base_version + 1);
        Ok(())
    }

    pub fn observe_version(&mut self, version: Version) {
        self.version = self.version.max(version);
    }

    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            value: Value::Object(self.entries.clone()),
            version: self.version,
        }
    }

    /// Replace entries and version wholesale. Emits only `Change`.
    pub fn restore(&mut self, snapshot: Snapshot) -> Result<(), OtError> {
        let Value::Object(entries) = snapshot.value else {
            return Err(OtError::InvalidSnapshot("map snapshot must be an object".into()));
        };
        let old = std::mem::replace(&mut self.entries, entries);
        self.version = snapshot.version;
        self.events.emit(&SharedEvent::Change {
            new_value: Value::Object(self.entries.clone()),
            old_value: Value::Object(old),
        });
        Ok(())
    }
}

impl std::fmt::Debug for SharedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMap")
            .field("client_id", &self.client_id)
            .field("version", &self.version)
            .field("len", &self.entries.len())
            .finish()
    }
}
