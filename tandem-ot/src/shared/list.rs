//! Shared ordered list with optimistic local editing.

use serde_json::Value;

use crate::error::OtError;
use crate::operation::{ClientId, OpBody, OpFamily, Operation, Version};
use crate::shared::events::{EventRegistry, SharedEvent};
use crate::shared::Snapshot;
use crate::value::apply_list;

/// A collaboratively edited ordered list of JSON items.
pub struct SharedList {
    client_id: ClientId,
    items: Vec<Value>,
    version: Version,
    events: EventRegistry,
}

impl SharedList {
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self::with_items(client_id, Vec::new())
    }

    pub fn with_items(client_id: impl Into<ClientId>, items: Vec<Value>) -> Self {
        SharedList {
            client_id: client_id.into(),
            items,
            version: 0,
            events: EventRegistry::new(),
        }
    }

    /// Current items (deep copy).
    pub fn items(&self) -> Vec<Value> {
        self.items.clone()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
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

    pub fn insert(&mut self, index: usize, item: Value) -> Result<Operation, OtError> {
        if index > self.items.len() {
            return Err(OtError::invalid(format!(
                "insert index {index} beyond length {}",
                self.items.len()
            )));
        }
        let op = Operation::new(
            self.client_id.clone(),
            self.version,
            OpBody::ListInsert { index, item },
        );
        self.apply(&op)?;
        Ok(op)
    }

    pub fn push(&mut self, item: Value) -> Result<Operation, OtError> {
        self.insert(self.items.len(), item)
    }

    pub fn delete(&mut self, index: usize, count: usize) -> Result<Operation, OtError> {
        if count == 0 {
            return Err(OtError::invalid("delete count must be positive"));
        }
        if index + count > self.items.len() {
            return Err(OtError::invalid(format!(
                "delete range {}..{} beyond length {}",
                index,
                index + count,
                self.items.len()
            )));
        }
        let op = Operation::new(
            self.client_id.clone(),
            self.version,
            OpBody::ListDelete { index, count },
        );
        self.apply(&op)?;
        Ok(op)
    }

    pub fn replace(&mut self, index: usize, item: Value) -> Result<Operation, OtError> {
        if index >= self.items.len() {
            return Err(OtError::invalid(format!(
                "replace index {index} beyond length {}",
                self.items.len()
            )));
        }
        let old_item = self.items.get(index).cloned();
        let op = Operation::new(
            self.client_id.clone(),
            self.version,
            OpBody::ListReplace {
                index,
                item,
                old_item,
            },
        );
        self.apply(&op)?;
        Ok(op)
    }

    pub fn move_item(&mut self, index: usize, target_index: usize) -> Result<Operation, OtError> {
        if index == target_index {
            return Err(OtError::invalid("move source equals target"));
        }
        if index >= self.items.len() || target_index >= self.items.len() {
            return Err(OtError::invalid(format!(
                "move {index}->{target_index} beyond length {}",
                self.items.len()
            )));
        }
        let op = Operation::new(
            self.client_id.clone(),
            self.version,
            OpBody::ListMove {
                index,
                target_index,
            },
        );
        self.apply(&op)?;
        Ok(op)
    }

    /// The single mutation point: applies, emits events, advances version.
    pub fn apply(&mut self, op: &Operation) -> Result<(), OtError> {
        if !matches!(op.body.family(), OpFamily::List | OpFamily::Neutral) {
            return Err(OtError::KindMismatch {
                op: op.kind(),
                doc: "list",
            });
        }
        let old = self.items.clone();
        apply_list(&mut self.items, &op.body)?;

        match &op.body {
            OpBody::ListInsert { index, item } => {
                self.events.emit(&SharedEvent::Insert {
                    position: *index,
                    content: item.clone(),
                });
            }
            OpBody::ListDelete { index, count } if *count > 0 => {
                self.events.emit(&SharedEvent::Delete {
                    position: *index,
                    count: *count,
                });
            }
            OpBody::ListReplace {
                index,
                item,
                old_item,
            } => {
                self.events.emit(&SharedEvent::Replace {
                    index: *index,
                    item: item.clone(),
                    old_item: old_item.clone(),
                });
            }
            OpBody::ListMove {
                index,
                target_index,
            } => {
                self.events.emit(&SharedEvent::Move {
                    index: *index,
                    target_index: *target_index,
                });
            }
            _ => {}
        }
        self.events.emit(&SharedEvent::Change {
            new_value: Value::Array(self.items.clone()),
            old_value: Value::Array(old),
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
            value: Value::Array(self.items.clone()),
            version: self.version,
        }
    }

    /// Replace items and version wholesale. Emits only `Change`.
    pub fn restore(&mut self, snapshot: Snapshot) -> Result<(), OtError> {
        let Value::Array(items) = snapshot.value else {
            return Err(OtError::InvalidSnapshot("list snapshot must be an array".into()));
        };
        let old = std::mem::replace(&mut self.items, items);
        self.version = snapshot.version;
        self.events.emit(&SharedEvent::Change {
            new_value: Value::Array(self.items.clone()),
            old_value: Value::Array(old),
        });
        Ok(())
    }
}

impl std::fmt::Debug for SharedList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedList")
            .field("client_id", &self.client_id)
            .field("version", &self.version)
            .field("len", &self.items.len())
            .finish()
    }
}
