//! Shared text value with optimistic local editing.

use serde_json::Value;

use crate::diff::text_diff;
use crate::error::OtError;
use crate::operation::{Attributes, ClientId, OpBody, OpFamily, Operation, Version};
use crate::shared::events::{EventRegistry, SharedEvent};
use crate::shared::Snapshot;
use crate::value::{apply_text, char_count};

/// A collaboratively edited string.
///
/// Local mutators validate their arguments, build an operation based on the
/// current version, apply it through the single [`apply`](Self::apply) path
/// and hand it back for shipment to the coordinator. Remote operations
/// arrive through the same `apply` path after transformation.
pub struct SharedText {
    client_id: ClientId,
    value: String,
    version: Version,
    events: EventRegistry,
}

impl SharedText {
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self::with_value(client_id, String::new())
    }

    pub fn with_value(client_id: impl Into<ClientId>, value: impl Into<String>) -> Self {
        SharedText {
            client_id: client_id.into(),
            value: value.into(),
            version: 0,
            events: EventRegistry::new(),
        }
    }

    /// Current content (deep copy).
    pub fn value(&self) -> String {
        self.value.clone()
    }

    /// Length in Unicode scalar values.
    pub fn len(&self) -> usize {
        char_count(&self.value)
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
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

    /// Insert `text` before `position`, returning the operation to ship.
    pub fn insert(&mut self, position: usize, text: impl Into<String>) -> Result<Operation, OtError> {
        self.insert_with_attributes(position, text, None)
    }

    pub fn insert_with_attributes(
        &mut self,
        position: usize,
        text: impl Into<String>,
        attributes: Option<Attributes>,
    ) -> Result<Operation, OtError> {
        let text = text.into();
        if text.is_empty() {
            return Err(OtError::invalid("insert text must not be empty"));
        }
        if position > self.len() {
            return Err(OtError::invalid(format!(
                "insert position {position} beyond length {}",
                self.len()
            )));
        }
        let op = Operation::new(
            self.client_id.clone(),
            self.version,
            OpBody::TextInsert {
                position,
                text,
                attributes,
            },
        );
        self.apply(&op)?;
        Ok(op)
    }

    /// Remove `length` characters starting at `position`.
    pub fn delete(&mut self, position: usize, length: usize) -> Result<Operation, OtError> {
        if length == 0 {
            return Err(OtError::invalid("delete length must be positive"));
        }
        if position + length > self.len() {
            return Err(OtError::invalid(format!(
                "delete range {}..{} beyond length {}",
                position,
                position + length,
                self.len()
            )));
        }
        let op = Operation::new(
            self.client_id.clone(),
            self.version,
            OpBody::TextDelete { position, length },
        );
        self.apply(&op)?;
        Ok(op)
    }

    /// Positional no-op carrying attributes over a range.
    pub fn retain(
        &mut self,
        position: usize,
        length: usize,
        attributes: Option<Attributes>,
    ) -> Result<Operation, OtError> {
        if position + length > self.len() {
            return Err(OtError::invalid(format!(
                "retain range {}..{} beyond length {}",
                position,
                position + length,
                self.len()
            )));
        }
        let op = Operation::new(
            self.client_id.clone(),
            self.version,
            OpBody::TextRetain {
                position,
                length,
                attributes,
            },
        );
        self.apply(&op)?;
        Ok(op)
    }

    /// Replace the whole content, emitting the minimal operation sequence:
    /// at most one delete followed by one insert. The insert is based on
    /// the version after the delete has applied.
    pub fn set_value(&mut self, new_value: impl Into<String>) -> Result<Vec<Operation>, OtError> {
        let new_value = new_value.into();
        let (position, deleted, inserted) = text_diff(&self.value, &new_value);
        let mut ops = Vec::with_capacity(2);
        if deleted > 0 {
            ops.push(self.delete(position, deleted)?);
        }
        if !inserted.is_empty() {
            ops.push(self.insert(position, inserted)?);
        }
        Ok(ops)
    }

    /// The single mutation point: applies, emits events, advances version.
    pub fn apply(&mut self, op: &Operation) -> Result<(), OtError> {
        if !matches!(op.body.family(), OpFamily::Text | OpFamily::Neutral) {
            return Err(OtError::KindMismatch {
                op: op.kind(),
                doc: "text",
            });
        }
        let old = self.value.clone();
        apply_text(&mut self.value, &op.body)?;

        match &op.body {
            OpBody::TextInsert { position, text, .. } => {
                self.events.emit(&SharedEvent::Insert {
                    position: *position,
                    content: Value::String(text.clone()),
                });
            }
            OpBody::TextDelete { position, length } if *length > 0 => {
                self.events.emit(&SharedEvent::Delete {
                    position: *position,
                    count: *length,
                });
            }
            _ => {}
        }
        self.events.emit(&SharedEvent::Change {
            new_value: Value::String(self.value.clone()),
            old_value: Value::String(old),
        });
        self.events.emit(&SharedEvent::Operation(op.clone()));

        self.version = self.version.max(op.base_version + 1);
        Ok(())
    }

    /// Record a server-assigned version without changing content.
    pub fn observe_version(&mut self, version: Version) {
        self.version = self.version.max(version);
    }

    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            value: Value::String(self.value.clone()),
            version: self.version,
        }
    }

    /// Replace value and version wholesale. Emits only `Change`.
    pub fn restore(&mut self, snapshot: Snapshot) -> Result<(), OtError> {
        let Value::String(new_value) = snapshot.value else {
            return Err(OtError::InvalidSnapshot("text snapshot must be a string".into()));
        };
        let old = std::mem::replace(&mut self.value, new_value);
        self.version = snapshot.version;
        self.events.emit(&SharedEvent::Change {
            new_value: Value::String(self.value.clone()),
            old_value: Value::String(old),
        });
        Ok(())
    }
}

impl std::fmt::Debug for SharedText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedText")
            .field("client_id", &self.client_id)
            .field("version", &self.version)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_local_edits_advance_version_and_return_ops() {
        let mut text = SharedText::new("alice");
        let op1 = text.insert(0, "hello").unwrap();
        assert_eq!(op1.base_version, 0);
        assert_eq!(text.version(), 1);
        let op2 = text.delete(0, 2).unwrap();
        assert_eq!(op2.base_version, 1);
        assert_eq!(text.version(), 2);
        assert_eq!(text.value(), "llo");
    }

    #[test]
    fn test_validation_failures_leave_state_untouched() {
        let mut text = SharedText::with_value("alice", "ab");
        assert!(text.insert(3, "x").is_err());
        assert!(text.insert(0, "").is_err());
        assert!(text.delete(0, 0).is_err());
        assert!(text.delete(1, 5).is_err());
        assert_eq!(text.value(), "ab");
        assert_eq!(text.version(), 0);
    }

    #[test]
    fn test_remote_apply_uses_max_version() {
        let mut text = SharedText::with_value("alice", "abc");
        text.observe_version(5);
        // A late-arriving rebased op with an old base must not move the
        // version backwards.
        let old_op = Operation::new("bob", 2, OpBody::TextInsert {
            position: 0,
            text: "x".into(),
            attributes: None,
        });
        text.apply(&old_op).unwrap();
        assert_eq!(text.version(), 5);
        let newer = Operation::new("bob", 9, OpBody::TextInsert {
            position: 0,
            text: "y".into(),
            attributes: None,
        });
        text.apply(&newer).unwrap();
        assert_eq!(text.version(), 10);
    }

    #[test]
    fn test_events_fire_granular_then_change_then_operation() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut text = SharedText::new("alice");
        {
            let order = order.clone();
            text.subscribe(move |ev| {
                let tag = match ev {
                    SharedEvent::Insert { .. } => "insert",
                    SharedEvent::Change { .. } => "change",
                    SharedEvent::Operation(_) => "operation",
                    _ => "other",
                };
                order.lock().unwrap().push(tag);
            });
        }
        text.insert(0, "hi").unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["insert", "change", "operation"]);
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_value_and_version() {
        let mut text = SharedText::new("alice");
        text.insert(0, "state").unwrap();
        let snap = text.to_snapshot();

        let mut other = SharedText::new("bob");
        other.restore(snap).unwrap();
        assert_eq!(other.value(), "state");
        assert_eq!(other.version(), 1);
        // Idempotent through another round.
        let again = other.to_snapshot();
        assert_eq!(again.value, Value::String("state".into()));
        assert_eq!(again.version, 1);
    }

    #[test]
    fn test_restore_emits_only_change() {
        let tags = Arc::new(Mutex::new(Vec::new()));
        let mut text = SharedText::with_value("alice", "old");
        {
            let tags = tags.clone();
            text.subscribe(move |ev| {
                tags.lock().unwrap().push(match ev {
                    SharedEvent::Change { .. } => "change",
                    _ => "other",
                });
            });
        }
        text.restore(Snapshot {
            value: Value::String("new".into()),
            version: 7,
        })
        .unwrap();
        assert_eq!(*tags.lock().unwrap(), vec!["change"]);
        assert_eq!(text.version(), 7);
    }

    #[test]
    fn test_set_value_emits_delete_then_insert_with_advancing_base() {
        let mut text = SharedText::with_value("alice", "the cat sat");
        let ops = text.set_value("the dog sat").unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind(), "text-delete");
        assert_eq!(ops[1].kind(), "text-insert");
        // The insert accounts for the delete having applied first.
        assert_eq!(ops[1].base_version, ops[0].base_version + 1);
        assert_eq!(text.value(), "the dog sat");
    }

    #[test]
    fn test_set_value_no_change_is_empty() {
        let mut text = SharedText::with_value("alice", "same");
        assert!(text.set_value("same").unwrap().is_empty());
        assert_eq!(text.version(), 0);
    }
}
