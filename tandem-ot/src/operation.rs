//! Operation model: the tagged union of edits that flows between peers.
//!
//! On the wire an operation is a flat JSON record:
//!
//! ```text
//! { id, clientId, baseVersion, type, timestamp,
//!   position?, text?, length?, index?, item?, count?, targetIndex?,
//!   key?, value?, previousValue?, oldItem?, operations?, attributes? }
//! ```
//!
//! Internally the payload is a typed [`OpBody`] so that transform and apply
//! dispatch over the tag with exhaustive matching. Fields the decoder does
//! not recognize are kept in [`Operation::extra`] and written back verbatim
//! on encode, so peers running newer protocol revisions can round-trip
//! through this node.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::OtError;

/// Unique id of a single operation.
pub type OperationId = String;
/// Unique id of a document.
pub type DocumentId = String;
/// Unique id of a client (connection-scoped author identity).
pub type ClientId = String;
/// Monotonically increasing per-document version.
pub type Version = u64;
/// Opaque attribute map carried by text insert/retain operations.
pub type Attributes = Map<String, Value>;

/// Milliseconds since the Unix epoch (author clock).
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Identifiers are opaque non-empty strings over `[A-Za-z0-9_-]`.
pub fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Generate a fresh operation id.
pub fn generate_operation_id() -> OperationId {
    format!("op-{}", Uuid::new_v4().simple())
}

/// Generate a fresh client id in the `client-<ms>-<rand>` shape the
/// coordinator mints for anonymous connections.
pub fn generate_client_id() -> ClientId {
    let rand = Uuid::new_v4().simple().to_string();
    format!("client-{}-{}", now_millis(), &rand[..8])
}

/// A single edit, addressed at the document version its author observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireOperation", into = "WireOperation")]
pub struct Operation {
    pub id: OperationId,
    pub client_id: ClientId,
    /// The document version the author saw when constructing this edit.
    pub base_version: Version,
    /// Author wall clock, ms since epoch. Used only for tie-breaking.
    pub timestamp: u64,
    pub body: OpBody,
    /// Unrecognized wire fields, preserved across transform and apply.
    pub extra: Map<String, Value>,
}

/// Typed operation payload, one variant per wire tag.
#[derive(Debug, Clone, PartialEq)]
pub enum OpBody {
    TextInsert {
        position: usize,
        text: String,
        attributes: Option<Attributes>,
    },
    TextDelete {
        position: usize,
        length: usize,
    },
    /// Positional no-op reserved for attribute application.
    TextRetain {
        position: usize,
        length: usize,
        attributes: Option<Attributes>,
    },
    ListInsert {
        index: usize,
        item: Value,
    },
    ListDelete {
        index: usize,
        count: usize,
    },
    ListReplace {
        index: usize,
        item: Value,
        old_item: Option<Value>,
    },
    ListMove {
        index: usize,
        target_index: usize,
    },
    MapSet {
        key: String,
        value: Value,
        previous_value: Option<Value>,
    },
    MapDelete {
        key: String,
        previous_value: Option<Value>,
    },
    /// Atomic group of same-document map entry edits.
    MapBatch {
        operations: Vec<MapEntryOp>,
    },
    /// An operation neutralized by transformation. Applied as identity but
    /// still consumes a version slot so peers stay version-aligned.
    Noop,
}

/// Lightweight entry inside a `map-batch`; the enclosing operation owns the
/// id, author and base version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum MapEntryOp {
    #[serde(rename = "map-set")]
    Set {
        key: String,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_value: Option<Value>,
    },
    #[serde(rename = "map-delete")]
    Delete {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_value: Option<Value>,
    },
}

impl MapEntryOp {
    pub fn key(&self) -> &str {
        match self {
            MapEntryOp::Set { key, .. } | MapEntryOp::Delete { key, .. } => key,
        }
    }
}

/// Which value kind an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFamily {
    Text,
    List,
    Map,
    /// Noop belongs to no family and composes with everything.
    Neutral,
}

impl OpBody {
    /// Wire tag for this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            OpBody::TextInsert { .. } => "text-insert",
            OpBody::TextDelete { .. } => "text-delete",
            OpBody::TextRetain { .. } => "text-retain",
            OpBody::ListInsert { .. } => "list-insert",
            OpBody::ListDelete { .. } => "list-delete",
            OpBody::ListReplace { .. } => "list-replace",
            OpBody::ListMove { .. } => "list-move",
            OpBody::MapSet { .. } => "map-set",
            OpBody::MapDelete { .. } => "map-delete",
            OpBody::MapBatch { .. } => "map-batch",
            OpBody::Noop => "noop",
        }
    }

    pub fn family(&self) -> OpFamily {
        match self {
            OpBody::TextInsert { .. } | OpBody::TextDelete { .. } | OpBody::TextRetain { .. } => {
                OpFamily::Text
            }
            OpBody::ListInsert { .. }
            | OpBody::ListDelete { .. }
            | OpBody::ListReplace { .. }
            | OpBody::ListMove { .. } => OpFamily::List,
            OpBody::MapSet { .. } | OpBody::MapDelete { .. } | OpBody::MapBatch { .. } => {
                OpFamily::Map
            }
            OpBody::Noop => OpFamily::Neutral,
        }
    }

    /// True when applying this payload cannot change any value.
    pub fn is_noop(&self) -> bool {
        match self {
            OpBody::Noop => true,
            OpBody::TextInsert { text, .. } => text.is_empty(),
            OpBody::TextDelete { length, .. } => *length == 0,
            OpBody::TextRetain { .. } => true,
            OpBody::ListDelete { count, .. } => *count == 0,
            OpBody::ListMove {
                index,
                target_index,
            } => index == target_index,
            OpBody::MapBatch { operations } => operations.is_empty(),
            _ => false,
        }
    }
}

impl Operation {
    /// Construct a new locally-authored operation with a generated id and
    /// the author's current clock.
    pub fn new(client_id: impl Into<ClientId>, base_version: Version, body: OpBody) -> Self {
        Operation {
            id: generate_operation_id(),
            client_id: client_id.into(),
            base_version,
            timestamp: now_millis(),
            body,
            extra: Map::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    pub fn is_noop(&self) -> bool {
        self.body.is_noop()
    }

    /// Replace the payload, keeping identity fields and extras. This is how
    /// transformation produces the rebased operation.
    pub fn with_body(&self, body: OpBody) -> Operation {
        Operation {
            body,
            ..self.clone()
        }
    }

    /// Neutralize this operation while keeping its version slot.
    pub fn into_noop(&self) -> Operation {
        self.with_body(OpBody::Noop)
    }

    /// Total order on authors used for tie-breaking concurrent edits.
    pub fn author_rank(&self) -> (u64, &str) {
        (self.timestamp, self.client_id.as_str())
    }
}

// ─── Wire layout ────────────────────────────────────────────────────────

/// Flat wire record. Every payload field is optional; `TryFrom` checks the
/// ones the tag requires. A single `#[serde(flatten)]` map soaks up fields
/// this revision does not know about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOperation {
    id: String,
    client_id: String,
    base_version: u64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    item: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    previous_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    old_item: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    operations: Option<Vec<MapEntryOp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attributes: Option<Attributes>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl WireOperation {
    fn require<T>(field: Option<T>, kind: &str, name: &str) -> Result<T, OtError> {
        field.ok_or_else(|| OtError::Malformed(format!("{kind} requires field `{name}`")))
    }
}

impl TryFrom<WireOperation> for Operation {
    type Error = OtError;

    fn try_from(w: WireOperation) -> Result<Self, OtError> {
        if !is_valid_identifier(&w.id) {
            return Err(OtError::Malformed(format!("invalid operation id {:?}", w.id)));
        }
        if !is_valid_identifier(&w.client_id) {
            return Err(OtError::Malformed(format!(
                "invalid client id {:?}",
                w.client_id
            )));
        }
        let kind = w.kind.as_str();
        let body = match kind {
            "text-insert" => OpBody::TextInsert {
                position: WireOperation::require(w.position, kind, "position")?,
                text: WireOperation::require(w.text, kind, "text")?,
                attributes: w.attributes,
            },
            "text-delete" => OpBody::TextDelete {
                position: WireOperation::require(w.position, kind, "position")?,
                length: WireOperation::require(w.length, kind, "length")?,
            },
            "text-retain" => OpBody::TextRetain {
                position: WireOperation::require(w.position, kind, "position")?,
                length: WireOperation::require(w.length, kind, "length")?,
                attributes: w.attributes,
            },
            "list-insert" => OpBody::ListInsert {
                index: WireOperation::require(w.index, kind, "index")?,
                item: w.item.unwrap_or(Value::Null),
            },
            "list-delete" => OpBody::ListDelete {
                index: WireOperation::require(w.index, kind, "index")?,
                count: w.count.unwrap_or(1),
            },
            "list-replace" => OpBody::ListReplace {
                index: WireOperation::require(w.index, kind, "index")?,
                item: w.item.unwrap_or(Value::Null),
                old_item: w.old_item,
            },
            "list-move" => OpBody::ListMove {
                index: WireOperation::require(w.index, kind, "index")?,
                target_index: WireOperation::require(w.target_index, kind, "targetIndex")?,
            },
            "map-set" => OpBody::MapSet {
                key: WireOperation::require(w.key, kind, "key")?,
                value: w.value.unwrap_or(Value::Null),
                previous_value: w.previous_value,
            },
            "map-delete" => OpBody::MapDelete {
                key: WireOperation::require(w.key, kind, "key")?,
                previous_value: w.previous_value,
            },
            "map-batch" => OpBody::MapBatch {
                operations: WireOperation::require(w.operations, kind, "operations")?,
            },
            "noop" => OpBody::Noop,
            other => return Err(OtError::Malformed(format!("unknown operation type {other:?}"))),
        };
        Ok(Operation {
            id: w.id,
            client_id: w.client_id,
            base_version: w.base_version,
            timestamp: w.timestamp,
            body,
            extra: w.extra,
        })
    }
}

impl From<Operation> for WireOperation {
    fn from(op: Operation) -> WireOperation {
        let mut w = WireOperation {
            id: op.id,
            client_id: op.client_id,
            base_version: op.base_version,
            kind: op.body.kind().to_string(),
            timestamp: op.timestamp,
            position: None,
            text: None,
            length: None,
            index: None,
            item: None,
            count: None,
            target_index: None,
            key: None,
            value: None,
            previous_value: None,
            old_item: None,
            operations: None,
            attributes: None,
            extra: op.extra,
        };
        match op.body {
            OpBody::TextInsert {
                position,
                text,
                attributes,
            } => {
                w.position = Some(position);
                w.text = Some(text);
                w.attributes = attributes;
            }
            OpBody::TextDelete { position, length } => {
                w.position = Some(position);
                w.length = Some(length);
            }
            OpBody::TextRetain {
                position,
                length,
                attributes,
            } => {
                w.position = Some(position);
                w.length = Some(length);
                w.attributes = attributes;
            }
            OpBody::ListInsert { index, item } => {
                w.index = Some(index);
                w.item = Some(item);
            }
            OpBody::ListDelete { index, count } => {
                w.index = Some(index);
                w.count = Some(count);
            }
            OpBody::ListReplace {
                index,
                item,
                old_item,
            } => {
                w.index = Some(index);
                w.item = Some(item);
                w.old_item = old_item;
            }
            OpBody::ListMove {
                index,
                target_index,
            } => {
                w.index = Some(index);
                w.target_index = Some(target_index);
            }
            OpBody::MapSet {
                key,
                value,
                previous_value,
            } => {
                w.key = Some(key);
                w.value = Some(value);
                w.previous_value = previous_value;
            }
            OpBody::MapDelete {
                key,
                previous_value,
            } => {
                w.key = Some(key);
                w.previous_value = previous_value;
            }
            OpBody::MapBatch { operations } => {
                w.operations = Some(operations);
            }
            OpBody::Noop => {}
        }
        w
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("client-123_abc"));
        assert!(is_valid_identifier("a"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier("semi;colon"));
    }

    #[test]
    fn test_generated_ids_are_valid() {
        assert!(is_valid_identifier(&generate_operation_id()));
        assert!(is_valid_identifier(&generate_client_id()));
    }

    #[test]
    fn test_text_insert_roundtrip() {
        let op = Operation::new("alice", 3, OpBody::TextInsert {
            position: 7,
            text: "world".into(),
            attributes: None,
        });
        let encoded = serde_json::to_string(&op).unwrap();
        let decoded: Operation = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, op);

        let raw: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(raw["type"], "text-insert");
        assert_eq!(raw["baseVersion"], 3);
        assert_eq!(raw["clientId"], "alice");
        assert_eq!(raw["position"], 7);
        assert!(raw.get("length").is_none());
    }

    #[test]
    fn test_list_delete_defaults_count() {
        let decoded: Operation = serde_json::from_value(json!({
            "id": "op-1", "clientId": "c1", "baseVersion": 0,
            "type": "list-delete", "timestamp": 1, "index": 4
        }))
        .unwrap();
        assert_eq!(decoded.body, OpBody::ListDelete { index: 4, count: 1 });
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let decoded: Operation = serde_json::from_value(json!({
            "id": "op-1", "clientId": "c1", "baseVersion": 2,
            "type": "map-set", "timestamp": 5, "key": "k", "value": 9,
            "origin": "plugin-x", "trace": {"hop": 1}
        }))
        .unwrap();
        assert_eq!(decoded.extra["origin"], "plugin-x");

        let reencoded = serde_json::to_value(&decoded).unwrap();
        assert_eq!(reencoded["origin"], "plugin-x");
        assert_eq!(reencoded["trace"]["hop"], 1);
        assert_eq!(reencoded["key"], "k");
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let result: Result<Operation, _> = serde_json::from_value(json!({
            "id": "op-1", "clientId": "c1", "baseVersion": 0,
            "type": "text-insert", "timestamp": 1, "position": 0
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result: Result<Operation, _> = serde_json::from_value(json!({
            "id": "op-1", "clientId": "c1", "baseVersion": 0,
            "type": "tree-graft", "timestamp": 1
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let result: Result<Operation, _> = serde_json::from_value(json!({
            "id": "", "clientId": "c1", "baseVersion": 0,
            "type": "noop", "timestamp": 1
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_map_batch_roundtrip() {
        let op = Operation::new("bob", 9, OpBody::MapBatch {
            operations: vec![
                MapEntryOp::Set {
                    key: "title".into(),
                    value: json!("Notes"),
                    previous_value: None,
                },
                MapEntryOp::Delete {
                    key: "draft".into(),
                    previous_value: Some(json!(true)),
                },
            ],
        });
        let raw = serde_json::to_value(&op).unwrap();
        assert_eq!(raw["operations"][0]["type"], "map-set");
        assert_eq!(raw["operations"][1]["type"], "map-delete");
        assert_eq!(raw["operations"][1]["previousValue"], true);

        let decoded: Operation = serde_json::from_value(raw).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_noop_detection() {
        assert!(OpBody::Noop.is_noop());
        assert!(OpBody::TextDelete { position: 3, length: 0 }.is_noop());
        assert!(OpBody::ListMove { index: 2, target_index: 2 }.is_noop());
        assert!(!OpBody::TextInsert {
            position: 0,
            text: "x".into(),
            attributes: None
        }
        .is_noop());
    }

    #[test]
    fn test_author_rank_ordering() {
        let a = Operation::new("a", 0, OpBody::Noop);
        let mut b = Operation::new("b", 0, OpBody::Noop);
        b.timestamp = a.timestamp;
        assert!(b.author_rank() > a.author_rank());
    }

    #[test]
    fn test_with_body_keeps_identity() {
        let op = Operation::new("carol", 4, OpBody::TextDelete { position: 1, length: 2 });
        let rebased = op.with_body(OpBody::TextDelete { position: 0, length: 2 });
        assert_eq!(rebased.id, op.id);
        assert_eq!(rebased.base_version, 4);
        assert_eq!(rebased.kind(), "text-delete");
    }
}
