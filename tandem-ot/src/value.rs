//! Document value model and operation application semantics.
//!
//! Text positions count Unicode scalar values, not bytes and not grapheme
//! clusters; the splice helpers convert to byte offsets before mutating.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::OtError;
use crate::operation::{MapEntryOp, OpBody, Operation};

/// The kind of value a document holds, chosen at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Schema {
    Text,
    List,
    /// Keyed map; also covers composite documents, which store one JSON
    /// value per named field.
    #[default]
    Map,
}

impl Schema {
    pub fn as_str(&self) -> &'static str {
        match self {
            Schema::Text => "text",
            Schema::List => "list",
            Schema::Map => "map",
        }
    }

    /// The value a freshly created document starts from.
    pub fn initial_value(&self) -> DocumentValue {
        match self {
            Schema::Text => DocumentValue::Text(String::new()),
            Schema::List => DocumentValue::List(Vec::new()),
            Schema::Map => DocumentValue::Map(Map::new()),
        }
    }
}

/// Current materialized state of a document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentValue {
    Text(String),
    List(Vec<Value>),
    Map(Map<String, Value>),
}

impl DocumentValue {
    pub fn schema(&self) -> Schema {
        match self {
            DocumentValue::Text(_) => Schema::Text,
            DocumentValue::List(_) => Schema::List,
            DocumentValue::Map(_) => Schema::Map,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            DocumentValue::Text(s) => Value::String(s.clone()),
            DocumentValue::List(items) => Value::Array(items.clone()),
            DocumentValue::Map(entries) => Value::Object(entries.clone()),
        }
    }

    /// Decode a snapshot payload against a schema.
    pub fn from_json(schema: Schema, value: Value) -> Result<DocumentValue, OtError> {
        match (schema, value) {
            (Schema::Text, Value::String(s)) => Ok(DocumentValue::Text(s)),
            (Schema::List, Value::Array(items)) => Ok(DocumentValue::List(items)),
            (Schema::Map, Value::Object(entries)) => Ok(DocumentValue::Map(entries)),
            (schema, other) => Err(OtError::InvalidSnapshot(format!(
                "schema {} cannot hold {other}",
                schema.as_str()
            ))),
        }
    }

    /// Apply one operation in place. Application is total: either the value
    /// mutates or an `InvalidOperation`-class error is returned and the
    /// value is untouched.
    pub fn apply(&mut self, op: &Operation) -> Result<(), OtError> {
        match (self, &op.body) {
            (_, OpBody::Noop) => Ok(()),
            (DocumentValue::Text(s), body) => apply_text(s, body),
            (DocumentValue::List(items), body) => apply_list(items, body),
            (DocumentValue::Map(entries), body) => apply_map(entries, body),
        }
    }
}

/// Byte offset of the `index`-th Unicode scalar value.
fn byte_position(s: &str, index: usize) -> Option<usize> {
    if index == 0 {
        return Some(0);
    }
    match s.char_indices().nth(index) {
        Some((byte, _)) => Some(byte),
        None if index == s.chars().count() => Some(s.len()),
        None => None,
    }
}

pub(crate) fn char_count(s: &str) -> usize {
    s.chars().count()
}

/// Apply a text operation to a string value.
pub fn apply_text(value: &mut String, body: &OpBody) -> Result<(), OtError> {
    let len = char_count(value);
    match body {
        OpBody::TextInsert { position, text, .. } => {
            let byte = byte_position(value, *position).ok_or_else(|| {
                OtError::invalid(format!("insert position {position} beyond length {len}"))
            })?;
            value.insert_str(byte, text);
            Ok(())
        }
        OpBody::TextDelete { position, length } => {
            if position + length > len {
                return Err(OtError::invalid(format!(
                    "delete range {}..{} beyond length {len}",
                    position,
                    position + length
                )));
            }
            if *length == 0 {
                return Ok(());
            }
            let start = byte_position(value, *position).unwrap_or(value.len());
            let end = byte_position(value, position + length).unwrap_or(value.len());
            value.replace_range(start..end, "");
            Ok(())
        }
        // Plain-text model: retain carries attributes opaquely and mutates
        // nothing, but its range must still be inside the document.
        OpBody::TextRetain { position, length, .. } => {
            if position + length > len {
                return Err(OtError::invalid(format!(
                    "retain range {}..{} beyond length {len}",
                    position,
                    position + length
                )));
            }
            Ok(())
        }
        OpBody::Noop => Ok(()),
        other => Err(OtError::KindMismatch {
            op: other.kind(),
            doc: "text",
        }),
    }
}

/// Apply a list operation to an array value.
pub fn apply_list(items: &mut Vec<Value>, body: &OpBody) -> Result<(), OtError> {
    let len = items.len();
    match body {
        OpBody::ListInsert { index, item } => {
            if *index > len {
                return Err(OtError::invalid(format!(
                    "insert index {index} beyond length {len}"
                )));
            }
            items.insert(*index, item.clone());
            Ok(())
        }
        OpBody::ListDelete { index, count } => {
            if index + count > len {
                return Err(OtError::invalid(format!(
                    "delete range {}..{} beyond length {len}",
                    index,
                    index + count
                )));
            }
            items.drain(*index..index + count);
            Ok(())
        }
        OpBody::ListReplace { index, item, .. } => {
            if *index >= len {
                return Err(OtError::invalid(format!(
                    "replace index {index} beyond length {len}"
                )));
            }
            items[*index] = item.clone();
            Ok(())
        }
        OpBody::ListMove {
            index,
            target_index,
        } => {
            if *index >= len || *target_index >= len {
                return Err(OtError::invalid(format!(
                    "move {index}->{target_index} beyond length {len}"
                )));
            }
            if index != target_index {
                let item = items.remove(*index);
                items.insert(*target_index, item);
            }
            Ok(())
        }
        OpBody::Noop => Ok(()),
        other => Err(OtError::KindMismatch {
            op: other.kind(),
            doc: "list",
        }),
    }
}

/// Apply a map operation to an object value. Deleting an absent key is
/// accepted (concurrent deletes of the same key are expected to land here).
pub fn apply_map(entries: &mut Map<String, Value>, body: &OpBody) -> Result<(), OtError> {
    match body {
        OpBody::MapSet { key, value, .. } => {
            if key.is_empty() {
                return Err(OtError::invalid("empty map key"));
            }
            entries.insert(key.clone(), value.clone());
            Ok(())
        }
        OpBody::MapDelete { key, .. } => {
            entries.remove(key);
            Ok(())
        }
        OpBody::MapBatch { operations } => {
            for entry in operations {
                match entry {
                    MapEntryOp::Set { key, value, .. } => {
                        if key.is_empty() {
                            return Err(OtError::invalid("empty map key in batch"));
                        }
                        entries.insert(key.clone(), value.clone());
                    }
                    MapEntryOp::Delete { key, .. } => {
                        entries.remove(key);
                    }
                }
            }
            Ok(())
        }
        OpBody::Noop => Ok(()),
        other => Err(OtError::KindMismatch {
            op: other.kind(),
            doc: "map",
        }),
    }
}
