//! Transformation and conflict detection for keyed-map operations.
//!
//! Keys are independent: operations on distinct keys never interact. On the
//! same key, set/set and delete/delete resolve by `(timestamp, clientId)`
//! rank with the loser neutralized; a set always wins over a concurrent
//! delete (resurrecting the key), and a delete rebased over a set keeps
//! deleting but records the set's value as the one it removed. Batches
//! transform entry-wise, in order.

use serde_json::Value;

use crate::operation::{MapEntryOp, OpBody, Operation};

/// Rebase map operation `a` over concurrently applied map operation `b`.
pub(crate) fn transform_bodies(a: &Operation, b: &Operation) -> Vec<OpBody> {
    vec![transform_once(&a.body, a, &b.body, b)]
}

fn transform_once(a_body: &OpBody, a: &Operation, b_body: &OpBody, b: &Operation) -> OpBody {
    match (a_body, b_body) {
        (OpBody::MapBatch { operations }, _) => {
            let survivors: Vec<MapEntryOp> = operations
                .iter()
                .filter_map(|entry| transform_entry(entry.clone(), a, b_body, b))
                .collect();
            OpBody::MapBatch {
                operations: survivors,
            }
        }

        (_, OpBody::MapBatch { operations }) => {
            // Opposing a batch means transforming against each entry in order.
            let mut current = a_body.clone();
            for entry in operations {
                current = transform_once(&current, a, &entry.clone().into_body(), b);
                if matches!(current, OpBody::Noop) {
                    break;
                }
            }
            current
        }

        (
            OpBody::MapSet { key: ka, value, .. },
            OpBody::MapSet {
                key: kb,
                value: vb,
                ..
            },
        ) if ka == kb => {
            if a.author_rank() > b.author_rank() {
                OpBody::MapSet {
                    key: ka.clone(),
                    value: value.clone(),
                    previous_value: Some(vb.clone()),
                }
            } else {
                OpBody::Noop
            }
        }

        (
            OpBody::MapSet { key: ka, value, .. },
            OpBody::MapDelete { key: kb, .. },
        ) if ka == kb => {
            // Set wins over the delete and resurrects the key; the value it
            // replaces no longer exists.
            OpBody::MapSet {
                key: ka.clone(),
                value: value.clone(),
                previous_value: None,
            }
        }

        (
            OpBody::MapDelete { key: ka, .. },
            OpBody::MapSet {
                key: kb,
                value: vb,
                ..
            },
        ) if ka == kb => OpBody::MapDelete {
            key: ka.clone(),
            previous_value: Some(vb.clone()),
        },

        (
            OpBody::MapDelete { key: ka, .. },
            OpBody::MapDelete { key: kb, .. },
        ) if ka == kb => {
            if a.author_rank() > b.author_rank() {
                a_body.clone()
            } else {
                OpBody::Noop
            }
        }

        _ => a_body.clone(),
    }
}

/// Transform one batch entry against an opposing operation; `None` drops
/// the entry from its batch.
fn transform_entry(
    entry: MapEntryOp,
    a: &Operation,
    b_body: &OpBody,
    b: &Operation,
) -> Option<MapEntryOp> {
    match transform_once(&entry.into_body(), a, b_body, b) {
        OpBody::MapSet {
            key,
            value,
            previous_value,
        } => Some(MapEntryOp::Set {
            key,
            value,
            previous_value,
        }),
        OpBody::MapDelete {
            key,
            previous_value,
        } => Some(MapEntryOp::Delete {
            key,
            previous_value,
        }),
        _ => None,
    }
}

impl MapEntryOp {
    /// View a batch entry as a standalone payload for transformation.
    fn into_body(self) -> OpBody {
        match self {
            MapEntryOp::Set {
                key,
                value,
                previous_value,
            } => OpBody::MapSet {
                key,
                value,
                previous_value,
            },
            MapEntryOp::Delete {
                key,
                previous_value,
            } => OpBody::MapDelete {
                key,
                previous_value,
            },
        }
    }
}

fn keys_of(body: &OpBody) -> Vec<&str> {
    match body {
        OpBody::MapSet { key, .. } | OpBody::MapDelete { key, .. } => vec![key.as_str()],
        OpBody::MapBatch { operations } => operations.iter().map(|e| e.key()).collect(),
        _ => Vec::new(),
    }
}

/// Two map operations conflict iff they touch a common key.
pub(crate) fn bodies_conflict(a: &OpBody, b: &OpBody) -> bool {
    let b_keys = keys_of(b);
    keys_of(a).iter().any(|k| b_keys.contains(k))
}

/// Extract the `previousValue` hint, if any.
#[allow(dead_code)]
pub(crate) fn previous_value(body: &OpBody) -> Option<&Value> {
    match body {
        OpBody::MapSet { previous_value, .. } | OpBody::MapDelete { previous_value, .. } => {
            previous_value.as_ref()
        }
        _ => None,
    }
}
