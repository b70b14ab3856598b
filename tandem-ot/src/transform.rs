//! Transformation dispatch over the operation tag matrix, plus composition
//! and conflict detection entry points.
//!
//! `transform(a, b)` answers: given that `b` (same base version) was
//! applied first, what should `a` become? The result is a short list —
//! almost always one operation, two when a delete is split around a
//! concurrent insert. Identity fields and unknown wire fields ride along
//! unchanged; split fragments get derived ids.

use crate::list;
use crate::map;
use crate::operation::{OpBody, OpFamily, Operation};
use crate::text;

/// Rebase `a` over concurrently applied `b` (TP1 orientation).
pub fn transform(a: &Operation, b: &Operation) -> Vec<Operation> {
    if matches!(a.body, OpBody::Noop) || matches!(b.body, OpBody::Noop) {
        return vec![a.clone()];
    }
    let bodies = match (a.body.family(), b.body.family()) {
        (OpFamily::Text, OpFamily::Text) => text::transform_bodies(a, b),
        (OpFamily::List, OpFamily::List) => list::transform_bodies(a, b),
        (OpFamily::Map, OpFamily::Map) => map::transform_bodies(a, b),
        // Operations of different kinds address different documents and
        // never interact.
        _ => vec![a.body.clone()],
    };
    attach(a, bodies)
}

/// Rebase `op` over an ordered run of already-applied operations.
pub fn transform_against<'a>(
    op: &Operation,
    later: impl IntoIterator<Item = &'a Operation>,
) -> Vec<Operation> {
    let mut current = vec![op.clone()];
    for b in later {
        let mut next = Vec::with_capacity(current.len());
        for a in &current {
            next.extend(transform(a, b));
        }
        current = next;
    }
    current
}

fn attach(a: &Operation, bodies: Vec<OpBody>) -> Vec<Operation> {
    bodies
        .into_iter()
        .enumerate()
        .map(|(i, body)| {
            let mut op = a.with_body(body);
            if i > 0 {
                op.id = format!("{}-s{i}", a.id);
            }
            op
        })
        .collect()
}

/// Whether `a` immediately followed by `b` (same author) collapses into a
/// single equivalent operation.
pub fn can_merge(a: &Operation, b: &Operation) -> bool {
    text::can_merge_bodies(a, b) || list::can_merge_bodies(a, b)
}

/// Merge two consecutive operations from the same author, when possible.
/// The merged operation keeps `a`'s id and base version and `b`'s clock.
pub fn compose(a: &Operation, b: &Operation) -> Option<Operation> {
    if !can_merge(a, b) {
        return None;
    }
    let body = text::merge_bodies(&a.body, &b.body)
        .or_else(|| list::merge_bodies(&a.body, &b.body))?;
    let mut merged = a.with_body(body);
    merged.timestamp = b.timestamp;
    Some(merged)
}

/// Greedily collapse a run of operations, merging wherever [`compose`]
/// allows. Applying the result in order is equivalent to applying the
/// input in order.
pub fn compose_all(ops: &[Operation]) -> Vec<Operation> {
    let mut out: Vec<Operation> = Vec::with_capacity(ops.len());
    for op in ops {
        if let Some(last) = out.last() {
            if let Some(merged) = compose(last, op) {
                *out.last_mut().expect("non-empty") = merged;
                continue;
            }
        }
        out.push(op.clone());
    }
    out
}

/// Two operations conflict iff their affected ranges overlap (zero-width
/// ranges for inserts, key sets for maps).
pub fn conflicts(a: &Operation, b: &Operation) -> bool {
    match (a.body.family(), b.body.family()) {
        (OpFamily::Text, OpFamily::Text) => text::bodies_conflict(&a.body, &b.body),
        (OpFamily::List, OpFamily::List) => list::bodies_conflict(&a.body, &b.body),
        (OpFamily::Map, OpFamily::Map) => map::bodies_conflict(&a.body, &b.body),
        _ => false,
    }
}
