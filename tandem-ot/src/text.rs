//! Transformation, composition and conflict detection for text operations.
//!
//! `transform_bodies(a, b)` rebases `a` over `b`, assuming both were
//! authored against the same base version and `b` was applied first. The
//! rules satisfy TP1: `apply(b); apply(T(a,b))` converges with
//! `apply(a); apply(T(b,a))` for any text state.
//!
//! A delete whose range a concurrent insert landed strictly inside is split
//! into two deletes around the inserted text, so the insert survives on
//! every replica. The second fragment's indices account for the first
//! fragment already being applied.

use crate::operation::{OpBody, Operation};
use crate::value::char_count;

/// Rebase text operation `a` over concurrently applied text operation `b`.
/// Returns the new payload(s) for `a`; more than one only when a delete is
/// split around a concurrent insert.
pub(crate) fn transform_bodies(a: &Operation, b: &Operation) -> Vec<OpBody> {
    match (&a.body, &b.body) {
        // Retain is identity under transformation in both directions.
        (OpBody::TextRetain { .. }, _) | (_, OpBody::TextRetain { .. }) => vec![a.body.clone()],

        (
            OpBody::TextInsert {
                position: pa,
                text,
                attributes,
            },
            OpBody::TextInsert {
                position: pb,
                text: tb,
                ..
            },
        ) => {
            let shift = *pa > *pb || (*pa == *pb && a.author_rank() > b.author_rank());
            vec![OpBody::TextInsert {
                position: if shift { pa + char_count(tb) } else { *pa },
                text: text.clone(),
                attributes: attributes.clone(),
            }]
        }

        (
            OpBody::TextInsert {
                position: pa,
                text,
                attributes,
            },
            OpBody::TextDelete {
                position: pb,
                length: lb,
            },
        ) => {
            let position = if *pa <= *pb {
                *pa
            } else if *pa >= pb + lb {
                pa - lb
            } else {
                // Insert landed inside the deleted range: snap to its start.
                *pb
            };
            vec![OpBody::TextInsert {
                position,
                text: text.clone(),
                attributes: attributes.clone(),
            }]
        }

        (
            OpBody::TextDelete {
                position: pa,
                length: la,
            },
            OpBody::TextInsert {
                position: pb,
                text: tb,
                ..
            },
        ) => {
            let tb_len = char_count(tb);
            if *pb <= *pa {
                vec![OpBody::TextDelete {
                    position: pa + tb_len,
                    length: *la,
                }]
            } else if *pb >= pa + la {
                vec![a.body.clone()]
            } else {
                // Concurrent insert strictly inside the deleted range:
                // split so the inserted text is not clobbered.
                let head = pb - pa;
                vec![
                    OpBody::TextDelete {
                        position: *pa,
                        length: head,
                    },
                    OpBody::TextDelete {
                        position: pa + tb_len,
                        length: la - head,
                    },
                ]
            }
        }

        (
            OpBody::TextDelete {
                position: pa,
                length: la,
            },
            OpBody::TextDelete {
                position: pb,
                length: lb,
            },
        ) => {
            let (a_start, a_end) = (*pa, pa + la);
            let (b_start, b_end) = (*pb, pb + lb);
            if a_end <= b_start {
                vec![a.body.clone()]
            } else if b_end <= a_start {
                vec![OpBody::TextDelete {
                    position: pa - lb,
                    length: *la,
                }]
            } else {
                // Overlapping ranges: delete only the residual. A zero
                // length result is kept as a no-op for version accounting.
                let overlap = a_end.min(b_end) - a_start.max(b_start);
                vec![OpBody::TextDelete {
                    position: a_start.min(b_start),
                    length: la - overlap,
                }]
            }
        }

        _ => vec![a.body.clone()],
    }
}

/// Whether two consecutive operations from the same author merge into one.
pub(crate) fn can_merge_bodies(a: &Operation, b: &Operation) -> bool {
    if a.client_id != b.client_id {
        return false;
    }
    match (&a.body, &b.body) {
        (
            OpBody::TextInsert { position: pa, text, .. },
            OpBody::TextInsert { position: pb, .. },
        ) => *pb == pa + char_count(text),
        (
            OpBody::TextDelete { position: pa, .. },
            OpBody::TextDelete { position: pb, .. },
        ) => pa == pb,
        _ => false,
    }
}

/// Merge two mergeable payloads; caller must have checked
/// [`can_merge_bodies`].
pub(crate) fn merge_bodies(a: &OpBody, b: &OpBody) -> Option<OpBody> {
    match (a, b) {
        (
            OpBody::TextInsert {
                position,
                text: ta,
                attributes,
            },
            OpBody::TextInsert { text: tb, .. },
        ) => Some(OpBody::TextInsert {
            position: *position,
            text: format!("{ta}{tb}"),
            attributes: attributes.clone(),
        }),
        (
            OpBody::TextDelete {
                position,
                length: la,
            },
            OpBody::TextDelete { length: lb, .. },
        ) => Some(OpBody::TextDelete {
            position: *position,
            length: la + lb,
        }),
        _ => None,
    }
}

/// Affected character range; inserts are zero-width points.
fn affected_range(body: &OpBody) -> Option<(usize, usize)> {
    match body {
        OpBody::TextInsert { position, .. } => Some((*position, *position)),
        OpBody::TextDelete { position, length }
        | OpBody::TextRetain {
            position, length, ..
        } => Some((*position, position + length)),
        _ => None,
    }
}

/// Two text operations conflict iff their affected ranges overlap.
pub(crate) fn bodies_conflict(a: &OpBody, b: &OpBody) -> bool {
    let (Some((a_start, a_end)), Some((b_start, b_end))) = (affected_range(a), affected_range(b))
    else {
        return false;
    };
    match (a_start == a_end, b_start == b_end) {
        (true, true) => a_start == b_start,
        (true, false) => b_start < a_start && a_start < b_end,
        (false, true) => a_start < b_start && b_start < a_end,
        (false, false) => a_start < b_end && b_start < a_end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::transform;
    use crate::value::DocumentValue;

    fn insert(client: &str, ts: u64, position: usize, text: &str) -> Operation {
        let mut op = Operation::new(client, 0, OpBody::TextInsert {
            position,
            text: text.into(),
            attributes: None,
        });
        op.timestamp = ts;
        op
    }

    fn delete(client: &str, ts: u64, position: usize, length: usize) -> Operation {
        let mut op = Operation::new(client, 0, OpBody::TextDelete { position, length });
        op.timestamp = ts;
        op
    }

    fn single(a: &Operation, b: &Operation) -> Operation {
        let mut out = transform(a, b);
        assert_eq!(out.len(), 1, "expected single transformed op");
        out.remove(0)
    }

    fn apply_all(initial: &str, ops: &[&Operation]) -> String {
        let mut v = DocumentValue::Text(initial.into());
        for op in ops {
            v.apply(op).unwrap();
        }
        match v {
            DocumentValue::Text(s) => s,
            _ => unreachable!(),
        }
    }

    fn converged(initial: &str, a: &Operation, b: &Operation) -> (String, String) {
        let mut left = DocumentValue::Text(initial.into());
        left.apply(a).unwrap();
        for op in transform(b, a) {
            left.apply(&op).unwrap();
        }
        let mut right = DocumentValue::Text(initial.into());
        right.apply(b).unwrap();
        for op in transform(a, b) {
            right.apply(&op).unwrap();
        }
        match (left, right) {
            (DocumentValue::Text(l), DocumentValue::Text(r)) => (l, r),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_concurrent_inserts_no_overlap() {
        // Doc "AC": insert(1,"B") applied first, insert(2,"D") rebased.
        let a = insert("c1", 100, 1, "B");
        let b = insert("c2", 100, 2, "D");
        let b2 = single(&b, &a);
        assert_eq!(apply_all("AC", &[&a, &b2]), "ABCD");
    }

    #[test]
    fn test_concurrent_inserts_same_position_tiebreak() {
        let a = insert("a", 100, 0, "X");
        let b = insert("b", 100, 0, "Y");
        // b has the higher (timestamp, clientId) so b yields.
        let b2 = single(&b, &a);
        assert_eq!(apply_all("", &[&a, &b2]), "XY");
        // Symmetric order converges to the same string.
        let a2 = single(&a, &b);
        assert_eq!(apply_all("", &[&b, &a2]), "XY");
    }

    #[test]
    fn test_insert_inside_concurrent_delete_snaps_to_start() {
        // Doc "hello": delete(1,3) first, insert(3,"X") rebased to pos 1.
        let a = delete("c1", 100, 1, 3);
        let b = insert("c2", 101, 3, "X");
        let b2 = single(&b, &a);
        assert_eq!(
            b2.body,
            OpBody::TextInsert {
                position: 1,
                text: "X".into(),
                attributes: None
            }
        );
        assert_eq!(apply_all("hello", &[&a, &b2]), "hXo");
    }

    #[test]
    fn test_delete_splits_around_concurrent_insert() {
        // The other direction of the scenario above: the delete is split so
        // the concurrently inserted text survives on every replica.
        let ins = insert("c2", 101, 3, "X");
        let del = delete("c1", 100, 1, 3);
        let parts = transform(&del, &ins);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].body, OpBody::TextDelete { position: 1, length: 2 });
        assert_eq!(parts[1].body, OpBody::TextDelete { position: 2, length: 1 });

        let (left, right) = converged("hello", &del, &ins);
        assert_eq!(left, "hXo");
        assert_eq!(left, right);
    }

    #[test]
    fn test_overlapping_deletes_residual() {
        // Doc "abcdef": delete(1,3) first, delete(2,3) keeps residual "e".
        let a = delete("c1", 100, 1, 3);
        let b = delete("c2", 101, 2, 3);
        let b2 = single(&b, &a);
        assert_eq!(b2.body, OpBody::TextDelete { position: 1, length: 1 });
        assert_eq!(apply_all("abcdef", &[&a, &b2]), "af");
        // And the other way round.
        let a2 = single(&a, &b);
        assert_eq!(apply_all("abcdef", &[&b, &a2]), "af");
    }

    #[test]
    fn test_delete_contained_in_delete_becomes_noop_length() {
        let a = delete("c1", 100, 0, 5);
        let b = delete("c2", 101, 1, 2);
        let b2 = single(&b, &a);
        assert_eq!(b2.body, OpBody::TextDelete { position: 0, length: 0 });
        assert!(b2.is_noop());
    }

    #[test]
    fn test_delete_after_disjoint_delete_shifts() {
        let a = delete("c1", 100, 0, 2);
        let b = delete("c2", 101, 4, 2);
        let b2 = single(&b, &a);
        assert_eq!(b2.body, OpBody::TextDelete { position: 2, length: 2 });
        assert_eq!(apply_all("abcdef", &[&a, &b2]), "cd");
    }

    #[test]
    fn test_insert_before_delete_shifts_delete() {
        let a = insert("c1", 100, 0, "xy");
        let b = delete("c2", 101, 2, 2);
        let b2 = single(&b, &a);
        assert_eq!(b2.body, OpBody::TextDelete { position: 4, length: 2 });
    }

    #[test]
    fn test_insert_after_delete_range_unchanged() {
        let a = delete("c1", 100, 5, 2);
        let b = insert("c2", 101, 3, "q");
        let b2 = single(&b, &a);
        assert_eq!(
            b2.body,
            OpBody::TextInsert {
                position: 3,
                text: "q".into(),
                attributes: None
            }
        );
    }

    #[test]
    fn test_insert_at_delete_boundaries() {
        let del = delete("c1", 100, 2, 3);
        // At the start of the range: stays put.
        assert_eq!(
            single(&insert("c2", 101, 2, "s"), &del).body,
            OpBody::TextInsert { position: 2, text: "s".into(), attributes: None }
        );
        // At the end of the range: shifts left by the deleted length.
        assert_eq!(
            single(&insert("c2", 101, 5, "e"), &del).body,
            OpBody::TextInsert { position: 2, text: "e".into(), attributes: None }
        );
    }

    #[test]
    fn test_retain_is_identity() {
        let r = Operation::new("c1", 0, OpBody::TextRetain {
            position: 0,
            length: 3,
            attributes: None,
        });
        let ins = insert("c2", 50, 1, "zz");
        assert_eq!(single(&r, &ins).body, r.body);
        assert_eq!(single(&ins, &r).body, ins.body);
    }

    #[test]
    fn test_multibyte_transform_counts_chars() {
        // "ééé" is three scalar values; byte lengths must not leak in.
        let a = insert("c1", 100, 0, "ééé");
        let b = insert("c2", 101, 1, "x");
        let b2 = single(&b, &a);
        assert_eq!(
            b2.body,
            OpBody::TextInsert { position: 4, text: "x".into(), attributes: None }
        );
    }

    #[test]
    fn test_can_merge_adjacent_inserts() {
        let a = insert("c1", 100, 2, "ab");
        let b = insert("c1", 101, 4, "cd");
        assert!(can_merge_bodies(&a, &b));
        assert_eq!(
            merge_bodies(&a.body, &b.body).unwrap(),
            OpBody::TextInsert {
                position: 2,
                text: "abcd".into(),
                attributes: None
            }
        );
    }

    #[test]
    fn test_cannot_merge_across_authors_or_gaps() {
        let a = insert("c1", 100, 2, "ab");
        let other_author = insert("c2", 101, 4, "cd");
        let gap = insert("c1", 101, 5, "cd");
        assert!(!can_merge_bodies(&a, &other_author));
        assert!(!can_merge_bodies(&a, &gap));
    }

    #[test]
    fn test_merge_deletes_same_position() {
        let a = delete("c1", 100, 3, 2);
        let b = delete("c1", 101, 3, 4);
        assert!(can_merge_bodies(&a, &b));
        assert_eq!(
            merge_bodies(&a.body, &b.body).unwrap(),
            OpBody::TextDelete { position: 3, length: 6 }
        );
    }

    #[test]
    fn test_conflict_detection() {
        let i1 = insert("c1", 1, 3, "a");
        let i2 = insert("c2", 2, 3, "b");
        let i3 = insert("c2", 2, 4, "b");
        let d = delete("c2", 2, 2, 4);
        assert!(bodies_conflict(&i1.body, &i2.body));
        assert!(!bodies_conflict(&i1.body, &i3.body));
        assert!(bodies_conflict(&i1.body, &d.body));
        assert!(!bodies_conflict(
            &delete("c1", 1, 0, 2).body,
            &delete("c2", 2, 2, 2).body
        ));
        assert!(bodies_conflict(
            &delete("c1", 1, 0, 3).body,
            &delete("c2", 2, 2, 2).body
        ));
    }
}
