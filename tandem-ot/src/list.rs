//! Transformation and conflict detection for ordered-list operations.
//!
//! The rules mirror the text algebra with item counts in place of character
//! lengths. `list-move` is an atomic relocation: concurrent operations see
//! their indices routed through the relocation, and a move whose source was
//! concurrently deleted degrades to a no-op.

use crate::operation::{OpBody, Operation};

/// Where an element index lands after `move(source, target)` is applied.
fn map_index_through_move(i: usize, source: usize, target: usize) -> usize {
    if source == target {
        return i;
    }
    if i == source {
        return target;
    }
    if source < target {
        // Forward move: positions in (source, target] shift down by one.
        if i > source && i <= target {
            i - 1
        } else {
            i
        }
    } else {
        // Backward move: positions in [target, source) shift up by one.
        if i >= target && i < source {
            i + 1
        } else {
            i
        }
    }
}

/// Where an insertion gap lands after `move(source, target)`. Gaps are not
/// items, so the `i == source` special case does not apply.
fn map_gap_through_move(i: usize, source: usize, target: usize) -> usize {
    if source < target {
        if i > source && i <= target {
            i - 1
        } else {
            i
        }
    } else if source > target {
        if i >= target && i < source {
            i + 1
        } else {
            i
        }
    } else {
        i
    }
}

/// Rebase list operation `a` over concurrently applied list operation `b`.
pub(crate) fn transform_bodies(a: &Operation, b: &Operation) -> Vec<OpBody> {
    match (&a.body, &b.body) {
        (
            OpBody::ListInsert { index: ia, item },
            OpBody::ListInsert { index: ib, .. },
        ) => {
            let shift = *ia > *ib || (*ia == *ib && a.author_rank() > b.author_rank());
            vec![OpBody::ListInsert {
                index: if shift { ia + 1 } else { *ia },
                item: item.clone(),
            }]
        }

        (
            OpBody::ListInsert { index: ia, item },
            OpBody::ListDelete { index: ib, count },
        ) => {
            let index = if *ia <= *ib {
                *ia
            } else if *ia >= ib + count {
                ia - count
            } else {
                *ib
            };
            vec![OpBody::ListInsert {
                index,
                item: item.clone(),
            }]
        }

        (OpBody::ListInsert { index, item }, OpBody::ListMove { index: s, target_index: t }) => {
            vec![OpBody::ListInsert {
                index: map_gap_through_move(*index, *s, *t),
                item: item.clone(),
            }]
        }

        (OpBody::ListInsert { .. }, _) => vec![a.body.clone()],

        (
            OpBody::ListDelete { index: ia, count: ca },
            OpBody::ListInsert { index: ib, .. },
        ) => {
            if *ib <= *ia {
                vec![OpBody::ListDelete {
                    index: ia + 1,
                    count: *ca,
                }]
            } else if *ib >= ia + ca {
                vec![a.body.clone()]
            } else {
                // Concurrent insert strictly inside the deleted span: split
                // so the inserted item survives.
                let head = ib - ia;
                vec![
                    OpBody::ListDelete {
                        index: *ia,
                        count: head,
                    },
                    OpBody::ListDelete {
                        index: ia + 1,
                        count: ca - head,
                    },
                ]
            }
        }

        (
            OpBody::ListDelete { index: ia, count: ca },
            OpBody::ListDelete { index: ib, count: cb },
        ) => {
            let (a_start, a_end) = (*ia, ia + ca);
            let (b_start, b_end) = (*ib, ib + cb);
            if a_end <= b_start {
                vec![a.body.clone()]
            } else if b_end <= a_start {
                vec![OpBody::ListDelete {
                    index: ia - cb,
                    count: *ca,
                }]
            } else {
                let overlap = a_end.min(b_end) - a_start.max(b_start);
                vec![OpBody::ListDelete {
                    index: a_start.min(b_start),
                    count: ca - overlap,
                }]
            }
        }

        (OpBody::ListDelete { index, count }, OpBody::ListMove { index: s, target_index: t }) => {
            vec![OpBody::ListDelete {
                index: map_index_through_move(*index, *s, *t),
                count: *count,
            }]
        }

        (OpBody::ListDelete { .. }, _) => vec![a.body.clone()],

        (
            OpBody::ListReplace { index: ia, item, old_item },
            OpBody::ListInsert { index: ib, .. },
        ) => {
            let index = if *ib <= *ia { ia + 1 } else { *ia };
            vec![OpBody::ListReplace {
                index,
                item: item.clone(),
                old_item: old_item.clone(),
            }]
        }

        (
            OpBody::ListReplace { index: ia, item, old_item },
            OpBody::ListDelete { index: ib, count },
        ) => {
            if *ia >= *ib && *ia < ib + count {
                // The replaced item was deleted out from under us.
                vec![OpBody::Noop]
            } else if *ia >= ib + count {
                vec![OpBody::ListReplace {
                    index: ia - count,
                    item: item.clone(),
                    old_item: old_item.clone(),
                }]
            } else {
                vec![a.body.clone()]
            }
        }

        (
            OpBody::ListReplace { index: ia, .. },
            OpBody::ListReplace { index: ib, .. },
        ) => {
            if ia == ib && a.author_rank() <= b.author_rank() {
                vec![OpBody::Noop]
            } else {
                vec![a.body.clone()]
            }
        }

        (
            OpBody::ListReplace { index, item, old_item },
            OpBody::ListMove { index: s, target_index: t },
        ) => vec![OpBody::ListReplace {
            index: map_index_through_move(*index, *s, *t),
            item: item.clone(),
            old_item: old_item.clone(),
        }],

        (
            OpBody::ListMove { index: s, target_index: t },
            OpBody::ListInsert { index: ib, .. },
        ) => {
            let s2 = if *ib <= *s { s + 1 } else { *s };
            let t2 = if *ib <= *t { t + 1 } else { *t };
            vec![OpBody::ListMove {
                index: s2,
                target_index: t2,
            }]
        }

        (
            OpBody::ListMove { index: s, target_index: t },
            OpBody::ListDelete { index: ib, count },
        ) => {
            if *s >= *ib && *s < ib + count {
                // Source item deleted concurrently: nothing left to move.
                vec![OpBody::Noop]
            } else {
                let shift = |i: usize| {
                    if i >= ib + count {
                        i - count
                    } else if i > *ib {
                        *ib
                    } else {
                        i
                    }
                };
                vec![OpBody::ListMove {
                    index: shift(*s),
                    target_index: shift(*t),
                }]
            }
        }

        (
            OpBody::ListMove { index: sa, target_index: ta },
            OpBody::ListMove { index: sb, target_index: tb },
        ) => {
            if sa == sb {
                // Both relocate the same item: lower rank yields.
                if a.author_rank() <= b.author_rank() {
                    return vec![OpBody::Noop];
                }
            }
            vec![OpBody::ListMove {
                index: map_index_through_move(*sa, *sb, *tb),
                target_index: map_index_through_move(*ta, *sb, *tb),
            }]
        }

        _ => vec![a.body.clone()],
    }
}

/// Only same-position deletes merge for lists (a single `list-insert`
/// carries exactly one item, so inserts never merge).
pub(crate) fn can_merge_bodies(a: &Operation, b: &Operation) -> bool {
    if a.client_id != b.client_id {
        return false;
    }
    matches!(
        (&a.body, &b.body),
        (
            OpBody::ListDelete { index: ia, .. },
            OpBody::ListDelete { index: ib, .. }
        ) if ia == ib
    )
}

pub(crate) fn merge_bodies(a: &OpBody, b: &OpBody) -> Option<OpBody> {
    match (a, b) {
        (
            OpBody::ListDelete { index, count: ca },
            OpBody::ListDelete { count: cb, .. },
        ) => Some(OpBody::ListDelete {
            index: *index,
            count: ca + cb,
        }),
        _ => None,
    }
}

/// Affected index span; inserts are zero-width points.
fn affected_range(body: &OpBody) -> Option<(usize, usize)> {
    match body {
        OpBody::ListInsert { index, .. } => Some((*index, *index)),
        OpBody::ListDelete { index, count } => Some((*index, index + count)),
        OpBody::ListReplace { index, .. } => Some((*index, index + 1)),
        OpBody::ListMove {
            index,
            target_index,
        } => Some((
            *index.min(target_index),
            index.max(target_index) + 1,
        )),
        _ => None,
    }
}

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
