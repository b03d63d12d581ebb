//! Positional change reconciliation
//!
//! Applies a batch of add/modify/remove operations to an ordered list, in
//! order, one at a time. Server indices are treated as positions but are
//! validated against record identifiers:
//!
//! - `Added` inserts at `new_index`, clamped to the current length.
//! - `Modified` replaces the element at `old_index` when it carries the same
//!   identifier, otherwise the element with that identifier wherever it is.
//! - `Removed` deletes the element at `old_index` under the same rule.
//!
//! Operations whose record cannot be located are skipped and counted.
//!
//! Batches straight from the decoder may carry tombstones: removals whose
//! document no longer decodes. Those are removed by identifier alone.

use super::change::{Change, ChangeBatch, ChangeKind, Decoded};
use crate::model::Keyed;

/// Outcome of applying one batch
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled<T> {
    /// Records inserted by this batch, in application order
    pub added: Vec<T>,
    pub modified: usize,
    pub removed: usize,
    /// Operations that could not be applied
    pub skipped: usize,
}

impl<T> Default for Reconciled<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            modified: 0,
            removed: 0,
            skipped: 0,
        }
    }
}

impl<T> Reconciled<T> {
    /// Whether the batch changed the list at all
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || self.modified > 0 || self.removed > 0
    }
}

/// Applies change batches to an ordered list
pub struct ChangeReconciler;

impl ChangeReconciler {
    /// Apply `batch` to `list` sequentially.
    pub fn apply<T: Keyed + Clone>(list: &mut Vec<T>, batch: ChangeBatch<T>) -> Reconciled<T> {
        let mut outcome = Reconciled::default();
        for change in batch.changes {
            Self::apply_one(list, change, &mut outcome);
        }
        outcome
    }

    /// Apply a decoded batch, removing tombstoned records by identifier.
    pub fn apply_decoded<T: Keyed + Clone>(
        list: &mut Vec<T>,
        batch: ChangeBatch<Decoded<T>>,
    ) -> Reconciled<T> {
        let mut outcome = Reconciled::default();
        for change in batch.changes {
            let Change {
                kind,
                record,
                new_index,
                old_index,
            } = change;
            match record {
                Decoded::Record(record) => Self::apply_one(
                    list,
                    Change {
                        kind,
                        record,
                        new_index,
                        old_index,
                    },
                    &mut outcome,
                ),
                Decoded::Tombstone(id) if kind == ChangeKind::Removed => {
                    remove(list, &id, old_index, &mut outcome)
                }
                Decoded::Tombstone(id) => {
                    tracing::warn!(id = %id, kind = ?kind, "Tombstone on non-removal; skipping");
                    outcome.skipped += 1;
                }
            }
        }
        outcome
    }

    fn apply_one<T: Keyed + Clone>(list: &mut Vec<T>, change: Change<T>, outcome: &mut Reconciled<T>) {
        match change.kind {
            ChangeKind::Added => {
                if let Some(pos) = position_of(list, change.record.key()) {
                    tracing::warn!(
                        id = change.record.key(),
                        position = pos,
                        "Added record already present; replacing in place"
                    );
                    list[pos] = change.record;
                    outcome.modified += 1;
                    return;
                }
                let index = if change.new_index > list.len() {
                    tracing::warn!(
                        id = change.record.key(),
                        new_index = change.new_index,
                        len = list.len(),
                        "Added index out of range; appending"
                    );
                    list.len()
                } else {
                    change.new_index
                };
                list.insert(index, change.record.clone());
                outcome.added.push(change.record);
            }
            ChangeKind::Modified => match locate(list, change.record.key(), change.old_index) {
                Some(pos) => {
                    list[pos] = change.record;
                    outcome.modified += 1;
                }
                None => {
                    tracing::warn!(
                        id = change.record.key(),
                        old_index = change.old_index,
                        "Modified record not found; skipping"
                    );
                    outcome.skipped += 1;
                }
            },
            ChangeKind::Removed => remove(list, change.record.key(), change.old_index, outcome),
        }
    }
}

fn remove<T: Keyed>(list: &mut Vec<T>, key: &str, old_index: usize, outcome: &mut Reconciled<T>) {
    match locate(list, key, old_index) {
        Some(pos) => {
            list.remove(pos);
            outcome.removed += 1;
        }
        None => {
            tracing::warn!(id = key, old_index, "Removed record not found; skipping");
            outcome.skipped += 1;
        }
    }
}

/// Position of the record a modify/remove targets: `old_index` when the
/// identifiers agree, otherwise a search by identifier.
fn locate<T: Keyed>(list: &[T], key: &str, old_index: usize) -> Option<usize> {
    match list.get(old_index) {
        Some(existing) if existing.key() == key => Some(old_index),
        _ => {
            let found = position_of(list, key);
            if found.is_some() {
                tracing::debug!(id = key, old_index, "Stale index; matched by id");
            }
            found
        }
    }
}

fn position_of<T: Keyed>(list: &[T], key: &str) -> Option<usize> {
    list.iter().position(|r| r.key() == key)
}
