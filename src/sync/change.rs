//! Change batch wire types

use crate::error::DecodeError;
use crate::model::{Keyed, RawDocument};
use serde::{Deserialize, Serialize};

/// Kind of positional change reported by the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One add/modify/remove operation.
///
/// `new_index` is meaningful for `Added`, `old_index` for `Modified` and
/// `Removed`. Both are positions in the list as it stands when the operation
/// is applied, i.e. after every earlier operation in the same batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change<T> {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub record: T,
    pub new_index: usize,
    pub old_index: usize,
}

impl<T> Change<T> {
    pub fn added(record: T, new_index: usize) -> Self {
        Self {
            kind: ChangeKind::Added,
            record,
            new_index,
            old_index: 0,
        }
    }

    pub fn modified(record: T, old_index: usize) -> Self {
        Self {
            kind: ChangeKind::Modified,
            record,
            new_index: old_index,
            old_index,
        }
    }

    pub fn removed(record: T, old_index: usize) -> Self {
        Self {
            kind: ChangeKind::Removed,
            record,
            new_index: 0,
            old_index,
        }
    }
}

/// Ordered set of changes delivered together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch<T> {
    pub changes: Vec<Change<T>>,
}

impl<T> ChangeBatch<T> {
    pub fn new(changes: Vec<Change<T>>) -> Self {
        Self { changes }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Record carried by a decoded change.
///
/// A removal needs nothing beyond the document id, so a removed document
/// that fails to decode is kept as a tombstone instead of being dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Record(T),
    Tombstone(String),
}

impl<T: Keyed> Keyed for Decoded<T> {
    fn key(&self) -> &str {
        match self {
            Self::Record(record) => record.key(),
            Self::Tombstone(id) => id,
        }
    }
}

impl ChangeBatch<RawDocument> {
    /// Decode every document, keeping batch order. Added and modified
    /// documents that fail to decode are dropped from the batch and returned
    /// alongside it; removed ones become tombstones.
    pub fn decode<T, F>(self, decode: F) -> (ChangeBatch<Decoded<T>>, Vec<DecodeError>)
    where
        F: Fn(&RawDocument) -> Result<T, DecodeError>,
    {
        let mut changes = Vec::with_capacity(self.changes.len());
        let mut errors = Vec::new();

        for change in self.changes {
            let record = match decode(&change.record) {
                Ok(record) => Decoded::Record(record),
                Err(e) if change.kind == ChangeKind::Removed => {
                    tracing::debug!(
                        id = %change.record.id,
                        error = %e,
                        "Removing undecodable document by id"
                    );
                    Decoded::Tombstone(change.record.id)
                }
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            changes.push(Change {
                kind: change.kind,
                record,
                new_index: change.new_index,
                old_index: change.old_index,
            });
        }

        (ChangeBatch { changes }, errors)
    }
}
