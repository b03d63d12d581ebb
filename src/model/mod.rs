//! Data model: typed records decoded from remote key-value documents
//!
//! Days and memories arrive from the remote store as [`RawDocument`]s and are
//! validated into [`DayRecord`] and [`MemoryRecord`]. A document that fails
//! validation produces a [`DecodeError`](crate::error::DecodeError) and is
//! never accepted in a defaulted shape.

pub mod day;
pub mod document;
pub mod memory;
pub mod user;

pub use day::{DayKey, DayRecord};
pub use document::{Keyed, RawDocument};
pub use memory::{GeoPoint, MemoryContent, MemoryDraft, MemoryKind, MemoryRecord};
pub use user::{AuthUser, UserProfile};
