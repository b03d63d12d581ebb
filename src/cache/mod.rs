//! Local media cache
//!
//! Images and audio referenced by memories are downloaded once into a flat
//! directory and served from disk afterwards. Presence on disk is the only
//! persistent record; the in-memory index is an optimisation that can be
//! dropped at any time.

pub mod entry;
pub mod media;
pub mod storage;

pub use entry::{filename_for, CacheEntry, CacheState, LocalHandle, MediaKind};
pub use media::MediaCache;
pub use storage::{DiskStorage, LocalStorage};
