//! Remote collaborators: document store, blob source and auth provider
//!
//! The sync core talks to the backend only through these traits. Change
//! batches arrive as streams of [`ChangeBatch<RawDocument>`]; decoding into
//! typed records happens in the core so one malformed document never takes
//! down the rest of a batch.

pub mod http;
#[cfg(any(test, feature = "mock-remote"))]
pub mod memory;

use crate::error::Result;
use crate::model::{AuthUser, DayKey, MemoryDraft, MemoryRecord, RawDocument, UserProfile};
use crate::sync::ChangeBatch;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use http::HttpBlobSource;
#[cfg(any(test, feature = "mock-remote"))]
pub use memory::{InMemoryAuth, InMemoryRemoteStore};

/// Byte stream of a remote media blob
pub type BlobStream = BoxStream<'static, Result<Bytes>>;

/// Live stream of change batches. An `Err` item reports a delivery problem;
/// the stream may continue afterwards. The stream ends when the remote side
/// closes the subscription.
pub type ChangeStream = BoxStream<'static, Result<ChangeBatch<RawDocument>>>;

/// Source of media blob bytes
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn resolve_media_blob(&self, url: &str) -> Result<BlobStream>;
}

/// Remote document store holding days, memories, and user profiles
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Subscribe to the user's day documents
    async fn subscribe_days(&self, user_id: &str) -> Result<ChangeStream>;

    /// Subscribe to the memories filed under one day
    async fn subscribe_memories(&self, user_id: &str, day: &DayKey) -> Result<ChangeStream>;

    /// Store a new memory; the store assigns its identifier
    async fn create_memory(
        &self,
        user_id: &str,
        day: &DayKey,
        draft: &MemoryDraft,
    ) -> Result<MemoryRecord>;

    /// Write the profile document for a newly created account
    async fn create_user(&self, user_id: &str, profile: &UserProfile) -> Result<()>;

    /// Fetch the profile document for a user, if one exists
    async fn fetch_user(&self, user_id: &str) -> Result<Option<UserProfile>>;
}

/// Authentication provider
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser>;

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser>;

    async fn sign_out(&self) -> Result<()>;
}
