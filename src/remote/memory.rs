//! In-memory remote store and auth provider
//!
//! Test doubles for the remote collaborators. Subscriptions are backed by
//! bounded mpsc channels: each one starts with a snapshot of the collection as
//! `Added` changes, followed by live batches as documents are written. Extra
//! hooks let tests push raw batches and errors or make subscriptions fail.

use super::{AuthProvider, BlobSource, BlobStream, ChangeStream, RemoteStore};
use crate::config::SyncConfig;
use crate::error::{AuthError, Error, Result};
use crate::model::{AuthUser, DayKey, MemoryDraft, MemoryRecord, RawDocument, UserProfile};
use crate::sync::{Change, ChangeBatch};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Map;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

type BatchSender = mpsc::Sender<Result<ChangeBatch<RawDocument>>>;

const DEFAULT_BUFFER: usize = 64;

#[derive(Default)]
struct StoreState {
    profiles: HashMap<String, UserProfile>,
    days: HashMap<String, Vec<RawDocument>>,
    memories: HashMap<(String, DayKey), Vec<RawDocument>>,
    day_subscribers: HashMap<String, Vec<BatchSender>>,
    memory_subscribers: HashMap<(String, DayKey), Vec<BatchSender>>,
    blobs: HashMap<String, Bytes>,
}

/// Remote document store and blob source held entirely in memory
pub struct InMemoryRemoteStore {
    state: Mutex<StoreState>,
    buffer: usize,
    next_id: AtomicU64,
    blob_fetches: AtomicUsize,
    fail_subscriptions: AtomicBool,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::with_buffer(config.event_buffer)
    }

    /// Store whose subscription channels hold at most `buffer` batches
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            buffer: buffer.max(1),
            next_id: AtomicU64::new(1),
            blob_fetches: AtomicUsize::new(0),
            fail_subscriptions: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the day document if missing
    pub fn add_day(&self, user_id: &str, day: &DayKey) {
        let mut state = self.lock();
        add_day_locked(&mut state, user_id, day);
    }

    /// Append a memory document to a day and notify subscribers
    pub fn insert_memory(&self, user_id: &str, day: &DayKey, doc: RawDocument) {
        let mut state = self.lock();
        insert_memory_locked(&mut state, user_id, day, doc);
    }

    /// Delete a memory document and notify subscribers
    pub fn remove_memory(&self, user_id: &str, day: &DayKey, id: &str) -> bool {
        let mut state = self.lock();
        let key = (user_id.to_string(), *day);
        let docs = state.memories.entry(key.clone()).or_default();
        let Some(index) = docs.iter().position(|d| d.id == id) else {
            return false;
        };
        let doc = docs.remove(index);
        broadcast(
            state.memory_subscribers.get_mut(&key),
            ChangeBatch::new(vec![Change::removed(doc, index)]),
        );
        true
    }

    /// Deliver a raw batch to memory subscribers without touching storage
    pub fn send_memories_batch(&self, user_id: &str, day: &DayKey, batch: ChangeBatch<RawDocument>) {
        let mut state = self.lock();
        let key = (user_id.to_string(), *day);
        broadcast(state.memory_subscribers.get_mut(&key), batch);
    }

    /// Deliver a delivery error to memory subscribers
    pub fn send_memories_error(&self, user_id: &str, day: &DayKey, message: &str) {
        let mut state = self.lock();
        let key = (user_id.to_string(), *day);
        if let Some(senders) = state.memory_subscribers.get_mut(&key) {
            senders.retain(|tx| !tx.is_closed());
            for tx in senders.iter() {
                let _ = tx.try_send(Err(Error::Subscription(message.to_string())));
            }
        }
    }

    /// Make every new subscription fail
    pub fn set_fail_subscriptions(&self, fail: bool) {
        self.fail_subscriptions.store(fail, Ordering::SeqCst);
    }

    /// Live subscriptions to a day's memories
    pub fn memory_subscribers(&self, user_id: &str, day: &DayKey) -> usize {
        let state = self.lock();
        state
            .memory_subscribers
            .get(&(user_id.to_string(), *day))
            .map(|s| s.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Live subscriptions to a user's days
    pub fn day_subscribers(&self, user_id: &str) -> usize {
        let state = self.lock();
        state
            .day_subscribers
            .get(user_id)
            .map(|s| s.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn profile(&self, user_id: &str) -> Option<UserProfile> {
        self.lock().profiles.get(user_id).cloned()
    }

    /// Register the bytes served for `url`
    pub fn put_blob(&self, url: &str, bytes: impl Into<Bytes>) {
        self.lock().blobs.insert(url.to_string(), bytes.into());
    }

    /// Number of blob requests served or refused so far
    pub fn blob_fetches(&self) -> usize {
        self.blob_fetches.load(Ordering::SeqCst)
    }

    fn open_channel(&self, snapshot: &[RawDocument]) -> (BatchSender, ChangeStream) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let changes = snapshot
            .iter()
            .enumerate()
            .map(|(i, doc)| Change::added(doc.clone(), i))
            .collect();
        let _ = tx.try_send(Ok(ChangeBatch::new(changes)));
        (tx, ReceiverStream::new(rx).boxed())
    }

    fn check_subscriptions(&self) -> Result<()> {
        if self.fail_subscriptions.load(Ordering::SeqCst) {
            return Err(Error::Subscription("listener rejected by store".to_string()));
        }
        Ok(())
    }
}

fn add_day_locked(state: &mut StoreState, user_id: &str, day: &DayKey) {
    let id = day.to_string();
    let days = state.days.entry(user_id.to_string()).or_default();
    if days.iter().any(|d| d.id == id) {
        return;
    }
    let doc = RawDocument::new(id, Map::new());
    days.push(doc.clone());
    let index = days.len() - 1;
    broadcast(
        state.day_subscribers.get_mut(user_id),
        ChangeBatch::new(vec![Change::added(doc, index)]),
    );
}

fn insert_memory_locked(state: &mut StoreState, user_id: &str, day: &DayKey, doc: RawDocument) {
    let key = (user_id.to_string(), *day);
    let docs = state.memories.entry(key.clone()).or_default();
    docs.push(doc.clone());
    let index = docs.len() - 1;
    broadcast(
        state.memory_subscribers.get_mut(&key),
        ChangeBatch::new(vec![Change::added(doc, index)]),
    );
}

fn broadcast(senders: Option<&mut Vec<BatchSender>>, batch: ChangeBatch<RawDocument>) {
    let Some(senders) = senders else {
        return;
    };
    senders.retain(|tx| !tx.is_closed());
    for tx in senders.iter() {
        if tx.try_send(Ok(batch.clone())).is_err() {
            tracing::warn!(changes = batch.len(), "Subscriber channel full; dropping batch");
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn subscribe_days(&self, user_id: &str) -> Result<ChangeStream> {
        self.check_subscriptions()?;
        let mut state = self.lock();
        let snapshot = state.days.get(user_id).cloned().unwrap_or_default();
        let (tx, stream) = self.open_channel(&snapshot);
        state
            .day_subscribers
            .entry(user_id.to_string())
            .or_default()
            .push(tx);
        Ok(stream)
    }

    async fn subscribe_memories(&self, user_id: &str, day: &DayKey) -> Result<ChangeStream> {
        self.check_subscriptions()?;
        let mut state = self.lock();
        let key = (user_id.to_string(), *day);
        let snapshot = state.memories.get(&key).cloned().unwrap_or_default();
        let (tx, stream) = self.open_channel(&snapshot);
        state.memory_subscribers.entry(key).or_default().push(tx);
        Ok(stream)
    }

    async fn create_memory(
        &self,
        user_id: &str,
        day: &DayKey,
        draft: &MemoryDraft,
    ) -> Result<MemoryRecord> {
        let id = format!("mem-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = draft.clone().into_record(id);
        let mut state = self.lock();
        add_day_locked(&mut state, user_id, day);
        insert_memory_locked(&mut state, user_id, day, record.to_document());
        Ok(record)
    }

    async fn create_user(&self, user_id: &str, profile: &UserProfile) -> Result<()> {
        self.lock()
            .profiles
            .insert(user_id.to_string(), profile.clone());
        Ok(())
    }

    async fn fetch_user(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.profile(user_id))
    }
}

#[async_trait]
impl BlobSource for InMemoryRemoteStore {
    async fn resolve_media_blob(&self, url: &str) -> Result<BlobStream> {
        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        let blob = self.lock().blobs.get(url).cloned();
        match blob {
            Some(bytes) => Ok(futures::stream::iter(vec![Ok(bytes)]).boxed()),
            None => Err(Error::Remote(format!("no object at {}", url))),
        }
    }
}

struct Account {
    password: String,
    user: AuthUser,
}

/// Email/password auth provider held in memory
#[derive(Default)]
pub struct InMemoryAuth {
    accounts: Mutex<HashMap<String, Account>>,
    current: Mutex<Option<AuthUser>>,
    fail_sign_out: AtomicBool,
}

impl InMemoryAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account and return its identity
    pub fn add_account(&self, email: &str, password: &str) -> AuthUser {
        let user = AuthUser {
            uid: uuid::Uuid::new_v4().to_string(),
            email: email.to_string(),
        };
        self.accounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                email.to_string(),
                Account {
                    password: password.to_string(),
                    user: user.clone(),
                },
            );
        user
    }

    /// Make `sign_out` fail with a provider error
    pub fn set_fail_sign_out(&self, fail: bool) {
        self.fail_sign_out.store(fail, Ordering::SeqCst);
    }

    pub fn current_user(&self) -> Option<AuthUser> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_current(&self, user: Option<AuthUser>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = user;
    }
}

#[async_trait]
impl AuthProvider for InMemoryAuth {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser> {
        let user = {
            let accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
            match accounts.get(email) {
                Some(account) if account.password == password => account.user.clone(),
                _ => return Err(AuthError::InvalidCredentials.into()),
            }
        };
        self.set_current(Some(user.clone()));
        Ok(user)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser> {
        let exists = self
            .accounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(email);
        if exists {
            return Err(AuthError::AccountExists(email.to_string()).into());
        }
        let user = self.add_account(email, password);
        self.set_current(Some(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> Result<()> {
        if self.fail_sign_out.load(Ordering::SeqCst) {
            return Err(AuthError::Provider("network unavailable".to_string()).into());
        }
        self.set_current(None);
        Ok(())
    }
}
