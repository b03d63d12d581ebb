//! Session-scoped sync orchestration
//!
//! `SyncController` owns the canonical day and memory lists for one session.
//! It opens remote subscriptions as the session moves through its states,
//! reconciles each incoming change batch into the lists, republishes the full
//! lists to registered listeners, and asks the media cache to materialize the
//! images and audio referenced by newly added memories.
//!
//! Batch application, listener replay and scope transitions all run under one
//! async gate, so listeners never observe a half-applied batch and a new
//! listener never misses an update. The gate is never held across a call to
//! the auth provider or the remote store. Every subscription is tagged with
//! an epoch; a batch, or a freshly opened stream, whose epoch is no longer
//! current is dropped without any notification.

use super::change::ChangeBatch;
use super::reconciler::ChangeReconciler;
use super::registry::{
    DataEvent, DatabaseChange, DatabaseListener, ListenerHandle, ListenerRegistry,
};
use crate::cache::MediaCache;
use crate::error::{AuthError, Error, Result};
use crate::model::{
    AuthUser, DayKey, DayRecord, MemoryDraft, MemoryRecord, RawDocument, UserProfile,
};
use crate::remote::{AuthProvider, ChangeStream, RemoteStore};
use futures::StreamExt;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Remote subscriptions held by a signed-in session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscribed {
    None,
    Days,
    DaysAndMemories(DayKey),
}

/// Authenticated session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No user
    SignedOut,
    /// Waiting on the auth provider
    SigningIn,
    /// A user is signed in
    SignedIn {
        user_id: String,
        subscribed: Subscribed,
    },
}

impl SessionState {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::SignedIn { user_id, .. } => Some(user_id),
            _ => None,
        }
    }

    pub fn is_signed_in(&self) -> bool {
        matches!(self, Self::SignedIn { .. })
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignedOut => write!(f, "signed_out"),
            Self::SigningIn => write!(f, "signing_in"),
            Self::SignedIn { .. } => write!(f, "signed_in"),
        }
    }
}

/// Session change raised by the auth provider on its own, e.g. a restored
/// login at startup or a revoked token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(AuthUser),
    SignedOut,
}

#[derive(Debug, Clone, Copy)]
enum Scope {
    Days,
    Memories(DayKey),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Days => write!(f, "days"),
            Self::Memories(day) => write!(f, "memories:{}", day),
        }
    }
}

struct State {
    session: SessionState,
    user: Option<AuthUser>,
    profile: Option<UserProfile>,
    days: Vec<DayRecord>,
    memories: Vec<MemoryRecord>,
    selected_day: Option<DayKey>,
    days_epoch: u64,
    memories_epoch: u64,
    days_token: Option<CancellationToken>,
    memories_token: Option<CancellationToken>,
}

impl State {
    fn set_subscribed(&mut self, value: Subscribed) {
        if let SessionState::SignedIn { subscribed, .. } = &mut self.session {
            *subscribed = value;
        }
    }

    fn cancel_memories(&mut self) {
        if let Some(token) = self.memories_token.take() {
            token.cancel();
        }
    }

    fn cancel_all(&mut self) {
        self.cancel_memories();
        if let Some(token) = self.days_token.take() {
            token.cancel();
        }
    }
}

struct Inner {
    remote: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthProvider>,
    cache: MediaCache,
    registry: ListenerRegistry,
    gate: Mutex<()>,
    state: RwLock<State>,
    epochs: AtomicU64,
}

/// Owner of the canonical day and memory lists for one session.
///
/// Cloning is cheap and every clone drives the same session. Subscription
/// tasks only hold a weak reference, so dropping the last clone cancels them.
#[derive(Clone)]
pub struct SyncController {
    inner: Arc<Inner>,
}

impl SyncController {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthProvider>,
        cache: MediaCache,
    ) -> Self {
        let epochs = AtomicU64::new(1);
        let days_epoch = epochs.fetch_add(1, Ordering::Relaxed);
        let memories_epoch = epochs.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(Inner {
                remote,
                auth,
                cache,
                registry: ListenerRegistry::new(),
                gate: Mutex::new(()),
                state: RwLock::new(State {
                    session: SessionState::SignedOut,
                    user: None,
                    profile: None,
                    days: Vec::new(),
                    memories: Vec::new(),
                    selected_day: None,
                    days_epoch,
                    memories_epoch,
                    days_token: None,
                    memories_token: None,
                }),
                epochs,
            }),
        }
    }

    // ========================================================================
    // Session transitions
    // ========================================================================

    /// Sign in and subscribe to the user's days.
    ///
    /// Auth failures leave the controller signed out. A failure to open the
    /// days subscription is returned after the session is established.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser> {
        self.inner.begin_sign_in().await?;
        let user = match self.inner.auth.sign_in(email, password).await {
            Ok(user) => user,
            Err(e) => {
                self.inner.abort_sign_in().await;
                return Err(e);
            }
        };
        let profile = self.inner.fetch_profile(&user.uid).await;
        self.inner.start_session(user.clone(), profile).await?;
        Ok(user)
    }

    /// Create an account, store its profile document, and sign in.
    ///
    /// A failed profile write is logged and does not fail the sign-up.
    pub async fn sign_up(&self, email: &str, password: &str, name: &str) -> Result<AuthUser> {
        self.inner.begin_sign_in().await?;
        let user = match self.inner.auth.sign_up(email, password).await {
            Ok(user) => user,
            Err(e) => {
                self.inner.abort_sign_in().await;
                return Err(e);
            }
        };

        let profile = UserProfile {
            name: name.to_string(),
            email: user.email.clone(),
        };
        if let Err(e) = self.inner.remote.create_user(&user.uid, &profile).await {
            tracing::warn!(user_id = %user.uid, error = %e, "Failed to write user profile");
        }

        self.inner.start_session(user.clone(), Some(profile)).await?;
        Ok(user)
    }

    /// Sign out through the auth provider, then drop every subscription and
    /// list. If the provider refuses, the session is left untouched.
    pub async fn sign_out(&self) -> Result<()> {
        if !self.inner.state.read().await.session.is_signed_in() {
            return Err(AuthError::NotSignedIn.into());
        }
        self.inner.auth.sign_out().await?;

        let _gate = self.inner.gate.lock().await;
        if self.inner.state.read().await.session.is_signed_in() {
            self.inner.end_session().await;
        }
        Ok(())
    }

    /// React to a session change the auth provider reports on its own.
    ///
    /// Events that arrive while a sign-in is in flight are left to that
    /// sign-in.
    pub async fn handle_auth_event(&self, event: AuthEvent) -> Result<()> {
        match event {
            AuthEvent::SignedIn(user) => {
                {
                    let _gate = self.inner.gate.lock().await;
                    let session = self.inner.state.read().await.session.clone();
                    match session {
                        SessionState::SigningIn => {
                            tracing::debug!(user_id = %user.uid, "Sign-in in flight; ignoring auth event");
                            return Ok(());
                        }
                        SessionState::SignedIn { user_id, .. } if user_id == user.uid => {
                            return Ok(());
                        }
                        SessionState::SignedIn { .. } => self.inner.end_session().await,
                        SessionState::SignedOut => {}
                    }
                    self.inner.state.write().await.session = SessionState::SigningIn;
                }
                let profile = self.inner.fetch_profile(&user.uid).await;
                self.inner.start_session(user, profile).await
            }
            AuthEvent::SignedOut => {
                let _gate = self.inner.gate.lock().await;
                if self.inner.state.read().await.session.is_signed_in() {
                    self.inner.end_session().await;
                }
                Ok(())
            }
        }
    }

    /// Switch the memories subscription to `day`.
    ///
    /// The previous memories subscription is cancelled and listeners receive
    /// an empty list before the new day's data arrives. Days after today are
    /// rejected with [`Error::InvalidSelection`]. If another selection or a
    /// sign-out lands while the subscription is opening, that one wins.
    pub async fn select_day(&self, day: DayKey) -> Result<()> {
        let today = DayKey::today();
        if day > today {
            return Err(Error::InvalidSelection(format!(
                "{} is later than today ({})",
                day, today
            )));
        }

        let (epoch, user_id) = {
            let _gate = self.inner.gate.lock().await;
            let epoch = self.inner.next_epoch();
            let user_id = {
                let mut state = self.inner.state.write().await;
                let user_id = state
                    .session
                    .user_id()
                    .map(str::to_string)
                    .ok_or(AuthError::NotSignedIn)?;
                state.cancel_memories();
                state.memories.clear();
                state.selected_day = Some(day);
                state.memories_epoch = epoch;
                let held = if state.days_token.is_some() {
                    Subscribed::Days
                } else {
                    Subscribed::None
                };
                state.set_subscribed(held);
                user_id
            };
            tracing::info!(day = %day, epoch, "Selected day");
            self.inner.publish_memories(&[]);
            (epoch, user_id)
        };

        let stream = self
            .inner
            .remote
            .subscribe_memories(&user_id, &day)
            .await
            .map_err(subscription_error)?;

        let _gate = self.inner.gate.lock().await;
        let mut state = self.inner.state.write().await;
        if state.memories_epoch != epoch {
            tracing::debug!(
                day = %day,
                epoch,
                current = state.memories_epoch,
                "Selection superseded; dropping memories subscription"
            );
            return Ok(());
        }
        let token = CancellationToken::new();
        self.inner
            .spawn_subscription(Scope::Memories(day), epoch, stream, token.clone());
        state.memories_token = Some(token);
        state.set_subscribed(Subscribed::DaysAndMemories(day));
        Ok(())
    }

    /// Store a new memory under the selected day. The record also arrives
    /// through the memories subscription like any other addition.
    pub async fn create_memory(&self, draft: &MemoryDraft) -> Result<MemoryRecord> {
        let (user_id, day) = {
            let state = self.inner.state.read().await;
            let user_id = state
                .session
                .user_id()
                .map(str::to_string)
                .ok_or(AuthError::NotSignedIn)?;
            let day = state
                .selected_day
                .ok_or_else(|| Error::InvalidSelection("no day selected".to_string()))?;
            (user_id, day)
        };

        let record = self.inner.remote.create_memory(&user_id, &day, draft).await?;
        tracing::info!(
            memory_id = %record.id,
            day = %day,
            kind = %record.kind(),
            "Created memory"
        );
        Ok(record)
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Register a listener and immediately deliver the current lists to it
    pub async fn add_listener<L: DatabaseListener + 'static>(
        &self,
        listener: &Arc<L>,
    ) -> ListenerHandle {
        let _gate = self.inner.gate.lock().await;
        let handle = self.inner.registry.add_listener(listener);

        let (days, memories) = {
            let state = self.inner.state.read().await;
            (state.days.clone(), state.memories.clone())
        };
        let target: &dyn DatabaseListener = &**listener;
        DataEvent::Days {
            change: DatabaseChange::Update,
            days: &days,
        }
        .dispatch(target);
        DataEvent::Memories {
            change: DatabaseChange::Update,
            memories: &memories,
        }
        .dispatch(target);

        handle
    }

    /// Unregister a listener; a listener that is not registered is ignored
    pub fn remove_listener<L: DatabaseListener + 'static>(&self, listener: &Arc<L>) {
        self.inner.registry.remove_listener(listener);
    }

    // ========================================================================
    // Batch delivery
    // ========================================================================

    /// Apply a days batch delivered for subscription `epoch`.
    /// Returns `false` when the batch was discarded as stale.
    pub async fn apply_days_batch(&self, epoch: u64, batch: ChangeBatch<RawDocument>) -> bool {
        self.inner.apply_days(epoch, batch).await
    }

    /// Apply a memories batch delivered for subscription `epoch`.
    /// Returns `false` when the batch was discarded as stale.
    pub async fn apply_memories_batch(
        &self,
        epoch: u64,
        batch: ChangeBatch<RawDocument>,
    ) -> bool {
        self.inner.apply_memories(epoch, batch).await
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub async fn state(&self) -> SessionState {
        self.inner.state.read().await.session.clone()
    }

    pub async fn user(&self) -> Option<AuthUser> {
        self.inner.state.read().await.user.clone()
    }

    pub async fn profile(&self) -> Option<UserProfile> {
        self.inner.state.read().await.profile.clone()
    }

    pub async fn selected_day(&self) -> Option<DayKey> {
        self.inner.state.read().await.selected_day
    }

    pub async fn days(&self) -> Vec<DayRecord> {
        self.inner.state.read().await.days.clone()
    }

    pub async fn memories(&self) -> Vec<MemoryRecord> {
        self.inner.state.read().await.memories.clone()
    }

    /// Epoch of the current days subscription
    pub async fn days_epoch(&self) -> u64 {
        self.inner.state.read().await.days_epoch
    }

    /// Epoch of the current memories subscription
    pub async fn memories_epoch(&self) -> u64 {
        self.inner.state.read().await.memories_epoch
    }

    pub fn cache(&self) -> &MediaCache {
        &self.inner.cache
    }
}

impl Inner {
    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed)
    }

    async fn begin_sign_in(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        let mut state = self.state.write().await;
        if state.session != SessionState::SignedOut {
            return Err(AuthError::AlreadySignedIn.into());
        }
        state.session = SessionState::SigningIn;
        Ok(())
    }

    async fn abort_sign_in(&self) {
        let _gate = self.gate.lock().await;
        let mut state = self.state.write().await;
        if state.session == SessionState::SigningIn {
            state.session = SessionState::SignedOut;
        }
    }

    async fn fetch_profile(&self, user_id: &str) -> Option<UserProfile> {
        match self.remote.fetch_user(user_id).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Failed to fetch user profile");
                None
            }
        }
    }

    /// Enter `SignedIn` and open the days subscription. The gate is held only
    /// around the state changes, not while the subscription opens.
    async fn start_session(
        self: &Arc<Self>,
        user: AuthUser,
        profile: Option<UserProfile>,
    ) -> Result<()> {
        let user_id = user.uid.clone();
        let epoch = {
            let _gate = self.gate.lock().await;
            let epoch = self.next_epoch();
            let mut state = self.state.write().await;
            state.session = SessionState::SignedIn {
                user_id: user_id.clone(),
                subscribed: Subscribed::None,
            };
            state.user = Some(user);
            state.profile = profile;
            state.days_epoch = epoch;
            epoch
        };
        tracing::info!(user_id = %user_id, "Signed in");

        let stream = self
            .remote
            .subscribe_days(&user_id)
            .await
            .map_err(subscription_error)?;

        let _gate = self.gate.lock().await;
        let mut state = self.state.write().await;
        if state.days_epoch != epoch {
            tracing::debug!(
                user_id = %user_id,
                epoch,
                current = state.days_epoch,
                "Session ended; dropping days subscription"
            );
            return Ok(());
        }
        let token = CancellationToken::new();
        self.spawn_subscription(Scope::Days, epoch, stream, token.clone());
        state.days_token = Some(token);
        state.set_subscribed(Subscribed::Days);
        Ok(())
    }

    /// Drop subscriptions, lists and cache bookkeeping. Caller holds the gate.
    async fn end_session(&self) {
        let days_epoch = self.next_epoch();
        let memories_epoch = self.next_epoch();
        {
            let mut state = self.state.write().await;
            state.cancel_all();
            state.session = SessionState::SignedOut;
            state.user = None;
            state.profile = None;
            state.days.clear();
            state.memories.clear();
            state.selected_day = None;
            state.days_epoch = days_epoch;
            state.memories_epoch = memories_epoch;
        }
        self.cache.clear_index();
        tracing::info!("Signed out");

        self.publish_days(&[]);
        self.publish_memories(&[]);
    }

    fn spawn_subscription(
        self: &Arc<Self>,
        scope: Scope,
        epoch: u64,
        mut stream: ChangeStream,
        token: CancellationToken,
    ) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        tokio::spawn(async move {
            tracing::info!(scope = %scope, epoch, "Subscription opened");
            loop {
                let item = tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!(scope = %scope, epoch, "Subscription cancelled");
                        break;
                    }
                    item = stream.next() => item,
                };
                let Some(item) = item else {
                    tracing::info!(scope = %scope, epoch, "Subscription closed by remote");
                    break;
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match item {
                    Ok(batch) => {
                        match scope {
                            Scope::Days => inner.apply_days(epoch, batch).await,
                            Scope::Memories(_) => inner.apply_memories(epoch, batch).await,
                        };
                    }
                    Err(e) => {
                        tracing::warn!(
                            scope = %scope,
                            epoch,
                            error = %e,
                            "Subscription delivery failed"
                        );
                    }
                }
            }
        });
    }

    async fn apply_days(&self, epoch: u64, batch: ChangeBatch<RawDocument>) -> bool {
        let _gate = self.gate.lock().await;
        let mut state = self.state.write().await;
        if state.days_epoch != epoch || !state.session.is_signed_in() {
            tracing::debug!(epoch, current = state.days_epoch, "Discarding stale days batch");
            return false;
        }

        let (batch, errors) = batch.decode(DayRecord::decode);
        for e in &errors {
            tracing::warn!(epoch, error = %e, "Skipping malformed day document");
        }
        let outcome = ChangeReconciler::apply_decoded(&mut state.days, batch);
        tracing::debug!(
            epoch,
            added = outcome.added.len(),
            removed = outcome.removed,
            skipped = outcome.skipped,
            "Applied days batch"
        );

        let days = state.days.clone();
        drop(state);
        self.publish_days(&days);
        true
    }

    async fn apply_memories(&self, epoch: u64, batch: ChangeBatch<RawDocument>) -> bool {
        let _gate = self.gate.lock().await;
        let mut state = self.state.write().await;
        if state.memories_epoch != epoch || state.selected_day.is_none() {
            tracing::debug!(
                epoch,
                current = state.memories_epoch,
                "Discarding stale memories batch"
            );
            return false;
        }

        let (batch, errors) = batch.decode(MemoryRecord::decode);
        for e in &errors {
            tracing::warn!(epoch, error = %e, "Skipping malformed memory document");
        }
        let outcome = ChangeReconciler::apply_decoded(&mut state.memories, batch);
        tracing::debug!(
            epoch,
            added = outcome.added.len(),
            modified = outcome.modified,
            removed = outcome.removed,
            skipped = outcome.skipped,
            "Applied memories batch"
        );

        let memories = state.memories.clone();
        let token = state.memories_token.clone().unwrap_or_default();
        drop(state);

        self.publish_memories(&memories);
        self.populate_media(&outcome.added, &token);
        true
    }

    /// Start a cache fill for every image and audio URL in `records`. The
    /// waits end when `token` is cancelled; shared downloads keep running for
    /// any other waiter.
    fn populate_media(&self, records: &[MemoryRecord], token: &CancellationToken) {
        for record in records {
            for (url, kind) in record.content.cacheable_media() {
                let cache = self.cache.clone();
                let token = token.clone();
                let url = url.to_string();
                let memory_id = record.id.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {
                            tracing::debug!(url = %url, "Stopped waiting for media");
                        }
                        result = cache.ensure(&url, kind) => {
                            if let Err(e) = result {
                                tracing::warn!(
                                    memory_id = %memory_id,
                                    url = %url,
                                    error = %e,
                                    "Failed to cache media"
                                );
                            }
                        }
                    }
                });
            }
        }
    }

    fn publish_days(&self, days: &[DayRecord]) {
        self.registry.invoke(&DataEvent::Days {
            change: DatabaseChange::Update,
            days,
        });
    }

    fn publish_memories(&self, memories: &[MemoryRecord]) {
        self.registry.invoke(&DataEvent::Memories {
            change: DatabaseChange::Update,
            memories,
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.state.get_mut().cancel_all();
    }
}

fn subscription_error(e: Error) -> Error {
    match e {
        Error::Subscription(_) => e,
        other => Error::Subscription(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DiskStorage;
    use crate::model::{MemoryContent, MemoryKind};
    use crate::remote::{AuthProvider, BlobSource, BlobStream, InMemoryAuth, InMemoryRemoteStore};
    use crate::sync::Change;
    use crate::sync::ListenerType;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct Recorder {
        days: StdMutex<Vec<Vec<String>>>,
        memories: StdMutex<Vec<Vec<String>>>,
    }

    impl Recorder {
        fn last_days(&self) -> Option<Vec<String>> {
            self.days.lock().unwrap().last().cloned()
        }

        fn last_memories(&self) -> Option<Vec<String>> {
            self.memories.lock().unwrap().last().cloned()
        }

        fn memory_updates(&self) -> usize {
            self.memories.lock().unwrap().len()
        }
    }

    impl DatabaseListener for Recorder {
        fn listener_type(&self) -> ListenerType {
            ListenerType::All
        }

        fn on_memories_change(&self, _change: DatabaseChange, memories: &[MemoryRecord]) {
            let ids = memories.iter().map(|m| m.id.clone()).collect();
            self.memories.lock().unwrap().push(ids);
        }

        fn on_days_change(&self, _change: DatabaseChange, days: &[DayRecord]) {
            let ids = days.iter().map(|d| d.id().to_string()).collect();
            self.days.lock().unwrap().push(ids);
        }
    }

    struct Harness {
        controller: SyncController,
        store: Arc<InMemoryRemoteStore>,
        auth: Arc<InMemoryAuth>,
        recorder: Arc<Recorder>,
        _handle: ListenerHandle,
        _dir: TempDir,
    }

    const EMAIL: &str = "liang@example.com";
    const PASSWORD: &str = "hunter22";

    /// Wraps a collaborator and holds each sign-in or blob fetch until the
    /// gate hands out a permit.
    struct Held<T> {
        inner: Arc<T>,
        gate: Arc<Semaphore>,
        entered: AtomicUsize,
    }

    impl<T> Held<T> {
        fn new(inner: Arc<T>) -> (Arc<Self>, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            let held = Arc::new(Self {
                inner,
                gate: gate.clone(),
                entered: AtomicUsize::new(0),
            });
            (held, gate)
        }

        async fn hold(&self) {
            self.entered.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.unwrap();
        }

        fn entered(&self) -> usize {
            self.entered.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthProvider for Held<InMemoryAuth> {
        async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser> {
            self.hold().await;
            self.inner.sign_in(email, password).await
        }

        async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser> {
            self.inner.sign_up(email, password).await
        }

        async fn sign_out(&self) -> Result<()> {
            self.inner.sign_out().await
        }
    }

    #[async_trait]
    impl BlobSource for Held<InMemoryRemoteStore> {
        async fn resolve_media_blob(&self, url: &str) -> Result<BlobStream> {
            self.hold().await;
            self.inner.resolve_media_blob(url).await
        }
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryRemoteStore::new());
        let auth = Arc::new(InMemoryAuth::new());
        build(store.clone(), auth.clone(), store, auth).await
    }

    async fn build(
        store: Arc<InMemoryRemoteStore>,
        auth: Arc<InMemoryAuth>,
        source: Arc<dyn BlobSource>,
        provider: Arc<dyn AuthProvider>,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let storage = DiskStorage::open(dir.path()).await.unwrap();
        let cache = MediaCache::new(Arc::new(storage), source, 4);
        let controller = SyncController::new(store.clone(), provider, cache);
        let recorder = Arc::new(Recorder::default());
        let handle = controller.add_listener(&recorder).await;
        Harness {
            controller,
            store,
            auth,
            recorder,
            _handle: handle,
            _dir: dir,
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn day(s: &str) -> DayKey {
        s.parse().unwrap()
    }

    fn text_doc(id: &str, text: &str) -> RawDocument {
        RawDocument::from_value(
            id,
            json!({ "type": "text", "datetime": "2023-05-04T09:00:00Z", "title": "t", "text": text }),
        )
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    async fn signed_in(h: &Harness) -> AuthUser {
        let account = h.auth.add_account(EMAIL, PASSWORD);
        let user = h.controller.sign_in(EMAIL, PASSWORD).await.unwrap();
        assert_eq!(user, account);
        user
    }

    #[tokio::test]
    async fn test_sign_in_subscribes_to_days() {
        let h = harness().await;
        let account = h.auth.add_account(EMAIL, PASSWORD);
        h.store.add_day(&account.uid, &day("2023-05-03"));
        h.store.add_day(&account.uid, &day("2023-05-04"));

        let user = h.controller.sign_in(EMAIL, PASSWORD).await.unwrap();
        assert_eq!(
            h.controller.state().await,
            SessionState::SignedIn {
                user_id: user.uid.clone(),
                subscribed: Subscribed::Days,
            }
        );

        let rec = h.recorder.clone();
        eventually(move || rec.last_days() == Some(ids(&["2023-05-03", "2023-05-04"]))).await;

        h.store.add_day(&user.uid, &day("2023-05-05"));
        let rec = h.recorder.clone();
        eventually(move || rec.last_days().map(|d| d.len()) == Some(3)).await;
        assert_eq!(h.controller.days().await.len(), 3);
    }

    #[tokio::test]
    async fn test_select_day_clears_and_resubscribes() {
        let h = harness().await;
        let user = signed_in(&h).await;
        h.store.insert_memory(&user.uid, &day("2023-05-03"), text_doc("a1", "one"));
        h.store.insert_memory(&user.uid, &day("2023-05-04"), text_doc("b1", "two"));

        h.controller.select_day(day("2023-05-03")).await.unwrap();
        let rec = h.recorder.clone();
        eventually(move || rec.last_memories() == Some(ids(&["a1"]))).await;

        h.controller.select_day(day("2023-05-04")).await.unwrap();
        // The empty list is published before the new day's data
        assert_eq!(h.recorder.last_memories(), Some(Vec::new()));
        assert_eq!(h.controller.selected_day().await, Some(day("2023-05-04")));
        assert_eq!(
            h.controller.state().await,
            SessionState::SignedIn {
                user_id: user.uid.clone(),
                subscribed: Subscribed::DaysAndMemories(day("2023-05-04")),
            }
        );

        let rec = h.recorder.clone();
        eventually(move || rec.last_memories() == Some(ids(&["b1"]))).await;

        // The old day's subscription is gone
        let store = h.store.clone();
        let uid = user.uid.clone();
        eventually(move || store.memory_subscribers(&uid, &day("2023-05-03")) == 0).await;
    }

    #[tokio::test]
    async fn test_late_listener_receives_current_lists() {
        let h = harness().await;
        let user = signed_in(&h).await;
        h.store.add_day(&user.uid, &day("2023-05-04"));
        h.store.insert_memory(&user.uid, &day("2023-05-04"), text_doc("m1", "x"));
        h.store.insert_memory(&user.uid, &day("2023-05-04"), text_doc("m2", "y"));
        h.controller.select_day(day("2023-05-04")).await.unwrap();

        let rec = h.recorder.clone();
        eventually(move || {
            rec.last_memories() == Some(ids(&["m1", "m2"]))
                && rec.last_days() == Some(ids(&["2023-05-04"]))
        })
        .await;

        let late = Arc::new(Recorder::default());
        let _handle = h.controller.add_listener(&late).await;
        assert_eq!(*late.memories.lock().unwrap(), vec![ids(&["m1", "m2"])]);
        assert_eq!(*late.days.lock().unwrap(), vec![ids(&["2023-05-04"])]);

        h.store.insert_memory(&user.uid, &day("2023-05-04"), text_doc("m3", "z"));
        let late_rec = late.clone();
        eventually(move || late_rec.last_memories() == Some(ids(&["m1", "m2", "m3"]))).await;
        assert_eq!(late.memory_updates(), 2);
    }

    #[tokio::test]
    async fn test_stale_epoch_batch_is_discarded() {
        let h = harness().await;
        let user = signed_in(&h).await;
        h.store.insert_memory(&user.uid, &day("2023-05-04"), text_doc("b0", "x"));

        h.controller.select_day(day("2023-05-03")).await.unwrap();
        let stale = h.controller.memories_epoch().await;
        h.controller.select_day(day("2023-05-04")).await.unwrap();
        let current = h.controller.memories_epoch().await;
        assert!(current > stale);

        // Once the new day's snapshot has landed nothing else is pending
        let rec = h.recorder.clone();
        eventually(move || rec.last_memories() == Some(ids(&["b0"]))).await;
        let updates = h.recorder.memory_updates();

        let batch = ChangeBatch::new(vec![Change::added(text_doc("late", "x"), 0)]);
        assert!(!h.controller.apply_memories_batch(stale, batch.clone()).await);
        assert_eq!(h.recorder.memory_updates(), updates);
        assert_eq!(h.controller.memories().await.len(), 1);

        assert!(h.controller.apply_memories_batch(current, batch).await);
        assert_eq!(h.recorder.memory_updates(), updates + 1);
        assert_eq!(h.recorder.last_memories(), Some(ids(&["late", "b0"])));
    }

    #[tokio::test]
    async fn test_malformed_memory_is_skipped() {
        let h = harness().await;
        let user = signed_in(&h).await;
        let d = day("2023-05-04");
        h.controller.select_day(d).await.unwrap();

        let bad = RawDocument::from_value(
            "bad",
            json!({ "type": "images", "datetime": "2023-05-04T09:00:00Z", "text": "oops", "images": [] }),
        );
        h.store.send_memories_batch(
            &user.uid,
            &d,
            ChangeBatch::new(vec![
                Change::added(text_doc("a", "one"), 0),
                Change::added(bad, 1),
                Change::added(text_doc("b", "two"), 1),
            ]),
        );

        let rec = h.recorder.clone();
        eventually(move || rec.last_memories() == Some(ids(&["a", "b"]))).await;
    }

    #[tokio::test]
    async fn test_added_media_is_cached() {
        let h = harness().await;
        let user = signed_in(&h).await;
        let d = day("2023-05-04");
        h.store.put_blob("https://cdn.example.com/u/1.jpg", b"jpeg".to_vec());
        h.store.put_blob("https://cdn.example.com/u/note", b"m4a".to_vec());

        h.store.insert_memory(
            &user.uid,
            &d,
            RawDocument::from_value(
                "img",
                json!({ "type": "images", "datetime": "2023-05-04T09:00:00Z",
                        "images": ["https://cdn.example.com/u/1.jpg"] }),
            ),
        );
        h.store.insert_memory(
            &user.uid,
            &d,
            RawDocument::from_value(
                "voice",
                json!({ "type": "audio", "datetime": "2023-05-04T09:10:00Z",
                        "audio": "https://cdn.example.com/u/note" }),
            ),
        );
        h.store.insert_memory(
            &user.uid,
            &d,
            RawDocument::from_value(
                "anim",
                json!({ "type": "gif", "datetime": "2023-05-04T09:20:00Z",
                        "gif": "https://giphy.example.com/cat.gif" }),
            ),
        );

        h.controller.select_day(d).await.unwrap();

        let cache = h.controller.cache().clone();
        let mut cached = false;
        for _ in 0..300 {
            if cache.has("1.jpg.jpg").await && cache.has("note.m4a").await {
                cached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cached);
        assert_eq!(cache.read("1.jpg.jpg").await.unwrap(), b"jpeg");
        // GIFs are not cached
        assert_eq!(h.store.blob_fetches(), 2);
    }

    #[tokio::test]
    async fn test_sign_out_clears_lists_and_index() {
        let h = harness().await;
        let user = signed_in(&h).await;
        let d = day("2023-05-04");
        h.store.add_day(&user.uid, &d);
        h.store.put_blob("https://cdn.example.com/u/2.jpg", b"jpeg".to_vec());
        h.store.insert_memory(
            &user.uid,
            &d,
            RawDocument::from_value(
                "img",
                json!({ "type": "images", "datetime": "2023-05-04T09:00:00Z",
                        "images": ["https://cdn.example.com/u/2.jpg"] }),
            ),
        );
        h.controller.select_day(d).await.unwrap();

        let cache = h.controller.cache().clone();
        for _ in 0..300 {
            if cache.indexed_len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.indexed_len(), 1);

        h.controller.sign_out().await.unwrap();
        assert_eq!(h.controller.state().await, SessionState::SignedOut);
        assert!(h.controller.days().await.is_empty());
        assert!(h.controller.memories().await.is_empty());
        assert_eq!(h.controller.selected_day().await, None);
        assert_eq!(h.controller.user().await, None);
        assert_eq!(h.recorder.last_days(), Some(Vec::new()));
        assert_eq!(h.recorder.last_memories(), Some(Vec::new()));

        // Bookkeeping is dropped, the file stays on disk
        assert_eq!(cache.indexed_len(), 0);
        assert!(cache.has("2.jpg.jpg").await);

        let store = h.store.clone();
        let uid = user.uid.clone();
        eventually(move || store.memory_subscribers(&uid, &d) == 0 && store.day_subscribers(&uid) == 0)
            .await;
    }

    #[tokio::test]
    async fn test_auth_errors_are_surfaced() {
        let h = harness().await;
        h.auth.add_account(EMAIL, PASSWORD);

        let err = h.controller.sign_in(EMAIL, "wrong").await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::InvalidCredentials)));
        assert_eq!(err.kind(), "auth");
        assert_eq!(h.controller.state().await, SessionState::SignedOut);

        let err = h.controller.sign_out().await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::NotSignedIn)));

        h.controller.sign_in(EMAIL, PASSWORD).await.unwrap();
        let err = h.controller.sign_in(EMAIL, PASSWORD).await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::AlreadySignedIn)));

        h.auth.set_fail_sign_out(true);
        let err = h.controller.sign_out().await.unwrap_err();
        assert_eq!(err.kind(), "auth");
        assert!(h.controller.state().await.is_signed_in());
    }

    #[tokio::test]
    async fn test_select_day_validation() {
        let h = harness().await;
        let err = h
            .controller
            .select_day(day("2023-05-04"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::NotSignedIn)));

        signed_in(&h).await;
        let tomorrow = DayKey::from_date(DayKey::today().date().succ_opt().unwrap());
        let err = h.controller.select_day(tomorrow).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_selection");
        assert_eq!(h.controller.selected_day().await, None);

        h.controller.select_day(DayKey::today()).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscription_setup_failure_propagates() {
        let h = harness().await;
        let user = signed_in(&h).await;

        h.store.set_fail_subscriptions(true);
        let err = h
            .controller
            .select_day(day("2023-05-04"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "subscription");
        assert_eq!(
            h.controller.state().await,
            SessionState::SignedIn {
                user_id: user.uid,
                subscribed: Subscribed::Days,
            }
        );

        // Reselecting after the backend recovers re-subscribes
        h.store.set_fail_subscriptions(false);
        h.controller.select_day(day("2023-05-04")).await.unwrap();
    }

    #[tokio::test]
    async fn test_delivery_error_does_not_end_subscription() {
        let h = harness().await;
        let user = signed_in(&h).await;
        let d = day("2023-05-04");
        h.controller.select_day(d).await.unwrap();

        h.store.send_memories_error(&user.uid, &d, "deadline exceeded");
        h.store.insert_memory(&user.uid, &d, text_doc("after", "x"));

        let rec = h.recorder.clone();
        eventually(move || rec.last_memories() == Some(ids(&["after"]))).await;
    }

    #[tokio::test]
    async fn test_create_memory_round_trip() {
        let h = harness().await;
        signed_in(&h).await;

        let draft = MemoryDraft::new("Lunch", MemoryContent::Text("noodles".to_string()));
        let err = h.controller.create_memory(&draft).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_selection");

        h.controller.select_day(day("2023-05-04")).await.unwrap();
        let record = h.controller.create_memory(&draft).await.unwrap();
        assert!(!record.id.is_empty());
        assert_eq!(record.kind(), MemoryKind::Text);
        assert_eq!(record.title, "Lunch");

        let rec = h.recorder.clone();
        let id = record.id.clone();
        eventually(move || rec.last_memories() == Some(vec![id.clone()])).await;
        assert_eq!(h.controller.memories().await, vec![record]);
    }

    #[tokio::test]
    async fn test_sign_up_writes_profile() {
        let h = harness().await;
        let user = h
            .controller
            .sign_up("mei@example.com", PASSWORD, "Mei")
            .await
            .unwrap();

        let expected = UserProfile {
            name: "Mei".to_string(),
            email: "mei@example.com".to_string(),
        };
        assert_eq!(h.store.profile(&user.uid), Some(expected.clone()));
        assert_eq!(h.controller.profile().await, Some(expected.clone()));

        h.controller.sign_out().await.unwrap();
        assert_eq!(h.controller.profile().await, None);

        // Profile is fetched again on the next sign-in
        h.controller.sign_in("mei@example.com", PASSWORD).await.unwrap();
        assert_eq!(h.controller.profile().await, Some(expected));
        h.controller.sign_out().await.unwrap();

        let err = h
            .controller
            .sign_up("mei@example.com", PASSWORD, "Mei")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::AccountExists(_))));
        assert_eq!(h.controller.state().await, SessionState::SignedOut);
    }

    #[tokio::test]
    async fn test_auth_events_drive_session() {
        let h = harness().await;
        let account = h.auth.add_account(EMAIL, PASSWORD);
        h.store.add_day(&account.uid, &day("2023-05-04"));

        h.controller
            .handle_auth_event(AuthEvent::SignedIn(account.clone()))
            .await
            .unwrap();
        assert_eq!(h.controller.user().await, Some(account.clone()));
        let rec = h.recorder.clone();
        eventually(move || rec.last_days() == Some(ids(&["2023-05-04"]))).await;

        // Same user again is a no-op
        let epoch = h.controller.days_epoch().await;
        h.controller
            .handle_auth_event(AuthEvent::SignedIn(account))
            .await
            .unwrap();
        assert_eq!(h.controller.days_epoch().await, epoch);

        h.controller
            .handle_auth_event(AuthEvent::SignedOut)
            .await
            .unwrap();
        assert_eq!(h.controller.state().await, SessionState::SignedOut);
        assert_eq!(h.recorder.last_days(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_removed_listener_stops_receiving() {
        let h = harness().await;
        let user = signed_in(&h).await;
        let other = Arc::new(Recorder::default());
        let _handle = h.controller.add_listener(&other).await;
        h.controller.remove_listener(&other);

        h.controller.select_day(day("2023-05-04")).await.unwrap();
        h.store.insert_memory(&user.uid, &day("2023-05-04"), text_doc("x", "x"));
        let rec = h.recorder.clone();
        eventually(move || rec.last_memories() == Some(ids(&["x"]))).await;

        // Only the replay on registration
        assert_eq!(other.memory_updates(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_removal_still_removes() {
        let h = harness().await;
        let user = signed_in(&h).await;
        let d = day("2023-05-04");
        h.controller.select_day(d).await.unwrap();

        h.store.send_memories_batch(
            &user.uid,
            &d,
            ChangeBatch::new(vec![Change::added(text_doc("a", "one"), 0)]),
        );
        let rec = h.recorder.clone();
        eventually(move || rec.last_memories() == Some(ids(&["a"]))).await;

        // Text on an images memory no longer decodes
        let broken = RawDocument::from_value(
            "a",
            json!({ "type": "images", "datetime": "2023-05-04T09:00:00Z", "text": "one" }),
        );
        let updates = h.recorder.memory_updates();
        h.store.send_memories_batch(
            &user.uid,
            &d,
            ChangeBatch::new(vec![
                Change::modified(broken.clone(), 0),
                Change::removed(broken, 0),
            ]),
        );

        let rec = h.recorder.clone();
        eventually(move || rec.memory_updates() > updates).await;
        assert_eq!(h.recorder.last_memories(), Some(Vec::new()));
        assert!(h.controller.memories().await.is_empty());
    }

    #[tokio::test]
    async fn test_pending_sign_in_does_not_block_listeners() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let auth = Arc::new(InMemoryAuth::new());
        let (held, gate) = Held::new(auth.clone());
        let h = build(store.clone(), auth, store, held.clone()).await;
        h.auth.add_account(EMAIL, PASSWORD);

        let controller = h.controller.clone();
        let pending = tokio::spawn(async move { controller.sign_in(EMAIL, PASSWORD).await });
        let watched = held.clone();
        eventually(move || watched.entered() == 1).await;
        assert_eq!(h.controller.state().await, SessionState::SigningIn);

        let late = Arc::new(Recorder::default());
        let registered = tokio::time::timeout(
            Duration::from_secs(1),
            h.controller.add_listener(&late),
        )
        .await;
        let _handle = registered.expect("add_listener waited on the auth provider");
        assert_eq!(*late.memories.lock().unwrap(), vec![Vec::<String>::new()]);

        gate.add_permits(1);
        let user = pending.await.unwrap().unwrap();
        assert_eq!(h.controller.user().await, Some(user));
    }

    #[tokio::test]
    async fn test_notification_does_not_wait_for_media() {
        let store = Arc::new(InMemoryRemoteStore::new());
        let auth = Arc::new(InMemoryAuth::new());
        let (held, gate) = Held::new(store.clone());
        let h = build(store, auth.clone(), held.clone(), auth).await;
        let user = signed_in(&h).await;
        let d = day("2023-05-04");
        h.store.put_blob("https://cdn.example.com/u/3.jpg", b"jpeg".to_vec());
        h.store.insert_memory(
            &user.uid,
            &d,
            RawDocument::from_value(
                "img",
                json!({ "type": "images", "datetime": "2023-05-04T09:00:00Z",
                        "images": ["https://cdn.example.com/u/3.jpg"] }),
            ),
        );

        h.controller.select_day(d).await.unwrap();

        // The memory is published while its download is still held
        let rec = h.recorder.clone();
        eventually(move || rec.last_memories() == Some(ids(&["img"]))).await;
        let watched = held.clone();
        eventually(move || watched.entered() == 1).await;
        let cache = h.controller.cache().clone();
        assert!(!cache.has("3.jpg.jpg").await);

        gate.add_permits(1);
        let mut cached = false;
        for _ in 0..300 {
            if cache.has("3.jpg.jpg").await {
                cached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cached);
    }
}
