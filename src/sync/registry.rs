//! Multicast listener registry
//!
//! Listeners are held weakly: registration never extends a listener's
//! lifetime, and dead entries are pruned on the next broadcast. Each
//! registration returns a [`ListenerHandle`] that unregisters on drop.
//!
//! Broadcasts are synchronous and run on the caller's task. The registry lock
//! is released before any callback runs, so a listener may add or remove
//! listeners from inside a callback.

use crate::model::{DayRecord, MemoryRecord};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// How the canonical list changed. The full list always accompanies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseChange {
    Add,
    Remove,
    Update,
}

/// Category of data a listener wants to hear about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerType {
    Memories,
    Days,
    All,
}

impl ListenerType {
    /// Whether a listener with this interest receives events of `category`
    pub fn accepts(&self, category: ListenerType) -> bool {
        matches!(self, ListenerType::All) || *self == category
    }
}

/// A data-change notification
#[derive(Debug, Clone, Copy)]
pub enum DataEvent<'a> {
    Memories {
        change: DatabaseChange,
        memories: &'a [MemoryRecord],
    },
    Days {
        change: DatabaseChange,
        days: &'a [DayRecord],
    },
}

impl DataEvent<'_> {
    pub fn category(&self) -> ListenerType {
        match self {
            Self::Memories { .. } => ListenerType::Memories,
            Self::Days { .. } => ListenerType::Days,
        }
    }

    /// Deliver to one listener if its interest matches
    pub fn dispatch(&self, listener: &dyn DatabaseListener) {
        if !listener.listener_type().accepts(self.category()) {
            return;
        }
        match *self {
            Self::Memories { change, memories } => listener.on_memories_change(change, memories),
            Self::Days { change, days } => listener.on_days_change(change, days),
        }
    }
}

/// Observer of the canonical day and memory lists.
///
/// Callbacks always receive the complete current list, never a delta. Any
/// thread affinity a listener needs is its own responsibility.
pub trait DatabaseListener: Send + Sync {
    fn listener_type(&self) -> ListenerType;

    fn on_memories_change(&self, _change: DatabaseChange, _memories: &[MemoryRecord]) {}

    fn on_days_change(&self, _change: DatabaseChange, _days: &[DayRecord]) {}
}

/// Registration identifier
pub type ListenerId = u64;

struct Registration {
    id: ListenerId,
    listener: Weak<dyn DatabaseListener>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    listeners: RwLock<Vec<Registration>>,
}

impl RegistryInner {
    fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }
}

/// Type-filtered fan-out to registered listeners
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener without taking ownership of it.
    ///
    /// Every call creates its own registration with its own handle, so a
    /// listener added twice receives each event twice until one of the
    /// handles is dropped. `remove_listener` drops all of them.
    pub fn add_listener<L: DatabaseListener + 'static>(&self, listener: &Arc<L>) -> ListenerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<dyn DatabaseListener> = Arc::<L>::downgrade(listener);
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Registration { id, listener: weak });
        tracing::debug!(listener_id = id, "Listener registered");
        ListenerHandle {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Unregister every registration of `listener`. Unknown listeners are
    /// ignored.
    pub fn remove_listener<L: DatabaseListener + 'static>(&self, listener: &Arc<L>) {
        let target = Arc::as_ptr(listener) as *const ();
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|r| r.listener.as_ptr() as *const () != target);
    }

    /// Broadcast `event` to every live listener interested in it
    pub fn invoke(&self, event: &DataEvent<'_>) {
        let targets: Vec<Arc<dyn DatabaseListener>> = {
            let mut listeners = self.inner.listeners.write().unwrap_or_else(|e| e.into_inner());
            listeners.retain(|r| r.listener.strong_count() > 0);
            listeners.iter().filter_map(|r| r.listener.upgrade()).collect()
        };
        for listener in targets {
            event.dispatch(listener.as_ref());
        }
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.listener.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a listener registered; unregisters it when dropped
#[must_use = "dropping the handle unregisters the listener"]
pub struct ListenerHandle {
    id: ListenerId,
    registry: Weak<RegistryInner>,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(self.id) {
                tracing::debug!(listener_id = self.id, "Listener unregistered");
            }
        }
    }
}
