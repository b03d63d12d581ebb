//! Real-time snapshot reconciliation
//!
//! Remote subscriptions deliver ordered change batches. [`ChangeReconciler`]
//! folds them into canonical lists, [`SyncController`] owns those lists for
//! the signed-in session, and [`ListenerRegistry`] republishes the full lists
//! to every interested [`DatabaseListener`].

pub mod change;
pub mod controller;
pub mod reconciler;
pub mod registry;

pub use change::{Change, ChangeBatch, ChangeKind, Decoded};
pub use controller::{AuthEvent, SessionState, Subscribed, SyncController};
pub use reconciler::{ChangeReconciler, Reconciled};
pub use registry::{
    DataEvent, DatabaseChange, DatabaseListener, ListenerHandle, ListenerId, ListenerRegistry,
    ListenerType,
};
