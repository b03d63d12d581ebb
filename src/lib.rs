//! Journaly - day-organised journaling core with live sync and a media cache
//!
//! Journaly keeps a signed-in user's calendar days and the memories filed
//! under the selected day in sync with a remote document store, and keeps the
//! images and audio those memories reference available on local disk.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  change batches  ┌──────────────────────────────────┐
//! │ RemoteStore  ├─────────────────►│          SyncController          │
//! └──────────────┘                  │  ┌────────────┐  ┌────────────┐  │
//! ┌──────────────┐  sign-in/out     │  │ days list  │  │ memories   │  │
//! │ AuthProvider ├─────────────────►│  └─────▲──────┘  └─────▲──────┘  │
//! └──────────────┘                  │        └─ ChangeReconciler ┘     │
//!                                   └───────┬─────────────────┬────────┘
//!                          full lists       │                 │ ensure(url)
//!                                   ┌───────▼────────┐ ┌──────▼───────┐
//!                                   │ListenerRegistry│ │  MediaCache  │
//!                                   └───────┬────────┘ └──────┬───────┘
//!                                           ▼                 ▼
//!                                       listeners     BlobSource + disk
//! ```
//!
//! ## Modules
//!
//! - [`model`]: typed day and memory records decoded from remote documents
//! - [`cache`]: download-once local media cache
//! - [`sync`]: change reconciliation, listener fan-out, session controller
//! - [`remote`]: remote store, blob source and auth provider interfaces
//! - [`config`]: configuration management
//! - [`error`]: error types

pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod remote;
pub mod sync;

pub use config::JournalyConfig;
pub use error::{Error, Result};
