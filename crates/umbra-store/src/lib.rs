//! # umbra-store
//!
//! Durable storage for the Umbra VPN deployment: the `users.json` document
//! holding every user and the server secrets, its snapshots and schema
//! migrations, full-deployment backup archives, and the disguised endpoint
//! set consumed by the reverse proxy.
//!
//! Every writer, in any process, serializes through one advisory lock on
//! `.users.lock` next to the document, and every file is replaced
//! atomically.  Handles are cheap: `ConfigStore`, `BackupManager` and
//! `EndpointRotator` each take a [`StoreSettings`] and a shared
//! [`ExclusiveLock`].

pub mod atomic;
pub mod backup;
pub mod config;
pub mod document;
pub mod endpoints;
pub mod lock;
pub mod migrations;
pub mod regen;
pub mod retention;
pub mod snapshots;
pub mod store;

mod error;

pub use backup::{BackupManager, BackupRecord, RestoreResult};
pub use config::StoreSettings;
pub use document::{LoadReport, RejectedRecord, StoreDocument};
pub use endpoints::{EndpointRole, EndpointRotator, EndpointSet};
pub use error::{Result, StoreError};
pub use lock::{ExclusiveLock, FileLock, LockGuard};
pub use migrations::{MigrationEngine, CURRENT_VERSION};
pub use regen::{LogOnlyRegeneration, RegenerationHook, RegenerationReason};
pub use retention::{BackupKind, RetentionPolicy};
pub use snapshots::DocumentSnapshot;
pub use store::{ConfigStore, StoreStatus};
