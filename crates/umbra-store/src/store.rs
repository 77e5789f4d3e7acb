//! The configuration store: sole reader and writer of `users.json`.
//!
//! Reads take no lock; they only ever observe a fully written document
//! because every write goes through [`write_atomic`].  Every mutation runs
//! load, change, snapshot and write inside one critical section of the
//! store lock, so concurrent writers from any process serialize.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use umbra_shared::{keys, timestamp_now, CredentialFactory, ServerSecret, User, ValidationError};

use crate::atomic::{remove_stale_temps, stamped_path, write_atomic};

/// Copies of unreadable store files kept in the backup directory.
const MAX_CORRUPT_COPIES: usize = 5;
const CORRUPT_PREFIX: &str = "corrupt_users_";
use crate::config::StoreSettings;
use crate::document::{LoadReport, StoreDocument};
use crate::error::{Result, StoreError};
use crate::lock::{ExclusiveLock, FileLock, LockGuard};
use crate::migrations::{MigrationEngine, CURRENT_VERSION};
use crate::regen::{LogOnlyRegeneration, RegenerationHook, RegenerationReason};
use crate::retention::BackupKind;
use crate::snapshots::{DocumentSnapshot, SnapshotDir};

/// Summary counters for dashboards and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStatus {
    pub schema_version: u32,
    pub total_users: usize,
    pub active_users: usize,
    pub server_initialized: bool,
    pub last_modified: Option<String>,
    pub rejected_records: usize,
}

enum Mutation<T> {
    Changed(T),
    Unchanged(T),
}

pub struct ConfigStore {
    settings: StoreSettings,
    lock: Arc<dyn ExclusiveLock>,
    hook: Arc<dyn RegenerationHook>,
    snapshots: SnapshotDir,
    migrations: MigrationEngine,
    factory: CredentialFactory,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("store_file", &self.settings.store_file())
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl ConfigStore {
    /// Open the store with the file lock next to `users.json` and the
    /// logging regeneration hook.
    pub fn open(settings: StoreSettings) -> Result<Self> {
        let lock = Arc::new(FileLock::new(settings.lock_file()));
        Self::open_with(settings, lock, Arc::new(LogOnlyRegeneration))
    }

    /// Open the store, creating the directory layout and an empty document
    /// on first run, then load once so pending migrations run now.
    ///
    /// The lock is taken only to create the document or to repair or
    /// migrate it, so opening for reads works while a writer holds it.
    pub fn open_with(
        settings: StoreSettings,
        lock: Arc<dyn ExclusiveLock>,
        hook: Arc<dyn RegenerationHook>,
    ) -> Result<Self> {
        for dir in [&settings.config_dir, &settings.backup_dir] {
            fs::create_dir_all(dir).map_err(StoreError::io("create directory", dir))?;
        }

        let store = Self {
            snapshots: SnapshotDir::new(&settings),
            migrations: MigrationEngine::new(&settings),
            factory: CredentialFactory::new(),
            settings,
            lock,
            hook,
        };

        let path = store.settings.store_file();
        if !path.exists() {
            let _guard = store.acquire()?;
            if !path.exists() {
                let mut doc = StoreDocument::empty();
                doc.last_modified = Some(timestamp_now());
                store.write_document(&doc)?;
                tracing::info!(path = %path.display(), "created empty store document");
            }
        }

        store.load()?;
        Ok(store)
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// The lock shared with [`crate::BackupManager`] and
    /// [`crate::EndpointRotator`] instances in this process.
    pub fn lock_handle(&self) -> Arc<dyn ExclusiveLock> {
        Arc::clone(&self.lock)
    }

    pub fn hook(&self) -> Arc<dyn RegenerationHook> {
        Arc::clone(&self.hook)
    }

    fn acquire(&self) -> Result<LockGuard> {
        self.lock.acquire(self.settings.lock_timeout)
    }

    // -----------------------------------------------------------------------
    // Load / save
    // -----------------------------------------------------------------------

    /// Load the document, logging any record that had to be left out.
    pub fn load(&self) -> Result<StoreDocument> {
        let (doc, report) = self.load_with_report()?;
        log_rejections(&report);
        Ok(doc)
    }

    /// Load the document and report rejected records to the caller.
    ///
    /// Takes the lock only when the file needs repair or migration.
    pub fn load_with_report(&self) -> Result<(StoreDocument, LoadReport)> {
        let value = match self.read_value()? {
            Ok(value) if !MigrationEngine::needs_migration(&value) => value,
            _ => {
                let _guard = self.acquire()?;
                self.load_value_locked()?
            }
        };
        self.parse(value)
    }

    /// Persist `doc` as the new document.
    pub fn save(&self, doc: &StoreDocument) -> Result<()> {
        let _guard = self.acquire()?;
        let mut doc = doc.clone();
        self.save_locked(&mut doc)
    }

    /// Run pending migrations explicitly.
    pub fn migrate(&self) -> Result<StoreDocument> {
        let _guard = self.acquire()?;
        self.load_locked()
    }

    /// Raw content of the store file, or why it is unusable.
    fn read_value(&self) -> Result<std::result::Result<Value, String>> {
        let path = self.settings.store_file();
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).map_err(|e| e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Err("file is missing".to_string())),
            Err(e) => Err(StoreError::io("read store file", path)(e)),
        }
    }

    fn parse(&self, value: Value) -> Result<(StoreDocument, LoadReport)> {
        StoreDocument::from_value(value).map_err(|e| StoreError::StoreCorrupt {
            path: self.settings.store_file(),
            reason: e.to_string(),
        })
    }

    fn load_value_locked(&self) -> Result<Value> {
        match self.read_value()? {
            Ok(value) => self.migrations.migrate_if_needed(value),
            Err(reason) => self.recover_locked(&reason),
        }
    }

    fn load_locked(&self) -> Result<StoreDocument> {
        let value = self.load_value_locked()?;
        let (doc, report) = self.parse(value)?;
        log_rejections(&report);
        Ok(doc)
    }

    /// Replace an unreadable store file with the newest snapshot that parses
    /// and migrates. The unreadable file is kept aside for inspection.
    fn recover_locked(&self, reason: &str) -> Result<Value> {
        let path = self.settings.store_file();
        tracing::error!(path = %path.display(), %reason, "store document unreadable, recovering from snapshots");

        if path.exists() {
            let (aside, _) = stamped_path(&self.settings.backup_dir, CORRUPT_PREFIX, ".json");
            match fs::copy(&path, &aside) {
                Ok(_) => tracing::warn!(path = %aside.display(), "kept copy of corrupt store document"),
                Err(e) => tracing::warn!(error = %e, "could not keep copy of corrupt store document"),
            }
            prune_corrupt_copies(&self.settings.backup_dir);
        }

        for snapshot in self.snapshots.list()? {
            let bytes = match self.snapshots.read(&snapshot) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(snapshot = %snapshot.filename, error = %e, "snapshot unreadable");
                    continue;
                }
            };
            let value: Value = match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(snapshot = %snapshot.filename, error = %e, "snapshot does not parse");
                    continue;
                }
            };
            write_atomic(&path, &bytes).map_err(StoreError::persist(&path))?;
            match self.migrations.migrate_if_needed(value) {
                Ok(value) => {
                    tracing::warn!(snapshot = %snapshot.filename, "store document recovered from snapshot");
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(snapshot = %snapshot.filename, error = %e, "snapshot does not migrate");
                }
            }
        }

        Err(StoreError::StoreCorrupt {
            path,
            reason: format!("{reason}; no usable snapshot"),
        })
    }

    fn save_locked(&self, doc: &mut StoreDocument) -> Result<()> {
        doc.validate()?;
        if self.settings.store_file().exists() {
            self.snapshots.create(BackupKind::Auto)?;
        }
        doc.schema_version = CURRENT_VERSION;
        doc.last_modified = Some(timestamp_now());
        self.write_document(doc)?;
        tracing::debug!(users = doc.users.len(), "store document saved");
        Ok(())
    }

    /// Caller holds the lock.
    fn write_document(&self, doc: &StoreDocument) -> Result<()> {
        let path = self.settings.store_file();
        let stale = remove_stale_temps(&path);
        if stale > 0 {
            tracing::warn!(count = stale, "removed temp files left by an interrupted write");
        }
        let bytes = doc
            .to_json()
            .map_err(|e| StoreError::persist(&path)(e.into()))?;
        write_atomic(&path, &bytes).map_err(StoreError::persist(&path))
    }

    /// Load, apply `f` and persist if it changed anything, all under one
    /// hold of the lock.
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreDocument) -> Result<Mutation<T>>) -> Result<T> {
        let _guard = self.acquire()?;
        let mut doc = self.load_locked()?;
        match f(&mut doc)? {
            Mutation::Changed(out) => {
                self.save_locked(&mut doc)?;
                Ok(out)
            }
            Mutation::Unchanged(out) => Ok(out),
        }
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    /// Create a user with fresh credentials for every protocol.
    pub fn add_user(&self, username: &str) -> Result<User> {
        let user = self.mutate(|doc| {
            let user = self.factory.new_user(username, &doc.identifier_index())?;
            doc.users.insert(user.username.clone(), user.clone());
            Ok(Mutation::Changed(user))
        })?;
        tracing::info!(username, "user added");
        self.hook
            .regenerate(&RegenerationReason::UserAdded(username.to_string()));
        Ok(user)
    }

    /// Delete a user, or a record of that name rejected on load. Returns
    /// whether either existed.
    pub fn remove_user(&self, username: &str) -> Result<bool> {
        let removed = self.mutate(|doc| {
            let valid = doc.users.remove(username).is_some();
            let quarantined = doc.quarantine.users.remove(username).is_some();
            Ok(if valid || quarantined {
                Mutation::Changed(true)
            } else {
                Mutation::Unchanged(false)
            })
        })?;
        if removed {
            tracing::info!(username, "user removed");
            self.hook
                .regenerate(&RegenerationReason::UserRemoved(username.to_string()));
        }
        Ok(removed)
    }

    pub fn get_user(&self, username: &str) -> Result<Option<User>> {
        Ok(self.load()?.users.remove(username))
    }

    /// All users ordered by username.
    pub fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.load()?.users.into_values().collect())
    }

    /// Enable or disable a user. Setting the current value is a no-op.
    pub fn set_user_active(&self, username: &str, active: bool) -> Result<User> {
        let (user, changed) = self.mutate(|doc| {
            let user = doc
                .users
                .get_mut(username)
                .ok_or_else(|| StoreError::not_found("user", username))?;
            if user.is_active == active {
                return Ok(Mutation::Unchanged((user.clone(), false)));
            }
            user.is_active = active;
            Ok(Mutation::Changed((user.clone(), true)))
        })?;
        if changed {
            tracing::info!(username, active, "user activation changed");
            self.hook
                .regenerate(&RegenerationReason::UserUpdated(username.to_string()));
        }
        Ok(user)
    }

    /// Record a connection by `username` now.
    pub fn touch_last_seen(&self, username: &str) -> Result<()> {
        self.mutate(|doc| {
            let user = doc
                .users
                .get_mut(username)
                .ok_or_else(|| StoreError::not_found("user", username))?;
            user.last_seen = Some(timestamp_now());
            Ok(Mutation::Changed(()))
        })
    }

    // -----------------------------------------------------------------------
    // Server section
    // -----------------------------------------------------------------------

    /// Mint the deployment secrets. Fails if they already exist, even as a
    /// section rejected on load.
    pub fn initialize_server(&self, admin_password: &str) -> Result<()> {
        self.mutate(|doc| {
            if doc.has_server() {
                return Err(ValidationError::ServerAlreadyInitialized.into());
            }
            doc.server = Some(self.factory.server_config(admin_password)?);
            Ok(Mutation::Changed(()))
        })?;
        tracing::info!("server configuration initialized");
        Ok(())
    }

    pub fn rotate_server_secret(&self, which: ServerSecret) -> Result<()> {
        self.mutate(|doc| {
            let server = doc
                .server
                .as_mut()
                .ok_or_else(|| StoreError::not_found("server configuration", "server"))?;
            self.factory.rotate(server, which);
            Ok(Mutation::Changed(()))
        })?;
        tracing::info!(secret = ?which, "server secret rotated");
        self.hook.regenerate(&RegenerationReason::ServerRotated);
        Ok(())
    }

    pub fn set_admin_password(&self, admin_password: &str) -> Result<()> {
        self.mutate(|doc| {
            let server = doc
                .server
                .as_mut()
                .ok_or_else(|| StoreError::not_found("server configuration", "server"))?;
            self.factory.set_admin_password(server, admin_password)?;
            Ok(Mutation::Changed(()))
        })
    }

    pub fn verify_admin_password(&self, password: &str) -> Result<bool> {
        let doc = self.load()?;
        let server = doc
            .server
            .ok_or_else(|| StoreError::not_found("server configuration", "server"))?;
        Ok(keys::verify_password(password, &server.admin_password_hash)?)
    }

    /// Mirror the active endpoint set into the server section.
    pub fn set_obfuscated_endpoints(&self, endpoints: BTreeMap<String, String>) -> Result<()> {
        self.mutate(|doc| {
            let server = doc
                .server
                .as_mut()
                .ok_or_else(|| StoreError::not_found("server configuration", "server"))?;
            if server.obfuscated_endpoints == endpoints {
                return Ok(Mutation::Unchanged(()));
            }
            server.obfuscated_endpoints = endpoints;
            Ok(Mutation::Changed(()))
        })
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub fn create_snapshot(&self, kind: BackupKind) -> Result<DocumentSnapshot> {
        let _guard = self.acquire()?;
        self.snapshots.create(kind)
    }

    /// Snapshots newest first.
    pub fn list_snapshots(&self) -> Result<Vec<DocumentSnapshot>> {
        self.snapshots.list()
    }

    /// Put a snapshot back as the live document. The current document is
    /// first kept as a pre-restore snapshot.
    pub fn restore_snapshot(&self, name: &str) -> Result<StoreDocument> {
        let doc = {
            let _guard = self.acquire()?;
            let candidate = self.snapshots.get(name)?;
            let bytes = self.snapshots.read(&candidate)?;

            let safety = if self.settings.store_file().exists() {
                self.snapshots.create(BackupKind::PreRestore)?.filename
            } else {
                String::new()
            };
            let fail = |reason: String| StoreError::Restore {
                backup: name.to_string(),
                safety_backup: safety.clone(),
                reason,
            };

            let value: Value = serde_json::from_slice(&bytes).map_err(|e| fail(e.to_string()))?;
            let path = self.settings.store_file();
            write_atomic(&path, &bytes).map_err(|e| fail(e.to_string()))?;
            let value = self.migrations.migrate_if_needed(value)?;
            let (doc, report) = self.parse(value)?;
            log_rejections(&report);
            tracing::info!(snapshot = name, safety = %safety, "store document restored from snapshot");
            doc
        };
        self.hook
            .regenerate(&RegenerationReason::Restored(name.to_string()));
        Ok(doc)
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let (doc, report) = self.load_with_report()?;
        Ok(StoreStatus {
            schema_version: doc.schema_version,
            total_users: doc.users.len(),
            active_users: doc.users.values().filter(|u| u.is_active).count(),
            server_initialized: doc.server.is_some(),
            last_modified: doc.last_modified,
            rejected_records: report.rejected.len(),
        })
    }

    pub fn path(&self) -> std::path::PathBuf {
        self.settings.store_file()
    }
}

fn log_rejections(report: &LoadReport) {
    for rejected in &report.rejected {
        tracing::warn!(record = %rejected.record, reason = %rejected.reason, "record rejected on load");
    }
}

/// Keep the newest `MAX_CORRUPT_COPIES` corrupt copies; stamps sort by age.
fn prune_corrupt_copies(backup_dir: &Path) {
    let mut copies: Vec<_> = match fs::read_dir(backup_dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(CORRUPT_PREFIX) && n.ends_with(".json"))
            })
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "could not list corrupt store copies");
            return;
        }
    };
    copies.sort_unstable_by(|a, b| b.cmp(a));
    for old in copies.into_iter().skip(MAX_CORRUPT_COPIES) {
        match fs::remove_file(&old) {
            Ok(()) => tracing::debug!(path = %old.display(), "pruned old corrupt store copy"),
            Err(e) => tracing::warn!(path = %old.display(), error = %e, "could not prune corrupt store copy"),
        }
    }
}

/// Whether `path` holds a document this build can read.
pub fn is_store_document(path: &Path) -> bool {
    fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
        .is_some_and(|v| v.get("users").map_or(true, Value::is_object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHook(Mutex<Vec<RegenerationReason>>);

    impl RegenerationHook for RecordingHook {
        fn regenerate(&self, reason: &RegenerationReason) {
            self.0.lock().unwrap().push(reason.clone());
        }
    }

    fn open(dir: &Path) -> (ConfigStore, Arc<RecordingHook>) {
        let settings = StoreSettings::for_data_dir(dir);
        let hook = Arc::new(RecordingHook::default());
        let lock = Arc::new(FileLock::new(settings.lock_file()));
        let store = ConfigStore::open_with(settings, lock, hook.clone()).unwrap();
        (store, hook)
    }

    #[test]
    fn open_creates_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(dir.path());
        let doc = store.load().unwrap();
        assert_eq!(doc.schema_version, CURRENT_VERSION);
        assert!(doc.users.is_empty());
        assert!(doc.server.is_none());
        assert!(is_store_document(&store.path()));
    }

    #[test]
    fn add_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let (store, hook) = open(dir.path());

        let alice = store.add_user("alice").unwrap();
        assert_eq!(store.get_user("alice").unwrap(), Some(alice));
        assert!(matches!(
            store.add_user("alice"),
            Err(StoreError::Validation(ValidationError::UsernameTaken(_)))
        ));

        assert!(store.remove_user("alice").unwrap());
        assert!(!store.remove_user("alice").unwrap());
        assert_eq!(store.get_user("alice").unwrap(), None);

        let events = hook.0.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                RegenerationReason::UserAdded("alice".into()),
                RegenerationReason::UserRemoved("alice".into()),
            ]
        );
    }

    #[test]
    fn every_save_leaves_an_auto_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(dir.path());
        store.add_user("alice").unwrap();
        store.add_user("bob").unwrap();

        let snapshots = store.list_snapshots().unwrap();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.iter().all(|s| s.kind == BackupKind::Auto));
    }

    #[test]
    fn toggle_and_touch() {
        let dir = tempfile::tempdir().unwrap();
        let (store, hook) = open(dir.path());
        store.add_user("alice").unwrap();

        let user = store.set_user_active("alice", false).unwrap();
        assert!(!user.is_active);
        store.touch_last_seen("alice").unwrap();
        assert!(store.get_user("alice").unwrap().unwrap().last_seen.is_some());

        let status = store.status().unwrap();
        assert_eq!((status.total_users, status.active_users), (1, 0));

        let events = hook.0.lock().unwrap().len();
        let snapshots = store.list_snapshots().unwrap().len();
        assert!(!store.set_user_active("alice", false).unwrap().is_active);
        assert_eq!(hook.0.lock().unwrap().len(), events);
        assert_eq!(store.list_snapshots().unwrap().len(), snapshots);
        assert!(matches!(
            store.set_user_active("nobody", true),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn server_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (store, hook) = open(dir.path());

        store.initialize_server("correct horse battery").unwrap();
        assert!(matches!(
            store.initialize_server("correct horse battery"),
            Err(StoreError::Validation(ValidationError::ServerAlreadyInitialized))
        ));
        assert!(store.verify_admin_password("correct horse battery").unwrap());
        assert!(!store.verify_admin_password("wrong password").unwrap());

        let before = store.load().unwrap().server.unwrap();
        store.rotate_server_secret(ServerSecret::Xray).unwrap();
        let after = store.load().unwrap().server.unwrap();
        assert_ne!(before.xray_private_key, after.xray_private_key);
        assert_eq!(before.session_secret, after.session_secret);
        assert_eq!(
            hook.0.lock().unwrap().last(),
            Some(&RegenerationReason::ServerRotated)
        );
    }

    #[test]
    fn corrupt_document_recovers_from_newest_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(dir.path());
        store.add_user("alice").unwrap();
        store.add_user("bob").unwrap();
        fs::write(store.path(), b"{\"users\": {").unwrap();

        // Newest snapshot was taken just before bob was added.
        let doc = store.load().unwrap();
        assert!(doc.users.contains_key("alice"));
        assert!(!doc.users.contains_key("bob"));

        let aside = fs::read_dir(&store.settings().backup_dir)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("corrupt_users_"))
            .count();
        assert_eq!(aside, 1);
    }

    #[test]
    fn corrupt_copies_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(dir.path());
        store.add_user("alice").unwrap();
        store.add_user("bob").unwrap();
        let backup_dir = store.settings().backup_dir.clone();
        for i in 0..6 {
            fs::write(
                backup_dir.join(format!("corrupt_users_20200101_000000_00000{i}.json")),
                b"{",
            )
            .unwrap();
        }

        fs::write(store.path(), b"{\"users\": {").unwrap();
        store.load().unwrap();

        let mut aside: Vec<String> = fs::read_dir(&backup_dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("corrupt_users_"))
            .collect();
        aside.sort();
        assert_eq!(aside.len(), MAX_CORRUPT_COPIES);
        assert!(!aside.last().unwrap().starts_with("corrupt_users_2020"));
        assert!(!aside.contains(&"corrupt_users_20200101_000000_000000.json".to_string()));
    }

    #[test]
    fn rejected_records_survive_unrelated_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(dir.path());
        store.add_user("bob").unwrap();

        let mut raw: Value = serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        raw["users"]["bob"]["trojan_password"] = Value::from("a".repeat(15));
        raw["server"] = serde_json::json!({
            "wireguard_server_private_key": "a".repeat(44),
            "wireguard_server_public_key": "a".repeat(44),
            "xray_private_key": "a".repeat(44),
            "admin_password_hash": "$2b$12$abcdefghijklmnopqrstuuABCDEFGHIJKLMNOPQRSTUVWXYZ01234",
            "session_secret": "a".repeat(64),
        });
        fs::write(store.path(), serde_json::to_vec_pretty(&raw).unwrap()).unwrap();

        let (doc, report) = store.load_with_report().unwrap();
        assert!(!doc.users.contains_key("bob"));
        assert_eq!(report.rejected.len(), 2);

        store.add_user("alice").unwrap();
        let written: Value = serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(written["users"]["bob"], raw["users"]["bob"]);
        assert_eq!(written["server"], raw["server"]);
        assert!(written["users"]["alice"].is_object());

        assert!(matches!(
            store.add_user("bob"),
            Err(StoreError::Validation(ValidationError::UsernameTaken(_)))
        ));
        assert!(matches!(
            store.initialize_server("correct horse battery"),
            Err(StoreError::Validation(ValidationError::ServerAlreadyInitialized))
        ));

        // Removing the broken record is how an operator clears it.
        assert!(store.remove_user("bob").unwrap());
        let written: Value = serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert!(written["users"].get("bob").is_none());
        assert_eq!(written["server"], raw["server"]);
    }

    #[test]
    fn reads_do_not_wait_for_a_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = StoreSettings::for_data_dir(dir.path());
        settings.lock_timeout = std::time::Duration::from_millis(100);
        let (store, _) = open(dir.path());
        store.add_user("alice").unwrap();

        let held = FileLock::new(settings.lock_file());
        let _guard = held.acquire(std::time::Duration::from_secs(1)).unwrap();

        let reader = ConfigStore::open(settings).unwrap();
        assert_eq!(reader.list_users().unwrap().len(), 1);
        assert_eq!(reader.status().unwrap().total_users, 1);
        assert!(matches!(
            reader.add_user("bob"),
            Err(StoreError::LockTimeout { .. })
        ));
    }

    #[test]
    fn corrupt_document_without_snapshots_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(dir.path());
        fs::write(store.path(), b"not json").unwrap();
        assert!(matches!(store.load(), Err(StoreError::StoreCorrupt { .. })));
    }

    #[test]
    fn invalid_save_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open(dir.path());
        store.add_user("alice").unwrap();
        let before = fs::read(store.path()).unwrap();

        let mut doc = store.load().unwrap();
        doc.users.get_mut("alice").unwrap().trojan_password = "short".into();
        assert!(matches!(store.save(&doc), Err(StoreError::Validation(_))));
        assert_eq!(fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn snapshot_restore_keeps_safety_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (store, hook) = open(dir.path());
        store.add_user("alice").unwrap();
        let manual = store.create_snapshot(BackupKind::Manual).unwrap();
        store.add_user("bob").unwrap();

        let doc = store.restore_snapshot(&manual.filename).unwrap();
        assert_eq!(doc.users.keys().collect::<Vec<_>>(), vec!["alice"]);
        assert!(store
            .list_snapshots()
            .unwrap()
            .iter()
            .any(|s| s.kind == BackupKind::PreRestore));
        assert_eq!(
            hook.0.lock().unwrap().last(),
            Some(&RegenerationReason::Restored(manual.filename.clone()))
        );
    }
}
