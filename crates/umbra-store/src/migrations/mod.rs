//! Document schema migrations.
//!
//! Migrations run on the raw JSON value before it is deserialized, so a
//! document written by an older build is upgraded in place the first time a
//! newer build loads it.  Each transform is forward-only and additive.

pub mod v001_singbox_credentials;

use std::path::PathBuf;

use serde_json::Value;
use umbra_shared::CredentialFactory;

use crate::atomic::write_atomic;
use crate::config::StoreSettings;
use crate::error::{Result, StoreError};
use crate::retention::BackupKind;
use crate::snapshots::SnapshotDir;

/// Current schema version.  Bump this and add a transform to `TRANSFORMS`
/// whenever the document shape changes.
pub const CURRENT_VERSION: u32 = 1;

type Transform = fn(&mut Value, &CredentialFactory) -> std::result::Result<(), String>;

/// `(target version, transform)` in ascending order.
const TRANSFORMS: &[(u32, Transform)] = &[(1, v001_singbox_credentials::up)];

/// Version tag of a raw document; a missing tag means schema 0 and a tag
/// beyond `u32` saturates so it is refused as a newer schema.
pub fn schema_version(document: &Value) -> u32 {
    document
        .get("schema_version")
        .and_then(Value::as_u64)
        .map_or(0, |v| u32::try_from(v).unwrap_or(u32::MAX))
}

#[derive(Debug, Clone)]
pub struct MigrationEngine {
    snapshots: SnapshotDir,
    store_file: PathBuf,
    factory: CredentialFactory,
}

impl MigrationEngine {
    pub fn new(settings: &StoreSettings) -> Self {
        Self {
            snapshots: SnapshotDir::new(settings),
            store_file: settings.store_file(),
            factory: CredentialFactory::new(),
        }
    }

    pub fn needs_migration(document: &Value) -> bool {
        schema_version(document) != CURRENT_VERSION
    }

    /// Upgrade `document` (the current content of the store file) and
    /// persist the result.  The caller holds the store lock.
    ///
    /// On any failure the pre-migration snapshot is copied back over the
    /// store file verbatim.
    pub fn migrate_if_needed(&self, document: Value) -> Result<Value> {
        let from = schema_version(&document);
        if from == CURRENT_VERSION {
            return Ok(document);
        }
        if from > CURRENT_VERSION {
            return Err(StoreError::Migration {
                from,
                to: CURRENT_VERSION,
                reason: "document was written by a newer version".to_string(),
            });
        }

        tracing::info!(
            current_version = from,
            target_version = CURRENT_VERSION,
            "migrating store document"
        );

        let snapshot = self.snapshots.create(BackupKind::PreMigration)?;
        let original = self.snapshots.read(&snapshot)?;
        tracing::info!(snapshot = %snapshot.filename, "pre-migration snapshot written");

        match self.apply(from, document) {
            Ok(migrated) => {
                tracing::info!(version = CURRENT_VERSION, "store document migrated");
                Ok(migrated)
            }
            Err(reason) => {
                tracing::error!(%reason, snapshot = %snapshot.filename, "migration failed, rolling back");
                if let Err(e) = write_atomic(&self.store_file, &original) {
                    tracing::error!(error = %e, "rollback of store file failed");
                }
                Err(StoreError::Migration {
                    from,
                    to: CURRENT_VERSION,
                    reason,
                })
            }
        }
    }

    fn apply(&self, from: u32, mut document: Value) -> std::result::Result<Value, String> {
        for (version, transform) in TRANSFORMS.iter().filter(|(v, _)| *v > from) {
            tracing::info!(version, "applying schema transform");
            transform(&mut document, &self.factory)?;
        }
        let mut bytes = serde_json::to_vec_pretty(&document).map_err(|e| e.to_string())?;
        bytes.push(b'\n');
        write_atomic(&self.store_file, &bytes).map_err(|e| e.to_string())?;
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn setup(document: &Value) -> (tempfile::TempDir, StoreSettings, MigrationEngine) {
        let dir = tempfile::tempdir().unwrap();
        let settings = StoreSettings::for_data_dir(dir.path());
        fs::create_dir_all(&settings.config_dir).unwrap();
        fs::write(settings.store_file(), serde_json::to_vec(document).unwrap()).unwrap();
        let engine = MigrationEngine::new(&settings);
        (dir, settings, engine)
    }

    #[test]
    fn idempotent() {
        let doc = json!({ "users": { "alice": { "username": "alice" } } });
        let (_dir, settings, engine) = setup(&doc);

        let once = engine.migrate_if_needed(doc).unwrap();
        let on_disk = fs::read(settings.store_file()).unwrap();
        let twice = engine.migrate_if_needed(once.clone()).unwrap();

        assert_eq!(once, twice);
        assert_eq!(fs::read(settings.store_file()).unwrap(), on_disk);
        assert_eq!(schema_version(&twice), CURRENT_VERSION);
    }

    #[test]
    fn failure_restores_original_bytes() {
        let doc = json!({ "schema_version": 0, "users": { "bob": 5 } });
        let (_dir, settings, engine) = setup(&doc);
        let before = fs::read(settings.store_file()).unwrap();

        let err = engine.migrate_if_needed(doc).unwrap_err();
        assert!(matches!(err, StoreError::Migration { from: 0, to: 1, .. }));
        assert_eq!(fs::read(settings.store_file()).unwrap(), before);

        let snapshots = SnapshotDir::new(&settings).list().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].kind, BackupKind::PreMigration);
    }

    #[test]
    fn newer_schema_is_refused() {
        let doc = json!({ "schema_version": CURRENT_VERSION + 1, "users": {} });
        let (_dir, _settings, engine) = setup(&doc);
        assert!(matches!(
            engine.migrate_if_needed(doc),
            Err(StoreError::Migration { .. })
        ));
    }

    #[test]
    fn version_beyond_u32_is_refused_not_wrapped() {
        // 2^32 + 1 would wrap to 1 and pass as current.
        let doc = json!({ "schema_version": 4_294_967_297u64, "users": {} });
        assert_eq!(schema_version(&doc), u32::MAX);
        let (_dir, settings, engine) = setup(&doc);
        let before = fs::read(settings.store_file()).unwrap();
        assert!(matches!(
            engine.migrate_if_needed(doc),
            Err(StoreError::Migration { from: u32::MAX, .. })
        ));
        assert_eq!(fs::read(settings.store_file()).unwrap(), before);
    }
}
