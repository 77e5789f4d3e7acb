//! Verbatim copies of the store file, `users_<kind>_<stamp>.json`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::atomic::{parse_stamp, stamped_path, write_atomic};
use crate::config::StoreSettings;
use crate::error::{Result, StoreError};
use crate::retention::{BackupKind, Retained, RetentionPolicy};

const PREFIX: &str = "users_";
const SUFFIX: &str = ".json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSnapshot {
    pub filename: String,
    pub kind: BackupKind,
    #[serde(skip)]
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl Retained for DocumentSnapshot {
    fn kind(&self) -> BackupKind {
        self.kind
    }
}

/// The snapshot area of the backup directory.
#[derive(Debug, Clone)]
pub struct SnapshotDir {
    dir: PathBuf,
    source: PathBuf,
    retention: RetentionPolicy,
}

impl SnapshotDir {
    pub fn new(settings: &StoreSettings) -> Self {
        Self {
            dir: settings.backup_dir.clone(),
            source: settings.store_file(),
            retention: settings.retention,
        }
    }

    /// Copy the current store file. The caller holds the store lock.
    pub fn create(&self, kind: BackupKind) -> Result<DocumentSnapshot> {
        let bytes = fs::read(&self.source).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                StoreError::not_found("store file", self.source.display().to_string())
            }
            _ => StoreError::io("read store file", &self.source)(e),
        })?;
        self.create_from(kind, &bytes)
    }

    /// Record `bytes` as a snapshot of the given kind.
    pub fn create_from(&self, kind: BackupKind, bytes: &[u8]) -> Result<DocumentSnapshot> {
        fs::create_dir_all(&self.dir).map_err(StoreError::io("create backup dir", &self.dir))?;
        let (path, stamp) = stamped_path(&self.dir, &format!("{PREFIX}{kind}_"), SUFFIX);
        write_atomic(&path, bytes).map_err(|e| StoreError::backup("snapshot", &path, e))?;

        let snapshot = DocumentSnapshot {
            filename: file_name(&path),
            kind,
            size: bytes.len() as u64,
            created_at: parse_stamp(&stamp).unwrap_or_else(Utc::now),
            path,
        };
        tracing::debug!(snapshot = %snapshot.filename, %kind, "document snapshot written");

        self.prune()?;
        Ok(snapshot)
    }

    /// All snapshots, newest first. Files that do not follow the naming
    /// scheme are ignored.
    pub fn list(&self) -> Result<Vec<DocumentSnapshot>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io("list snapshots", &self.dir)(e)),
        };

        let mut snapshots: Vec<DocumentSnapshot> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let (kind, created_at) = parse_name(&name)?;
                let size = entry.metadata().ok()?.len();
                Some(DocumentSnapshot {
                    filename: name,
                    kind,
                    path: entry.path(),
                    size,
                    created_at,
                })
            })
            .collect();
        snapshots.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(snapshots)
    }

    /// Look up one snapshot by file name.
    pub fn get(&self, name: &str) -> Result<DocumentSnapshot> {
        if parse_name(name).is_none() {
            return Err(StoreError::not_found("snapshot", name));
        }
        self.list()?
            .into_iter()
            .find(|s| s.filename == name)
            .ok_or_else(|| StoreError::not_found("snapshot", name))
    }

    pub fn read(&self, snapshot: &DocumentSnapshot) -> Result<Vec<u8>> {
        fs::read(&snapshot.path).map_err(StoreError::io("read snapshot", &snapshot.path))
    }

    fn prune(&self) -> Result<usize> {
        let snapshots = self.list()?;
        let doomed = self.retention.plan(&snapshots);
        for snapshot in &doomed {
            match fs::remove_file(&snapshot.path) {
                Ok(()) => tracing::info!(snapshot = %snapshot.filename, "pruned old snapshot"),
                Err(e) => {
                    tracing::warn!(snapshot = %snapshot.filename, error = %e, "failed to prune snapshot")
                }
            }
        }
        Ok(doomed.len())
    }
}

fn parse_name(name: &str) -> Option<(BackupKind, DateTime<Utc>)> {
    let body = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    let (kind, stamp) = body.split_once('_')?;
    Some((BackupKind::parse(kind)?, parse_stamp(stamp)?))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
