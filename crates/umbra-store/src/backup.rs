//! Full-deployment backups: gzip tar archives of the configuration tree plus
//! the optional certificate, proxy and orchestration files, each with a
//! JSON sidecar describing it.
//!
//! Archive layout (format "2.0"):
//!
//! ```text
//! configs/users.json
//! configs/{xray,trojan,singbox}.json
//! configs/clients/...
//! configs/wireguard/...
//! certificates/...
//! proxy/<file>
//! orchestration/<file>
//! endpoints/endpoints.json
//! ```
//!
//! Legacy "1.0" archives hold the `configs/` content at the archive root.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder, EntryType};
use umbra_shared::{timestamp_now, ValidationError};

use crate::atomic::{parse_stamp, stamped_path, write_atomic};
use crate::config::{StoreSettings, STORE_FILE_NAME};
use crate::error::{Result, StoreError};
use crate::lock::ExclusiveLock;
use crate::regen::{RegenerationHook, RegenerationReason};
use crate::retention::{BackupKind, Retained};
use crate::store::{is_store_document, ConfigStore};

const ARCHIVE_PREFIX: &str = "backup_";
const ARCHIVE_SUFFIX: &str = ".tar.gz";
const SIDECAR_SUFFIX: &str = ".json";

pub const LEGACY_FORMAT: &str = "1.0";
pub const ENHANCED_FORMAT: &str = "2.0";

/// Server configs kept next to `users.json`.
const SERVER_CONFIGS: [&str; 3] = ["xray.json", "trojan.json", "singbox.json"];
/// Generated config directories under the config tree.
const CONFIG_DIRS: [&str; 2] = ["clients", "wireguard"];

/// Sidecar metadata for one archive. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub filename: String,
    #[serde(default = "legacy_format")]
    pub version: String,
    /// Stamp taken from the file name.
    pub timestamp: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub included_items: Vec<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: BackupKind,
}

fn legacy_format() -> String {
    LEGACY_FORMAT.to_string()
}

impl Retained for BackupRecord {
    fn kind(&self) -> BackupKind {
        self.kind
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreResult {
    pub backup: String,
    /// The pre-restore archive taken just before live files were touched.
    pub safety_backup: String,
    pub restored_items: Vec<String>,
    /// Things the operator has to do by hand.
    pub manual_steps: Vec<String>,
    /// Layout detected in the archive.
    pub format: String,
}

pub struct BackupManager {
    settings: StoreSettings,
    lock: Arc<dyn ExclusiveLock>,
    hook: Arc<dyn RegenerationHook>,
}

impl std::fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupManager")
            .field("backup_dir", &self.settings.backup_dir)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl BackupManager {
    pub fn new(
        settings: StoreSettings,
        lock: Arc<dyn ExclusiveLock>,
        hook: Arc<dyn RegenerationHook>,
    ) -> Self {
        Self {
            settings,
            lock,
            hook,
        }
    }

    /// Share the lock and hook of an open store.
    pub fn for_store(store: &ConfigStore) -> Self {
        Self::new(store.settings().clone(), store.lock_handle(), store.hook())
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    pub fn create_backup(&self, description: &str) -> Result<BackupRecord> {
        self.create(BackupKind::Manual, description)
    }

    pub fn create_auto_backup(&self, description: &str) -> Result<BackupRecord> {
        self.create(BackupKind::Auto, description)
    }

    fn create(&self, kind: BackupKind, description: &str) -> Result<BackupRecord> {
        let _guard = self.lock.acquire(self.settings.lock_timeout)?;
        let record = self.create_locked(kind, description)?;
        self.prune_locked();
        Ok(record)
    }

    fn create_locked(&self, kind: BackupKind, description: &str) -> Result<BackupRecord> {
        let dir = &self.settings.backup_dir;
        fs::create_dir_all(dir).map_err(StoreError::io("create backup dir", dir))?;

        let (archive, stamp) = stamped_path(dir, ARCHIVE_PREFIX, ARCHIVE_SUFFIX);
        let filename = file_name(&archive);
        let tmp = dir.join(format!(".{filename}.tmp"));

        let included_items = match self.write_archive(&tmp, kind) {
            Ok(items) => items,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&tmp, &archive) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::backup("create", &archive, e));
        }

        let size = fs::metadata(&archive).map(|m| m.len()).unwrap_or(0);
        let record = BackupRecord {
            filename,
            version: if self.settings.has_enhanced_sources() {
                ENHANCED_FORMAT.to_string()
            } else {
                LEGACY_FORMAT.to_string()
            },
            timestamp: stamp,
            description: description.to_string(),
            size,
            included_items,
            created_at: Some(timestamp_now()),
            kind,
        };
        if let Err(e) = self.write_sidecar(&record) {
            let _ = fs::remove_file(&archive);
            return Err(e);
        }

        tracing::info!(
            backup = %record.filename,
            %kind,
            size = record.size,
            items = record.included_items.len(),
            "backup created"
        );
        Ok(record)
    }

    fn write_archive(&self, tmp: &Path, kind: BackupKind) -> Result<Vec<String>> {
        let fail = |e: io::Error| StoreError::backup("create", tmp, e);
        let file = File::create(tmp).map_err(fail)?;
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        let mut items = Vec::new();

        let config_dir = &self.settings.config_dir;
        let users = config_dir.join(STORE_FILE_NAME);
        if users.is_file() {
            let name = format!("configs/{STORE_FILE_NAME}");
            builder.append_path_with_name(&users, &name).map_err(fail)?;
            items.push(name);
        } else if kind != BackupKind::PreRestore {
            return Err(StoreError::backup("create", &users, "store document is missing"));
        }

        for config in SERVER_CONFIGS {
            let path = config_dir.join(config);
            if path.is_file() {
                let name = format!("configs/{config}");
                builder.append_path_with_name(&path, &name).map_err(fail)?;
                items.push(name);
            }
        }
        for sub in CONFIG_DIRS {
            let path = config_dir.join(sub);
            if path.is_dir() {
                let name = format!("configs/{sub}");
                builder.append_dir_all(&name, &path).map_err(fail)?;
                items.push(name);
            }
        }

        if let Some(certs) = &self.settings.certificates_dir {
            if certs.is_dir() {
                builder.append_dir_all("certificates", certs).map_err(fail)?;
                items.push("certificates".to_string());
            } else {
                tracing::warn!(path = %certs.display(), "certificates directory missing, not included in backup");
            }
        }
        for (label, source) in [
            ("proxy", &self.settings.proxy_config),
            ("orchestration", &self.settings.orchestration_manifest),
        ] {
            let Some(path) = source else { continue };
            if path.is_file() {
                let name = format!("{label}/{}", file_name(path));
                builder.append_path_with_name(path, &name).map_err(fail)?;
                items.push(name);
            } else {
                tracing::warn!(path = %path.display(), item = label, "file missing, not included in backup");
            }
        }
        let endpoints = &self.settings.endpoints_file;
        if endpoints.is_file() {
            let name = "endpoints/endpoints.json".to_string();
            builder.append_path_with_name(endpoints, &name).map_err(fail)?;
            items.push(name);
        }

        let encoder = builder.into_inner().map_err(fail)?;
        let file = encoder.finish().map_err(fail)?;
        file.sync_all().map_err(fail)?;
        Ok(items)
    }

    fn write_sidecar(&self, record: &BackupRecord) -> Result<()> {
        let path = self.settings.backup_dir.join(sidecar_name(&record.filename));
        let mut bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| StoreError::backup("write metadata", &path, e))?;
        bytes.push(b'\n');
        write_atomic(&path, &bytes).map_err(|e| StoreError::backup("write metadata", &path, e))
    }

    // -----------------------------------------------------------------------
    // Inspect / delete
    // -----------------------------------------------------------------------

    /// Every archive with readable metadata, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        let dir = &self.settings.backup_dir;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io("list backups", dir)(e)),
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(ARCHIVE_PREFIX) || !name.ends_with(SIDECAR_SUFFIX) {
                continue;
            }
            let record = fs::read(entry.path())
                .ok()
                .and_then(|bytes| serde_json::from_slice::<BackupRecord>(&bytes).ok());
            match record {
                Some(record) if dir.join(&record.filename).is_file() => records.push(record),
                Some(record) => {
                    tracing::warn!(backup = %record.filename, "metadata without archive, skipped")
                }
                None => tracing::debug!(file = %name, "unreadable backup metadata, skipped"),
            }
        }
        records.sort_by(|a, b| {
            parse_stamp(&b.timestamp)
                .cmp(&parse_stamp(&a.timestamp))
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(records)
    }

    pub fn get_backup(&self, name: &str) -> Result<BackupRecord> {
        validate_name(name)?;
        self.list_backups()?
            .into_iter()
            .find(|r| r.filename == name)
            .ok_or_else(|| StoreError::not_found("backup", name))
    }

    /// Location of an archive, for download.
    pub fn archive_path(&self, name: &str) -> Result<PathBuf> {
        let record = self.get_backup(name)?;
        Ok(self.settings.backup_dir.join(record.filename))
    }

    pub fn delete_backup(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let _guard = self.lock.acquire(self.settings.lock_timeout)?;
        let archive = self.settings.backup_dir.join(name);
        if !archive.is_file() {
            return Err(StoreError::not_found("backup", name));
        }
        self.delete_files(name)?;
        tracing::info!(backup = name, "backup deleted");
        Ok(())
    }

    fn delete_files(&self, name: &str) -> Result<()> {
        let dir = &self.settings.backup_dir;
        for path in [dir.join(name), dir.join(sidecar_name(name))] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::backup("delete", &path, e)),
            }
        }
        Ok(())
    }

    /// Apply the retention policy. Failures are logged, never returned: a
    /// backup that was just created must not be reported as failed.
    fn prune_locked(&self) {
        let records = match self.list_backups() {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "retention sweep skipped");
                return;
            }
        };
        for record in self.settings.retention.plan(&records) {
            match self.delete_files(&record.filename) {
                Ok(()) => tracing::info!(backup = %record.filename, "pruned old backup"),
                Err(e) => tracing::warn!(backup = %record.filename, error = %e, "failed to prune backup"),
            }
        }
    }

    /// Store an uploaded archive after checking that it unpacks and carries
    /// a store document.
    pub fn import_backup(&self, filename: &str, bytes: &[u8]) -> Result<BackupRecord> {
        validate_name(filename)?;
        let included_items = inspect_archive(bytes)
            .map_err(|reason| StoreError::backup("import", filename, reason))?;

        let _guard = self.lock.acquire(self.settings.lock_timeout)?;
        let dir = &self.settings.backup_dir;
        fs::create_dir_all(dir).map_err(StoreError::io("create backup dir", dir))?;
        let archive = dir.join(filename);
        if archive.exists() {
            return Err(StoreError::backup("import", &archive, "a backup with this name exists"));
        }
        write_atomic(&archive, bytes).map_err(|e| StoreError::backup("import", &archive, e))?;

        let enhanced = included_items
            .iter()
            .any(|i| i == "certificates" || i.starts_with("proxy/") || i.starts_with("orchestration/"));
        let stem = &filename[ARCHIVE_PREFIX.len()..filename.len() - ARCHIVE_SUFFIX.len()];
        let record = BackupRecord {
            filename: filename.to_string(),
            version: if enhanced { ENHANCED_FORMAT } else { LEGACY_FORMAT }.to_string(),
            timestamp: stem.to_string(),
            description: "Imported backup".to_string(),
            size: bytes.len() as u64,
            included_items,
            created_at: Some(timestamp_now()),
            kind: BackupKind::Manual,
        };
        if let Err(e) = self.write_sidecar(&record) {
            let _ = fs::remove_file(&archive);
            return Err(e);
        }
        tracing::info!(backup = filename, size = record.size, "backup imported");
        self.prune_locked();
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Restore
    // -----------------------------------------------------------------------

    /// Put an archive's content back in place.
    ///
    /// Exactly one pre-restore safety backup is taken before any live file
    /// is touched, and it is kept whether or not the restore succeeds.
    pub fn restore_backup(&self, name: &str) -> Result<RestoreResult> {
        let record = self.get_backup(name)?;

        let result = {
            let _guard = self.lock.acquire(self.settings.lock_timeout)?;
            let safety = self.create_locked(
                BackupKind::PreRestore,
                &format!("Pre-restore safety backup before {name}"),
            )?;

            let outcome = self.restore_locked(&record);
            self.prune_locked();
            match outcome {
                Ok((restored_items, manual_steps, format)) => RestoreResult {
                    backup: record.filename.clone(),
                    safety_backup: safety.filename,
                    restored_items,
                    manual_steps,
                    format,
                },
                Err(e) => {
                    tracing::error!(backup = name, safety = %safety.filename, error = %e, "restore failed");
                    return Err(StoreError::Restore {
                        backup: name.to_string(),
                        safety_backup: safety.filename,
                        reason: e.to_string(),
                    });
                }
            }
        };

        tracing::info!(
            backup = name,
            safety = %result.safety_backup,
            items = result.restored_items.len(),
            "backup restored"
        );
        self.hook
            .regenerate(&RegenerationReason::Restored(name.to_string()));
        Ok(result)
    }

    fn restore_locked(&self, record: &BackupRecord) -> Result<(Vec<String>, Vec<String>, String)> {
        let archive_path = self.settings.backup_dir.join(&record.filename);
        let staging = tempfile::Builder::new()
            .prefix(".restore-")
            .tempdir_in(&self.settings.backup_dir)
            .map_err(StoreError::io("create staging dir", &self.settings.backup_dir))?;

        let file = File::open(&archive_path).map_err(StoreError::io("open backup", &archive_path))?;
        extract(file, staging.path()).map_err(|reason| StoreError::backup("extract", &archive_path, reason))?;

        let nested = staging.path().join("configs");
        let (configs, format) = if nested.is_dir() {
            (nested, ENHANCED_FORMAT)
        } else {
            (staging.path().to_path_buf(), LEGACY_FORMAT)
        };

        let users = configs.join(STORE_FILE_NAME);
        if !is_store_document(&users) {
            return Err(StoreError::backup(
                "restore",
                &archive_path,
                "archive holds no readable users.json",
            ));
        }

        let mut restored = Vec::new();
        let mut manual = Vec::new();
        let config_dir = &self.settings.config_dir;

        for name in std::iter::once(STORE_FILE_NAME).chain(SERVER_CONFIGS) {
            let src = configs.join(name);
            if src.is_file() {
                copy_file(&src, &config_dir.join(name))?;
                restored.push(format!("configs/{name}"));
            }
        }
        for sub in CONFIG_DIRS {
            let src = configs.join(sub);
            if src.is_dir() {
                merge_dir(&src, &config_dir.join(sub))?;
                restored.push(format!("configs/{sub}"));
            }
        }

        if format == ENHANCED_FORMAT {
            let root = staging.path();

            let certs = root.join("certificates");
            if certs.is_dir() {
                match &self.settings.certificates_dir {
                    Some(target) => {
                        merge_dir(&certs, target)?;
                        restored.push("certificates".to_string());
                    }
                    None => manual.push(
                        "Archive contains certificates but no certificates directory is configured; copy them by hand"
                            .to_string(),
                    ),
                }
            }

            if let Some(proxy) = single_file(&root.join("proxy")) {
                match &self.settings.proxy_config {
                    Some(target) => {
                        copy_file(&proxy, target)?;
                        restored.push(format!("proxy/{}", file_name(&proxy)));
                    }
                    None => manual.push(format!(
                        "Archive contains proxy/{} but no proxy config path is configured; restore it by hand",
                        file_name(&proxy)
                    )),
                }
            }

            if let Some(manifest) = single_file(&root.join("orchestration")) {
                manual.push(format!(
                    "Review orchestration/{} from the archive and apply it by hand, then restart the services",
                    file_name(&manifest)
                ));
            }

            let endpoints = root.join("endpoints").join("endpoints.json");
            if endpoints.is_file() {
                copy_file(&endpoints, &self.settings.endpoints_file)?;
                restored.push("endpoints/endpoints.json".to_string());
            }
        }

        Ok((restored, manual, format.to_string()))
    }
}

/// `backup_<stamp>.tar.gz` with no path components.
fn validate_name(name: &str) -> std::result::Result<(), ValidationError> {
    let well_formed = name.starts_with(ARCHIVE_PREFIX)
        && name.ends_with(ARCHIVE_SUFFIX)
        && name.len() > ARCHIVE_PREFIX.len() + ARCHIVE_SUFFIX.len()
        && !name.contains(['/', '\\'])
        && !name.contains("..");
    if well_formed {
        Ok(())
    } else {
        Err(ValidationError::InvalidName {
            kind: "backup",
            name: name.to_string(),
        })
    }
}

fn sidecar_name(archive: &str) -> String {
    let stem = archive.strip_suffix(ARCHIVE_SUFFIX).unwrap_or(archive);
    format!("{stem}{SIDECAR_SUFFIX}")
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Unpack into `root`, refusing anything but plain files and directories
/// and any entry that would land outside `root`.
fn extract(reader: impl Read, root: &Path) -> std::result::Result<(), String> {
    let mut archive = Archive::new(GzDecoder::new(reader));
    for entry in archive.entries().map_err(|e| e.to_string())? {
        let mut entry = entry.map_err(|e| e.to_string())?;
        let path = entry.path().map_err(|e| e.to_string())?.into_owned();
        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Directory => {}
            other => return Err(format!("entry {} has unsupported type {other:?}", path.display())),
        }
        let inside = entry.unpack_in(root).map_err(|e| e.to_string())?;
        if !inside {
            return Err(format!("entry {} escapes the archive root", path.display()));
        }
    }
    Ok(())
}

/// Top-level items of an uploaded archive, checking it unpacks cleanly and
/// carries a store document.
fn inspect_archive(bytes: &[u8]) -> std::result::Result<Vec<String>, String> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut items: Vec<String> = Vec::new();
    let mut has_store = false;

    for entry in archive.entries().map_err(|e| e.to_string())? {
        let mut entry = entry.map_err(|e| e.to_string())?;
        let path = entry.path().map_err(|e| e.to_string())?.into_owned();
        let parts: Vec<String> = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.iter().any(|p| p == ".." || p == "/") {
            return Err(format!("entry {} escapes the archive root", path.display()));
        }
        io::copy(&mut entry, &mut io::sink()).map_err(|e| e.to_string())?;

        let item = match parts.as_slice() {
            [first, second, ..] if first == "configs" => format!("configs/{second}"),
            [first, second, ..] if first == "proxy" || first == "orchestration" || first == "endpoints" => {
                format!("{first}/{second}")
            }
            [first, ..] => first.clone(),
            [] => continue,
        };
        if item == "users.json" || item == "configs/users.json" {
            has_store = true;
        }
        if !items.contains(&item) && item != "configs" {
            items.push(item);
        }
    }

    if has_store {
        Ok(items)
    } else {
        Err("archive holds no users.json".to_string())
    }
}

fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    let bytes = fs::read(src).map_err(StoreError::io("read staged file", src))?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(StoreError::io("create directory", parent))?;
    }
    write_atomic(dst, &bytes).map_err(StoreError::io("restore file", dst))
}

/// Copy every file under `src` into `dst`, replacing files that exist and
/// leaving other files in `dst` alone.
fn merge_dir(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).map_err(StoreError::io("create directory", dst))?;
    for entry in fs::read_dir(src).map_err(StoreError::io("read staged dir", src))? {
        let entry = entry.map_err(StoreError::io("read staged dir", src))?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        if path.is_dir() {
            merge_dir(&path, &target)?;
        } else {
            copy_file(&path, &target)?;
        }
    }
    Ok(())
}

/// The only regular file directly inside `dir`, if there is one.
fn single_file(dir: &Path) -> Option<PathBuf> {
    fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .find(|p| p.is_file())
}
