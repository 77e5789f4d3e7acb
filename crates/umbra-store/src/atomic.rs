//! Crash-safe file replacement.
//!
//! The write protocol is: create a temp file in the target's directory,
//! write, flush, fsync, then rename over the target and fsync the directory.
//! A crash at any point before the rename leaves the target byte-for-byte
//! unchanged; after the rename the new content is fully in place.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};

pub(crate) const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

/// Points in the write protocol where a test can simulate a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteStage {
    TempCreated,
    Written,
    Synced,
}

/// Atomically replace `target` with `bytes`.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
    write_until(target, bytes, None)
}

/// Run the write protocol but stop dead at `stage`, leaving the temp file
/// behind exactly as a killed process would.
#[cfg(test)]
pub(crate) fn write_interrupted(target: &Path, bytes: &[u8], stage: WriteStage) -> io::Result<()> {
    write_until(target, bytes, Some(stage))
}

fn write_until(target: &Path, bytes: &[u8], halt: Option<WriteStage>) -> io::Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let tmp = temp_path_for(target);

    let mut file = create_private(&tmp)?;
    if halt == Some(WriteStage::TempCreated) {
        return Err(simulated_crash());
    }

    let written = file.write_all(bytes);
    if halt == Some(WriteStage::Written) {
        return Err(simulated_crash());
    }
    let synced = written.and_then(|_| file.flush()).and_then(|_| file.sync_all());
    if halt == Some(WriteStage::Synced) {
        return Err(simulated_crash());
    }
    drop(file);

    if let Err(e) = synced.and_then(|_| fs::rename(&tmp, target)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    // Persist the rename itself. Not all platforms allow opening a directory.
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

fn simulated_crash() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "simulated crash")
}

fn create_private(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// `.<name>.<random>.tmp` next to the target.
fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let token = hex::encode(rand::random::<[u8; 6]>());
    target.with_file_name(format!(".{name}.{token}.tmp"))
}

/// Remove temp files a crashed writer left next to `target`.
pub fn remove_stale_temps(target: &Path) -> usize {
    let Some(dir) = target.parent() else {
        return 0;
    };
    let Some(name) = target.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return 0;
    };
    let prefix = format!(".{name}.");
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.starts_with(&prefix) && file_name.ends_with(".tmp") {
            if fs::remove_file(entry.path()).is_ok() {
                tracing::debug!(path = %entry.path().display(), "removed stale temp file");
                removed += 1;
            }
        }
    }
    removed
}

/// A path `<dir>/<prefix><stamp><suffix>` that does not exist yet, where
/// the stamp sorts chronologically. Returns the path and the stamp.
pub fn stamped_path(dir: &Path, prefix: &str, suffix: &str) -> (PathBuf, String) {
    stamped_path_at(dir, prefix, suffix, Utc::now())
}

fn stamped_path_at(dir: &Path, prefix: &str, suffix: &str, mut at: DateTime<Utc>) -> (PathBuf, String) {
    loop {
        let stamp = at.format(STAMP_FORMAT).to_string();
        let path = dir.join(format!("{prefix}{stamp}{suffix}"));
        if !path.exists() {
            return (path, stamp);
        }
        at += Duration::microseconds(1);
    }
}

/// Parse a stamp produced by [`stamped_path`]; also accepts the
/// second-resolution `YYYYmmdd_HHMMSS` form.
pub fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    use chrono::NaiveDateTime;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S"))
        .ok()
        .map(|naive| naive.and_utc())
}
