//! Backup kinds and the retention sweep shared by document snapshots and
//! archives.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a backup exists. Only `Auto` backups are ever pruned automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupKind {
    Auto,
    #[default]
    Manual,
    PreMigration,
    PreRestore,
}

impl BackupKind {
    pub const ALL: [BackupKind; 4] = [
        BackupKind::Auto,
        BackupKind::Manual,
        BackupKind::PreMigration,
        BackupKind::PreRestore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Auto => "auto",
            BackupKind::Manual => "manual",
            BackupKind::PreMigration => "pre-migration",
            BackupKind::PreRestore => "pre-restore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Anything the sweep can reason about.
pub trait Retained {
    fn kind(&self) -> BackupKind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Most recent auto backups to keep.
    pub keep_auto: usize,
    /// Upper bound on the total number of backups, enforced by deleting
    /// auto backups only.
    pub ceiling: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_auto: 10,
            ceiling: 20,
        }
    }
}

impl RetentionPolicy {
    /// Pick what to delete from `newest_first`. The result is ordered
    /// oldest first.
    pub fn plan<'a, T: Retained>(&self, newest_first: &'a [T]) -> Vec<&'a T> {
        let autos: Vec<&T> = newest_first
            .iter()
            .filter(|e| e.kind() == BackupKind::Auto)
            .collect();

        // Autos past the keep window, oldest first.
        let mut doomed: Vec<&T> = autos.iter().skip(self.keep_auto).rev().copied().collect();

        let mut remaining = newest_first.len() - doomed.len();
        let mut survivors = autos.iter().take(self.keep_auto).rev();
        while remaining > self.ceiling {
            match survivors.next() {
                Some(oldest) => {
                    doomed.push(*oldest);
                    remaining -= 1;
                }
                None => {
                    tracing::warn!(
                        remaining,
                        ceiling = self.ceiling,
                        "non-auto backups alone exceed the retention ceiling"
                    );
                    break;
                }
            }
        }
        doomed
    }
}
