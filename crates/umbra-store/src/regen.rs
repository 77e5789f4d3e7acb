//! Notification seam towards the external config generators.

use std::fmt;

/// What changed in the user set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegenerationReason {
    UserAdded(String),
    UserRemoved(String),
    UserUpdated(String),
    /// A backup or snapshot was restored; carries its name.
    Restored(String),
    ServerRotated,
}

impl fmt::Display for RegenerationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegenerationReason::UserAdded(u) => write!(f, "user added: {u}"),
            RegenerationReason::UserRemoved(u) => write!(f, "user removed: {u}"),
            RegenerationReason::UserUpdated(u) => write!(f, "user updated: {u}"),
            RegenerationReason::Restored(name) => write!(f, "restored from {name}"),
            RegenerationReason::ServerRotated => f.write_str("server secret rotated"),
        }
    }
}

/// Called after a committed change that invalidates generated client or
/// server configs. Never called while the store lock is held.
pub trait RegenerationHook: Send + Sync {
    fn regenerate(&self, reason: &RegenerationReason);
}

/// Default hook: records the event and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyRegeneration;

impl RegenerationHook for LogOnlyRegeneration {
    fn regenerate(&self, reason: &RegenerationReason) {
        tracing::info!(%reason, "configuration regeneration requested");
    }
}
