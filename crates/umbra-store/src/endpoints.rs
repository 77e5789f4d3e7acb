//! Disguised URL paths for the services behind the reverse proxy.
//!
//! Each role gets a path that looks like an ordinary web resource (a script
//! bundle, a web font, a REST call).  A set is never edited in place: a
//! rotation writes a complete new set and keeps the old one as
//! `endpoints_<stamp>.json` in the backup directory.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use umbra_shared::types::parse_timestamp;
use umbra_shared::{timestamp_now, ValidationError};

use crate::atomic::{stamped_path, write_atomic};
use crate::config::StoreSettings;
use crate::error::{Result, StoreError};
use crate::lock::ExclusiveLock;

const MAX_PATH_LEN: usize = 128;
const MAX_ATTEMPTS: usize = 16;
pub const FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    AdminPanel,
    XrayWebsocket,
    WireguardWebsocket,
    TrojanWebsocket,
    HealthCheck,
    WebrtcSignal,
}

/// Kind of web resource a path imitates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathFamily {
    Api,
    Script,
    Font,
    Health,
    Media,
}

impl EndpointRole {
    pub const ALL: [EndpointRole; 6] = [
        EndpointRole::AdminPanel,
        EndpointRole::XrayWebsocket,
        EndpointRole::WireguardWebsocket,
        EndpointRole::TrojanWebsocket,
        EndpointRole::HealthCheck,
        EndpointRole::WebrtcSignal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointRole::AdminPanel => "admin_panel",
            EndpointRole::XrayWebsocket => "xray_websocket",
            EndpointRole::WireguardWebsocket => "wireguard_websocket",
            EndpointRole::TrojanWebsocket => "trojan_websocket",
            EndpointRole::HealthCheck => "health_check",
            EndpointRole::WebrtcSignal => "webrtc_signal",
        }
    }

    pub fn family(&self) -> PathFamily {
        match self {
            EndpointRole::AdminPanel | EndpointRole::TrojanWebsocket => PathFamily::Api,
            EndpointRole::XrayWebsocket => PathFamily::Script,
            EndpointRole::WireguardWebsocket => PathFamily::Font,
            EndpointRole::HealthCheck => PathFamily::Health,
            EndpointRole::WebrtcSignal => PathFamily::Media,
        }
    }
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One generation of paths. Serialized flat: role keys next to the
/// metadata keys. Files written before the metadata keys were renamed use
/// `generated_at` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>")]
pub struct EndpointSet {
    #[serde(flatten)]
    pub paths: BTreeMap<String, String>,
    /// 16 random bytes, hex.
    pub generation_id: String,
    pub generation_timestamp: String,
    pub version: String,
}

fn default_version() -> String {
    FORMAT_VERSION.to_string()
}

impl TryFrom<BTreeMap<String, String>> for EndpointSet {
    type Error = String;

    fn try_from(mut raw: BTreeMap<String, String>) -> std::result::Result<Self, Self::Error> {
        let mut take = |keys: [&str; 2]| keys.iter().find_map(|k| raw.remove(*k));
        let generation_id = take(["generation_id", "generated_at"])
            .ok_or("endpoint set has no generation id")?;
        let generation_timestamp = take(["generation_timestamp", "timestamp"])
            .ok_or("endpoint set has no generation timestamp")?;
        let version = raw.remove("version").unwrap_or_else(default_version);
        Ok(Self {
            paths: raw,
            generation_id,
            generation_timestamp,
            version,
        })
    }
}

impl EndpointSet {
    pub fn path(&self, role: EndpointRole) -> Option<&str> {
        self.paths.get(role.as_str()).map(String::as_str)
    }
}

/// Reads, validates and rotates the endpoint set file.
#[derive(Debug, Clone)]
pub struct EndpointRotator {
    file: PathBuf,
    backup_dir: PathBuf,
    rotation_days: u32,
    lock: Arc<dyn ExclusiveLock>,
    lock_timeout: Duration,
}

impl EndpointRotator {
    pub fn new(settings: &StoreSettings, lock: Arc<dyn ExclusiveLock>) -> Self {
        Self {
            file: settings.endpoints_file.clone(),
            backup_dir: settings.backup_dir.clone(),
            rotation_days: settings.endpoint_rotation_days,
            lock,
            lock_timeout: settings.lock_timeout,
        }
    }

    /// The committed set, if any.
    pub fn current(&self) -> Result<Option<EndpointSet>> {
        let bytes = match fs::read(&self.file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io("read endpoint set", &self.file)(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::StoreCorrupt {
                path: self.file.clone(),
                reason: e.to_string(),
            })
    }

    /// Return the current set if it is younger than the rotation threshold,
    /// otherwise (or when `force`d) commit and return a new one.
    pub fn generate(&self, force: bool) -> Result<EndpointSet> {
        let _guard = self.lock.acquire(self.lock_timeout)?;

        let current = match self.current() {
            Ok(current) => current,
            Err(StoreError::StoreCorrupt { reason, .. }) => {
                tracing::warn!(path = %self.file.display(), %reason, "endpoint set unreadable, replacing it");
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(current) = &current {
            if !force && !self.should_rotate(current) {
                tracing::debug!(generation = %current.generation_id, "endpoint set still fresh");
                return Ok(current.clone());
            }
        }

        let next = fresh_set(current.as_ref())?;

        if let Some(previous) = &current {
            fs::create_dir_all(&self.backup_dir)
                .map_err(StoreError::io("create backup dir", &self.backup_dir))?;
            let (path, _) = stamped_path(&self.backup_dir, "endpoints_", ".json");
            write_atomic(&path, &to_json(previous)?)
                .map_err(|e| StoreError::backup("endpoint backup", &path, e))?;
            tracing::info!(path = %path.display(), generation = %previous.generation_id, "previous endpoint set backed up");
        }

        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent).map_err(StoreError::io("create directory", parent))?;
        }
        write_atomic(&self.file, &to_json(&next)?).map_err(StoreError::persist(&self.file))?;
        tracing::info!(generation = %next.generation_id, "endpoint set rotated");
        Ok(next)
    }

    pub fn validate(&self, set: &EndpointSet) -> bool {
        self.validation_errors(set).is_empty()
    }

    /// Every reason `set` is unusable.
    pub fn validation_errors(&self, set: &EndpointSet) -> Vec<String> {
        let mut errors = Vec::new();
        let mut owners: HashMap<&str, EndpointRole> = HashMap::new();

        for role in EndpointRole::ALL {
            let Some(path) = set.path(role) else {
                errors.push(format!("missing path for {role}"));
                continue;
            };
            errors.extend(path_errors(path).into_iter().map(|e| format!("{role}: {e}")));
            if let Some(other) = owners.insert(path, role) {
                errors.push(format!("{role}: path already used by {other}"));
            }
        }

        if set.generation_id.trim().is_empty() {
            errors.push("generation id is empty".to_string());
        }
        if parse_timestamp("generation_timestamp", &set.generation_timestamp).is_err() {
            errors.push(format!(
                "unparsable generation timestamp '{}'",
                set.generation_timestamp
            ));
        }
        errors
    }

    pub fn age(&self, set: &EndpointSet) -> Option<chrono::Duration> {
        parse_timestamp("generation_timestamp", &set.generation_timestamp)
            .ok()
            .map(|at| Utc::now() - at)
    }

    /// Age at or past the threshold. A set whose age cannot be told is
    /// always due.
    pub fn should_rotate(&self, set: &EndpointSet) -> bool {
        match self.age(set) {
            Some(age) => age >= chrono::Duration::days(i64::from(self.rotation_days)),
            None => true,
        }
    }
}

fn to_json(set: &EndpointSet) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(set)
        .map_err(|e| StoreError::backup("serialize endpoint set", PathBuf::new(), e))?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn path_errors(path: &str) -> Vec<&'static str> {
    let mut errors = Vec::new();
    if !path.starts_with('/') {
        errors.push("must start with '/'");
    }
    if path.len() > MAX_PATH_LEN {
        errors.push("longer than 128 characters");
    }
    if path.chars().any(char::is_whitespace) {
        errors.push("contains whitespace");
    }
    if !path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'))
    {
        errors.push("contains characters outside [A-Za-z0-9/._-]");
    }
    if path.contains("..") {
        errors.push("contains '..'");
    }
    errors
}

/// A complete new generation. No path repeats within the set or matches
/// the previous generation's path for the same role.
fn fresh_set(previous: Option<&EndpointSet>) -> Result<EndpointSet> {
    let mut rng = rand::thread_rng();
    let mut used = HashSet::new();
    let mut paths = BTreeMap::new();

    for role in EndpointRole::ALL {
        let before = previous.and_then(|p| p.path(role));
        let path = (0..MAX_ATTEMPTS)
            .map(|_| disguised_path(&mut rng, role.family()))
            .find(|candidate| !used.contains(candidate) && Some(candidate.as_str()) != before)
            .ok_or(ValidationError::IdentifierSpace {
                field: role.as_str(),
                attempts: MAX_ATTEMPTS,
            })?;
        used.insert(path.clone());
        paths.insert(role.as_str().to_string(), path);
    }

    Ok(EndpointSet {
        paths,
        generation_id: hex::encode(rng.gen::<[u8; 16]>()),
        generation_timestamp: timestamp_now(),
        version: default_version(),
    })
}

fn pick<'a, R: Rng>(rng: &mut R, items: &[&'a str]) -> &'a str {
    items.choose(rng).copied().unwrap_or_default()
}

/// One path of the given family carrying an 8-hex random token.
pub fn disguised_path<R: Rng>(rng: &mut R, family: PathFamily) -> String {
    let token = hex::encode(rng.gen::<[u8; 4]>());
    let variant = rng.gen_range(0..4);

    match family {
        PathFamily::Script => {
            let lib = pick(rng, &["jquery", "bootstrap", "analytics", "tracking", "metrics", "stats", "lodash", "moment"]);
            let suffix = pick(rng, &["min.js", "bundle.js", "prod.js", "chunk.js"]);
            let version = format!("{}.{}.{}", rng.gen_range(1..=5), rng.gen_range(0..10), rng.gen_range(0..10));
            match variant {
                0 => format!("/assets/js/{lib}-{version}.{token}.{suffix}"),
                1 => format!("/cdn/libs/{lib}/{version}/{lib}-{token}.{suffix}"),
                2 => format!("/static/js/{lib}-{token}.{suffix}"),
                _ => format!("/js/vendor/{lib}.{token}.{suffix}"),
            }
        }
        PathFamily::Font => {
            let font = pick(rng, &["roboto", "opensans", "lato", "montserrat", "poppins", "nunito", "inter", "raleway"]);
            let weight = pick(rng, &["regular", "bold", "light", "medium", "semibold", "thin"]);
            match variant {
                0 => format!("/static/fonts/woff2/{font}-{weight}-{token}.woff2"),
                1 => format!("/assets/fonts/{font}/{font}-{weight}.{token}.woff2"),
                2 => format!("/fonts/{font}-{weight}-{token}.woff2"),
                _ => format!("/cdn/fonts/{font}/{token}/{weight}.woff2"),
            }
        }
        PathFamily::Api => {
            let version = pick(rng, &["v1", "v2", "v3"]);
            let service = pick(rng, &["storage", "files", "cloud", "sync", "backup", "media", "data"]);
            let action = pick(rng, &["upload", "download", "sync", "metadata", "thumbnail", "preview", "process"]);
            match variant {
                0 => format!("/api/{version}/{service}/{action}/{token}"),
                1 => format!("/api/{version}/{service}/batch/{token}/{action}"),
                2 => format!("/rest/{version}/{service}/{token}/{action}"),
                _ => format!("/api/{version}/internal/{service}/{action}-{token}"),
            }
        }
        PathFamily::Health => {
            let service = pick(rng, &["microservices", "services", "api", "system", "internal"]);
            let check = pick(rng, &["health", "status", "ping", "alive", "ready", "heartbeat"]);
            match variant {
                0 => format!("/api/v1/{service}/{check}/{token}"),
                1 => format!("/internal/{service}/{token}/{check}"),
                2 => format!("/monitoring/{service}/{check}-{token}"),
                _ => format!("/status/{service}/{token}/{check}"),
            }
        }
        PathFamily::Media => {
            let service = pick(rng, &["webrtc", "streaming", "conference", "broadcast", "rtc"]);
            let room = pick(rng, &["conference", "meeting", "room", "session", "call"]);
            let signal = pick(rng, &["signal", "ice", "sdp", "candidate", "offer", "answer"]);
            match variant {
                0 => format!("/media/{service}/{room}/{token}/{signal}"),
                1 => format!("/streaming/{service}/{signal}-{token}"),
                2 => format!("/rtc/{room}/{token}/{signal}"),
                _ => format!("/ws/{service}/{room}-{token}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::FileLock;

    fn rotator(dir: &std::path::Path) -> EndpointRotator {
        let settings = StoreSettings::for_data_dir(dir);
        let lock = Arc::new(FileLock::new(dir.join(".users.lock")));
        EndpointRotator::new(&settings, lock)
    }

    #[test]
    fn every_family_produces_valid_paths() {
        let mut rng = rand::thread_rng();
        for role in EndpointRole::ALL {
            for _ in 0..50 {
                let path = disguised_path(&mut rng, role.family());
                assert!(path_errors(&path).is_empty(), "{path}");
            }
        }
    }

    #[test]
    fn first_generation_is_valid_and_committed() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = rotator(dir.path());
        assert_eq!(rotator.current().unwrap(), None);

        let set = rotator.generate(false).unwrap();
        assert!(rotator.validate(&set), "{:?}", rotator.validation_errors(&set));
        assert_eq!(rotator.current().unwrap(), Some(set.clone()));
        assert_eq!(set.generation_id.len(), 32);
        assert_eq!(set.version, "1.0");
    }

    #[test]
    fn fresh_set_is_kept_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = rotator(dir.path());
        let first = rotator.generate(false).unwrap();
        assert_eq!(rotator.generate(false).unwrap(), first);
    }

    #[test]
    fn forced_rotation_never_reuses_a_role_path() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = rotator(dir.path());
        let mut previous = rotator.generate(true).unwrap();
        for _ in 0..20 {
            let next = rotator.generate(true).unwrap();
            for role in EndpointRole::ALL {
                assert_ne!(next.path(role), previous.path(role));
            }
            previous = next;
        }
        let backups = fs::read_dir(dir.path().join("backups"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("endpoints_"))
            .count();
        assert_eq!(backups, 20);
    }

    #[test]
    fn stale_set_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = rotator(dir.path());
        let mut old = rotator.generate(false).unwrap();
        old.generation_timestamp = "2020-01-01T00:00:00Z".to_string();
        write_atomic(&dir.path().join("endpoints.json"), &to_json(&old).unwrap()).unwrap();

        assert!(rotator.should_rotate(&old));
        let next = rotator.generate(false).unwrap();
        assert_ne!(next.generation_id, old.generation_id);
    }

    #[test]
    fn legacy_metadata_keys_are_accepted() {
        let legacy = serde_json::json!({
            "admin_panel": "/api/v1/storage/upload",
            "xray_websocket": "/assets/js/jquery-1.2.3.min.js",
            "wireguard_websocket": "/fonts/inter-bold.woff2",
            "trojan_websocket": "/rest/v2/sync/metadata",
            "health_check": "/status/api/ping",
            "webrtc_signal": "/rtc/room/sdp",
            "generated_at": "00112233445566778899aabbccddeeff",
            "timestamp": "2024-05-01T12:00:00.000000Z",
            "version": "1.0"
        });
        let set: EndpointSet = serde_json::from_value(legacy).unwrap();
        assert_eq!(set.generation_id, "00112233445566778899aabbccddeeff");
        assert_eq!(set.paths.len(), 6);

        let dir = tempfile::tempdir().unwrap();
        assert!(rotator(dir.path()).validate(&set));
    }

    #[test]
    fn validation_reports_each_problem() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = rotator(dir.path());
        let mut set = rotator.generate(false).unwrap();
        set.paths.insert("admin_panel".into(), "api/no slash".into());
        set.paths.insert("health_check".into(), "/../etc/passwd".into());
        set.paths.insert("webrtc_signal".into(), set.paths["xray_websocket"].clone());
        set.paths.remove("trojan_websocket");
        set.generation_timestamp = "yesterday".into();

        let errors = rotator.validation_errors(&set);
        assert!(!rotator.validate(&set));
        assert!(errors.iter().any(|e| e.contains("must start with '/'")));
        assert!(errors.iter().any(|e| e.contains("whitespace")));
        assert!(errors.iter().any(|e| e.contains("'..'")));
        assert!(errors.iter().any(|e| e.contains("already used")));
        assert!(errors.iter().any(|e| e.contains("missing path for trojan_websocket")));
        assert!(errors.iter().any(|e| e.contains("timestamp")));
        assert!(rotator.should_rotate(&set));
    }
}
