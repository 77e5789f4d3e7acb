//! The on-disk document and per-record validation on load.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use umbra_shared::{IdentifierIndex, ServerConfig, User, ValidationError};

use crate::migrations::{schema_version, CURRENT_VERSION};

/// Everything the store persists: users keyed by username plus the
/// deployment-wide server section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub users: BTreeMap<String, User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// Records that failed validation on load, kept verbatim.
    #[serde(skip)]
    pub quarantine: Quarantine,
}

/// Raw JSON of every record load had to leave out. Written back unchanged
/// on save so an unrelated write never destroys data an operator may still
/// repair by hand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Quarantine {
    /// Keyed by the record's key in `users`.
    pub users: BTreeMap<String, Value>,
    pub server: Option<Value>,
}

impl Quarantine {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.server.is_none()
    }
}

/// A record dropped during load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    /// Username, or `"server"` for the server section.
    pub record: String,
    pub reason: String,
}

/// What load had to leave out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub rejected: Vec<RejectedRecord>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }

    fn reject(&mut self, record: impl Into<String>, reason: impl ToString) {
        self.rejected.push(RejectedRecord {
            record: record.into(),
            reason: reason.to_string(),
        });
    }
}

impl StoreDocument {
    pub fn empty() -> Self {
        Self {
            schema_version: CURRENT_VERSION,
            users: BTreeMap::new(),
            server: None,
            last_modified: None,
            quarantine: Quarantine::default(),
        }
    }

    /// Every username and identifier in use, quarantined records included,
    /// so none of them is ever handed out again.
    pub fn identifier_index(&self) -> IdentifierIndex {
        let mut index = IdentifierIndex::from_users(self.users.values());
        for (key, raw) in &self.quarantine.users {
            index.insert_username(key);
            index_strings(raw, &mut index);
        }
        index
    }

    /// Whether `username` is taken by a valid or a quarantined record.
    pub fn has_username(&self, username: &str) -> bool {
        self.users.contains_key(username) || self.quarantine.users.contains_key(username)
    }

    /// Whether a server section exists, valid or quarantined.
    pub fn has_server(&self) -> bool {
        self.server.is_some() || self.quarantine.server.is_some()
    }

    /// Pretty JSON with sorted keys; quarantined records are merged back in.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(root) = &mut value {
            if !self.quarantine.users.is_empty() {
                let users = root
                    .entry("users")
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(users) = users {
                    for (key, raw) in &self.quarantine.users {
                        users.entry(key.clone()).or_insert_with(|| raw.clone());
                    }
                }
            }
            if let (None, Some(raw)) = (&self.server, &self.quarantine.server) {
                root.insert("server".to_string(), raw.clone());
            }
        }
        let mut bytes = serde_json::to_vec_pretty(&value)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Check the whole document as it would be written: every record valid,
    /// keys matching usernames, no identifier shared between users.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut owners: HashMap<String, &str> = HashMap::new();
        for (key, user) in &self.users {
            if key != &user.username {
                return Err(ValidationError::UsernameMismatch {
                    key: key.clone(),
                    username: user.username.clone(),
                });
            }
            user.validate()?;
            for (field, value) in user.identifiers() {
                if owners.insert(value, key).is_some() {
                    return Err(ValidationError::Duplicate { field });
                }
            }
        }
        if let Some(server) = &self.server {
            server.validate()?;
        }
        Ok(())
    }

    /// Build a document from a migrated JSON value, keeping every valid
    /// record and reporting and quarantining the rest.
    pub fn from_value(value: Value) -> Result<(Self, LoadReport), serde_json::Error> {
        let schema_version = schema_version(&value);
        let Value::Object(mut root) = value else {
            return Err(serde::de::Error::custom("store document is not a JSON object"));
        };
        let mut report = LoadReport::default();
        let mut quarantine = Quarantine::default();
        let last_modified = root
            .remove("last_modified")
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.trim().is_empty());

        let mut users = BTreeMap::new();
        let mut owners: HashMap<String, String> = HashMap::new();
        if let Some(Value::Object(records)) = root.remove("users") {
            for (key, raw) in records {
                let mut record = raw.clone();
                if let Value::Object(fields) = &mut record {
                    fields
                        .entry("username")
                        .or_insert_with(|| Value::String(key.clone()));
                }
                let verdict = match serde_json::from_value::<User>(record) {
                    Err(e) => Err(e.to_string()),
                    Ok(user) if user.username != key => Err(ValidationError::UsernameMismatch {
                        key: key.clone(),
                        username: user.username.clone(),
                    }
                    .to_string()),
                    Ok(user) => match user.validate() {
                        Err(e) => Err(e.to_string()),
                        Ok(()) => match user
                            .identifiers()
                            .into_iter()
                            .find_map(|(field, v)| owners.get(&v).map(|o| (field, o.clone())))
                        {
                            Some((field, owner)) => Err(format!("{field} already used by {owner}")),
                            None => Ok(user),
                        },
                    },
                };
                let user = match verdict {
                    Ok(user) => user,
                    Err(reason) => {
                        report.reject(&key, reason);
                        quarantine.users.insert(key, raw);
                        continue;
                    }
                };
                for (_, v) in user.identifiers() {
                    owners.insert(v, key.clone());
                }
                users.insert(key, user);
            }
        }

        let server = match root.remove("server") {
            None | Some(Value::Null) => None,
            Some(Value::Object(section))
                if !ServerConfig::SECRET_FIELDS
                    .iter()
                    .any(|f| section.contains_key(*f)) =>
            {
                None
            }
            Some(section) => {
                let verdict = serde_json::from_value::<ServerConfig>(section.clone())
                    .map_err(|e| e.to_string())
                    .and_then(|server| server.validate().map(|()| server).map_err(|e| e.to_string()));
                match verdict {
                    Ok(server) => Some(server),
                    Err(reason) => {
                        report.reject("server", reason);
                        quarantine.server = Some(section);
                        None
                    }
                }
            }
        };

        Ok((
            Self {
                schema_version,
                users,
                server,
                last_modified,
                quarantine,
            },
            report,
        ))
    }
}

fn index_strings(value: &Value, index: &mut IdentifierIndex) {
    match value {
        Value::String(s) => index.insert_value(s),
        Value::Array(items) => items.iter().for_each(|v| index_strings(v, index)),
        Value::Object(fields) => fields.values().for_each(|v| index_strings(v, index)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use umbra_shared::CredentialFactory;

    fn two_users() -> StoreDocument {
        let factory = CredentialFactory::new();
        let mut doc = StoreDocument::empty();
        for name in ["alice", "bob"] {
            let user = factory.new_user(name, &doc.identifier_index()).unwrap();
            doc.users.insert(name.to_string(), user);
        }
        doc.server = Some(factory.server_config("correct horse").unwrap());
        doc
    }

    #[test]
    fn serialize_parse_roundtrip() {
        let doc = two_users();
        let bytes = doc.to_json().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        let (parsed, report) = StoreDocument::from_value(value).unwrap();
        assert!(report.is_clean());
        assert_eq!(parsed, doc);
    }

    #[test]
    fn invalid_record_is_excluded_and_reported() {
        let doc = two_users();
        let mut value = serde_json::to_value(&doc).unwrap();
        value["users"]["bob"]["xray_uuid"] = json!("not-a-uuid");

        let (parsed, report) = StoreDocument::from_value(value).unwrap();
        assert_eq!(parsed.users.len(), 1);
        assert!(parsed.users.contains_key("alice"));
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].record, "bob");
    }

    #[test]
    fn shared_identifier_rejects_second_owner() {
        let doc = two_users();
        let mut value = serde_json::to_value(&doc).unwrap();
        value["users"]["bob"]["trojan_password"] = json!(doc.users["alice"].trojan_password);

        let (parsed, report) = StoreDocument::from_value(value).unwrap();
        assert_eq!(parsed.users.keys().collect::<Vec<_>>(), vec!["alice"]);
        assert!(report.rejected[0].reason.contains("trojan_password"));
        assert!(doc.validate().is_ok());
    }

    #[test]
    fn rejected_records_are_written_back_verbatim() {
        let doc = two_users();
        let mut value = serde_json::to_value(&doc).unwrap();
        value["users"]["bob"]["trojan_password"] = json!("too-short");
        value["server"]["session_secret"] = json!("short");
        let broken_bob = value["users"]["bob"].clone();
        let broken_server = value["server"].clone();

        let (parsed, report) = StoreDocument::from_value(value).unwrap();
        assert_eq!(report.rejected.len(), 2);
        assert!(parsed.server.is_none());
        assert!(parsed.has_server());
        assert!(parsed.has_username("bob"));

        let index = parsed.identifier_index();
        assert!(index.contains_username("bob"));
        assert!(index.contains_value(broken_bob["xray_uuid"].as_str().unwrap()));

        let written: Value = serde_json::from_slice(&parsed.to_json().unwrap()).unwrap();
        assert_eq!(written["users"]["bob"], broken_bob);
        assert_eq!(written["server"], broken_server);
        assert_eq!(written["users"]["alice"], serde_json::to_value(&doc.users["alice"]).unwrap());
    }

    #[test]
    fn oversized_schema_version_is_not_truncated() {
        let value = json!({ "schema_version": 4_294_967_297u64, "users": {} });
        let (parsed, _) = StoreDocument::from_value(value).unwrap();
        assert_eq!(parsed.schema_version, u32::MAX);
    }

    #[test]
    fn legacy_server_section_means_uninitialized() {
        let value = json!({
            "schema_version": 1,
            "users": {},
            "server": { "created_at": "2024-01-01T00:00:00" }
        });
        let (parsed, report) = StoreDocument::from_value(value).unwrap();
        assert!(parsed.server.is_none());
        assert!(report.is_clean());
    }

    #[test]
    fn broken_server_section_is_reported() {
        let value = json!({
            "schema_version": 1,
            "users": {},
            "server": { "session_secret": "short" }
        });
        let (parsed, report) = StoreDocument::from_value(value).unwrap();
        assert!(parsed.server.is_none());
        assert_eq!(report.rejected[0].record, "server");
    }

    #[test]
    fn missing_username_taken_from_key() {
        let doc = two_users();
        let mut value = serde_json::to_value(&doc).unwrap();
        value["users"]["alice"]
            .as_object_mut()
            .unwrap()
            .remove("username");
        let (parsed, report) = StoreDocument::from_value(value).unwrap();
        assert!(report.is_clean());
        assert_eq!(parsed.users["alice"].username, "alice");
    }

    #[test]
    fn key_mismatch_fails_validation() {
        let mut doc = two_users();
        let alice = doc.users.remove("alice").unwrap();
        doc.users.insert("carol".to_string(), alice);
        assert!(matches!(
            doc.validate(),
            Err(ValidationError::UsernameMismatch { .. })
        ));
    }
}
