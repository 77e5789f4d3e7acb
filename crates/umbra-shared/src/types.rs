use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::constants::{MIN_KEY_LEN, MIN_SECRET_LEN, USERNAME_MAX_LEN, USERNAME_MIN_LEN};
use crate::error::ValidationError;
use crate::keys;

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// One VPN user and the credentials for every protocol family.
///
/// The Sing-box family fields (`shadowtls_password` .. `tuic_password`)
/// appeared in schema 1; they are optional so that schema 0 records still
/// deserialize before migration fills them in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub id: Uuid,
    pub xray_uuid: Uuid,
    pub wireguard_private_key: String,
    pub wireguard_public_key: String,
    pub trojan_password: String,
    #[serde(default)]
    pub shadowtls_password: Option<String>,
    #[serde(default)]
    pub shadowsocks_password: Option<String>,
    #[serde(default)]
    pub hysteria2_password: Option<String>,
    #[serde(default)]
    pub tuic_uuid: Option<Uuid>,
    #[serde(default)]
    pub tuic_password: Option<String>,
    /// RFC 3339 timestamp.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub created_at: Option<String>,
    /// RFC 3339 timestamp of the last observed connection.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub last_seen: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

fn empty_as_none<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Option::<String>::deserialize(d)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

impl User {
    /// Check every field invariant of a single record.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_username(&self.username)?;

        require_v4("id", &self.id)?;
        require_v4("xray_uuid", &self.xray_uuid)?;
        if let Some(tuic) = &self.tuic_uuid {
            require_v4("tuic_uuid", tuic)?;
        }

        min_len("wireguard_private_key", &self.wireguard_private_key, MIN_KEY_LEN)?;
        min_len("wireguard_public_key", &self.wireguard_public_key, MIN_KEY_LEN)?;
        keys::verify_wireguard_pair(
            "WireGuard",
            &self.wireguard_private_key,
            &self.wireguard_public_key,
        )?;

        min_len("trojan_password", &self.trojan_password, MIN_SECRET_LEN)?;
        for (field, value) in self.singbox_secrets() {
            if let Some(value) = value {
                min_len(field, value, MIN_SECRET_LEN)?;
            }
        }

        if let Some(ts) = &self.created_at {
            parse_timestamp("created_at", ts)?;
        }
        if let Some(ts) = &self.last_seen {
            parse_timestamp("last_seen", ts)?;
        }
        Ok(())
    }

    fn singbox_secrets(&self) -> [(&'static str, Option<&String>); 4] {
        [
            ("shadowtls_password", self.shadowtls_password.as_ref()),
            ("shadowsocks_password", self.shadowsocks_password.as_ref()),
            ("hysteria2_password", self.hysteria2_password.as_ref()),
            ("tuic_password", self.tuic_password.as_ref()),
        ]
    }

    /// Every identifier and secret carried by this record, labelled by field.
    /// No two users may share any of these values.
    pub fn identifiers(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            ("id", self.id.to_string()),
            ("xray_uuid", self.xray_uuid.to_string()),
            ("wireguard_private_key", self.wireguard_private_key.clone()),
            ("wireguard_public_key", self.wireguard_public_key.clone()),
            ("trojan_password", self.trojan_password.clone()),
        ];
        if let Some(tuic) = &self.tuic_uuid {
            out.push(("tuic_uuid", tuic.to_string()));
        }
        for (field, value) in self.singbox_secrets() {
            if let Some(value) = value {
                out.push((field, value.clone()));
            }
        }
        out
    }

    /// Whether all Sing-box family credentials are present.
    pub fn has_singbox_credentials(&self) -> bool {
        self.tuic_uuid.is_some() && self.singbox_secrets().iter().all(|(_, v)| v.is_some())
    }
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Deployment-wide secrets, created once at first boot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub wireguard_server_private_key: String,
    pub wireguard_server_public_key: String,
    /// Xray REALITY private key.
    pub xray_private_key: String,
    /// Argon2id PHC string.
    pub admin_password_hash: String,
    pub session_secret: String,
    /// Role name -> disguised path, mirrored from the endpoint set.
    #[serde(default)]
    pub obfuscated_endpoints: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub created_at: Option<String>,
}

/// The server secrets an admin may rotate explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSecret {
    WireGuard,
    Xray,
    Session,
}

impl ServerSecret {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "wireguard" => Some(Self::WireGuard),
            "xray" => Some(Self::Xray),
            "session" => Some(Self::Session),
            _ => None,
        }
    }
}

impl ServerConfig {
    /// Field names whose presence marks an initialized server section.
    /// A legacy `{ "created_at": .. }` section carries none of them.
    pub const SECRET_FIELDS: [&'static str; 5] = [
        "wireguard_server_private_key",
        "wireguard_server_public_key",
        "xray_private_key",
        "admin_password_hash",
        "session_secret",
    ];

    pub fn validate(&self) -> Result<(), ValidationError> {
        min_len(
            "wireguard_server_private_key",
            &self.wireguard_server_private_key,
            MIN_KEY_LEN,
        )?;
        min_len(
            "wireguard_server_public_key",
            &self.wireguard_server_public_key,
            MIN_KEY_LEN,
        )?;
        keys::verify_wireguard_pair(
            "WireGuard server",
            &self.wireguard_server_private_key,
            &self.wireguard_server_public_key,
        )?;
        min_len("xray_private_key", &self.xray_private_key, MIN_KEY_LEN)?;
        if self.admin_password_hash.trim().is_empty() {
            return Err(ValidationError::Empty("admin_password_hash"));
        }
        min_len("session_secret", &self.session_secret, MIN_KEY_LEN)?;
        if let Some(ts) = &self.created_at {
            parse_timestamp("created_at", ts)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Field rules
// ---------------------------------------------------------------------------

pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    let len_ok = (USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&username.len());
    let chars_ok = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if len_ok && chars_ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidUsername(username.to_string()))
    }
}

fn require_v4(field: &'static str, uuid: &Uuid) -> Result<(), ValidationError> {
    if uuid.get_version_num() == 4 {
        Ok(())
    } else {
        Err(ValidationError::InvalidUuid {
            field,
            value: uuid.to_string(),
        })
    }
}

fn min_len(field: &'static str, value: &str, min: usize) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty(field));
    }
    if value.len() < min {
        return Err(ValidationError::TooShort { field, min });
    }
    Ok(())
}

/// Parse an RFC 3339 timestamp, also accepting the naive
/// `YYYY-MM-DDTHH:MM:SS[.ffffff]` form older documents carry.
pub fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| ValidationError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}

/// Current time as an RFC 3339 UTC string with microseconds.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
