//! Per-user credential generation.
//!
//! [`CredentialFactory`] is the only place secrets are minted.  It draws all
//! randomness from the operating system RNG and checks every generated value
//! against an [`IdentifierIndex`] so that no two users ever share an
//! identifier or a secret.

use std::collections::HashSet;

use uuid::Uuid;

use crate::constants::{MAX_GENERATION_ATTEMPTS, MIN_ADMIN_PASSWORD_LEN};
use crate::error::ValidationError;
use crate::keys;
use crate::types::{timestamp_now, validate_username, ServerConfig, ServerSecret, User};

/// Every username and every identifier/secret value already in use.
#[derive(Debug, Clone, Default)]
pub struct IdentifierIndex {
    usernames: HashSet<String>,
    values: HashSet<String>,
}

impl IdentifierIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_users<'a>(users: impl IntoIterator<Item = &'a User>) -> Self {
        let mut index = Self::new();
        for user in users {
            index.insert_user(user);
        }
        index
    }

    pub fn insert_user(&mut self, user: &User) {
        self.usernames.insert(user.username.clone());
        for (_, value) in user.identifiers() {
            self.values.insert(value);
        }
    }

    pub fn insert_username(&mut self, username: &str) {
        self.usernames.insert(username.to_string());
    }

    /// Record a raw identifier value (used when indexing untyped records).
    pub fn insert_value(&mut self, value: &str) {
        self.values.insert(value.to_string());
    }

    pub fn contains_username(&self, username: &str) -> bool {
        self.usernames.contains(username)
    }

    pub fn contains_value(&self, value: &str) -> bool {
        self.values.contains(value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Mints users and server secrets.
#[derive(Debug, Clone)]
pub struct CredentialFactory {
    max_attempts: usize,
}

impl Default for CredentialFactory {
    fn default() -> Self {
        Self {
            max_attempts: MAX_GENERATION_ATTEMPTS,
        }
    }
}

impl CredentialFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fully populated user.
    ///
    /// Fails if the username is malformed or taken.  Every value is checked
    /// against `existing` and against the other values minted for this user.
    pub fn new_user(
        &self,
        username: &str,
        existing: &IdentifierIndex,
    ) -> Result<User, ValidationError> {
        validate_username(username)?;
        if existing.contains_username(username) {
            return Err(ValidationError::UsernameTaken(username.to_string()));
        }

        let mut taken = existing.clone();
        let id = self.fresh_uuid("id", &mut taken)?;
        let xray_uuid = self.fresh_uuid("xray_uuid", &mut taken)?;
        let wireguard = self.fresh_wireguard_keypair(&mut taken)?;
        let trojan_password = self.fresh_secret("trojan_password", &mut taken)?;

        let mut user = User {
            username: username.to_string(),
            id,
            xray_uuid,
            wireguard_private_key: wireguard.private_key,
            wireguard_public_key: wireguard.public_key,
            trojan_password,
            shadowtls_password: None,
            shadowsocks_password: None,
            hysteria2_password: None,
            tuic_uuid: None,
            tuic_password: None,
            created_at: Some(timestamp_now()),
            last_seen: None,
            is_active: true,
        };
        self.fill_missing(&mut user, &mut taken)?;
        Ok(user)
    }

    /// Populate any absent Sing-box family credential. Returns how many
    /// fields were filled.
    pub fn fill_missing(
        &self,
        user: &mut User,
        taken: &mut IdentifierIndex,
    ) -> Result<usize, ValidationError> {
        let mut filled = 0;
        let secrets = [
            ("shadowtls_password", &mut user.shadowtls_password),
            ("shadowsocks_password", &mut user.shadowsocks_password),
            ("hysteria2_password", &mut user.hysteria2_password),
            ("tuic_password", &mut user.tuic_password),
        ];
        for (field, slot) in secrets {
            if slot.is_none() {
                *slot = Some(self.fresh_secret(field, taken)?);
                filled += 1;
            }
        }
        if user.tuic_uuid.is_none() {
            user.tuic_uuid = Some(self.fresh_uuid("tuic_uuid", taken)?);
            filled += 1;
        }
        Ok(filled)
    }

    /// A UUIDv4 not present in `taken`; recorded in `taken` on success.
    pub fn fresh_uuid(
        &self,
        field: &'static str,
        taken: &mut IdentifierIndex,
    ) -> Result<Uuid, ValidationError> {
        self.fresh(field, taken, Uuid::new_v4)
    }

    /// A protocol password not present in `taken`; recorded on success.
    pub fn fresh_secret(
        &self,
        field: &'static str,
        taken: &mut IdentifierIndex,
    ) -> Result<String, ValidationError> {
        self.fresh(field, taken, keys::generate_secret)
    }

    fn fresh_wireguard_keypair(
        &self,
        taken: &mut IdentifierIndex,
    ) -> Result<keys::KeyPair, ValidationError> {
        for _ in 0..self.max_attempts {
            let pair = keys::generate_wireguard_keypair();
            if !taken.contains_value(&pair.private_key) && !taken.contains_value(&pair.public_key) {
                taken.insert_value(&pair.private_key);
                taken.insert_value(&pair.public_key);
                return Ok(pair);
            }
        }
        Err(ValidationError::IdentifierSpace {
            field: "wireguard keypair",
            attempts: self.max_attempts,
        })
    }

    fn fresh<T: ToString>(
        &self,
        field: &'static str,
        taken: &mut IdentifierIndex,
        generate: impl Fn() -> T,
    ) -> Result<T, ValidationError> {
        for _ in 0..self.max_attempts {
            let candidate = generate();
            let rendered = candidate.to_string();
            if !taken.contains_value(&rendered) {
                taken.insert_value(&rendered);
                return Ok(candidate);
            }
        }
        Err(ValidationError::IdentifierSpace {
            field,
            attempts: self.max_attempts,
        })
    }

    /// Mint the deployment-wide secrets at first boot.
    pub fn server_config(&self, admin_password: &str) -> Result<ServerConfig, ValidationError> {
        if admin_password.len() < MIN_ADMIN_PASSWORD_LEN {
            return Err(ValidationError::TooShort {
                field: "admin password",
                min: MIN_ADMIN_PASSWORD_LEN,
            });
        }
        let wireguard = keys::generate_wireguard_keypair();
        Ok(ServerConfig {
            wireguard_server_private_key: wireguard.private_key,
            wireguard_server_public_key: wireguard.public_key,
            xray_private_key: keys::generate_reality_private_key(),
            admin_password_hash: keys::hash_password(admin_password)?,
            session_secret: keys::generate_session_secret(),
            obfuscated_endpoints: Default::default(),
            created_at: Some(timestamp_now()),
        })
    }

    /// Replace one server secret in place.
    pub fn rotate(&self, server: &mut ServerConfig, which: ServerSecret) {
        match which {
            ServerSecret::WireGuard => {
                let wireguard = keys::generate_wireguard_keypair();
                server.wireguard_server_private_key = wireguard.private_key;
                server.wireguard_server_public_key = wireguard.public_key;
            }
            ServerSecret::Xray => server.xray_private_key = keys::generate_reality_private_key(),
            ServerSecret::Session => server.session_secret = keys::generate_session_secret(),
        }
    }

    pub fn set_admin_password(
        &self,
        server: &mut ServerConfig,
        admin_password: &str,
    ) -> Result<(), ValidationError> {
        if admin_password.len() < MIN_ADMIN_PASSWORD_LEN {
            return Err(ValidationError::TooShort {
                field: "admin password",
                min: MIN_ADMIN_PASSWORD_LEN,
            });
        }
        server.admin_password_hash = keys::hash_password(admin_password)?;
        Ok(())
    }
}
