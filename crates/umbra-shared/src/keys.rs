use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{SECRET_BYTES, X25519_KEY_SIZE};
use crate::error::ValidationError;

/// A Curve25519 keypair, both halves base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

// Same clamping `wg genkey` applies
fn clamp(scalar: &mut [u8; X25519_KEY_SIZE]) {
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
}

/// Generate a WireGuard keypair in the exact encoding of `wg genkey` /
/// `wg pubkey` (standard base64 with padding, 44 characters).
pub fn generate_wireguard_keypair() -> KeyPair {
    let mut scalar = random_bytes::<X25519_KEY_SIZE>();
    clamp(&mut scalar);
    let secret = StaticSecret::from(scalar);
    let public = PublicKey::from(&secret);
    KeyPair {
        private_key: STANDARD.encode(secret.to_bytes()),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

/// Derive the WireGuard public key for a base64-encoded private key.
pub fn wireguard_public_key(
    field: &'static str,
    private_key: &str,
) -> Result<String, ValidationError> {
    let scalar = decode_key(field, private_key, &STANDARD)?;
    let public = PublicKey::from(&StaticSecret::from(scalar));
    Ok(STANDARD.encode(public.as_bytes()))
}

/// Check that `public_key` is the key derived from `private_key`.
pub fn verify_wireguard_pair(
    label: &'static str,
    private_key: &str,
    public_key: &str,
) -> Result<(), ValidationError> {
    decode_key(label, public_key, &STANDARD)?;
    let derived = wireguard_public_key(label, private_key)?;
    if derived != public_key {
        return Err(ValidationError::KeyPairMismatch(label));
    }
    Ok(())
}

/// Xray REALITY private key: raw x25519 scalar, URL-safe base64 without
/// padding (what `xray x25519` prints).
pub fn generate_reality_private_key() -> String {
    let mut scalar = random_bytes::<X25519_KEY_SIZE>();
    clamp(&mut scalar);
    URL_SAFE_NO_PAD.encode(scalar)
}

/// A protocol password: 32 random bytes, URL-safe base64 without padding.
pub fn generate_secret() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes::<SECRET_BYTES>())
}

/// Session signing secret for the admin UI (hex, 64 characters).
pub fn generate_session_secret() -> String {
    hex::encode(random_bytes::<SECRET_BYTES>())
}

fn decode_key<E: Engine>(
    field: &'static str,
    value: &str,
    engine: &E,
) -> Result<[u8; X25519_KEY_SIZE], ValidationError> {
    let bytes = engine
        .decode(value.trim())
        .map_err(|e| ValidationError::InvalidKey {
            field,
            reason: e.to_string(),
        })?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| ValidationError::InvalidKey {
            field,
            reason: format!("expected {X25519_KEY_SIZE} bytes, got {}", b.len()),
        })
}

/// Decode a key encoded with standard base64 into its 32 raw bytes.
pub fn decode_standard_key(
    field: &'static str,
    value: &str,
) -> Result<[u8; X25519_KEY_SIZE], ValidationError> {
    decode_key(field, value, &STANDARD)
}

/// Hash an admin password with Argon2id. Returns a PHC-format string.
pub fn hash_password(password: &str) -> Result<String, ValidationError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ValidationError::PasswordHash(e.to_string()))
}

/// Verify a password against a PHC-format hash string.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, ValidationError> {
    let parsed = PasswordHash::new(hash).map_err(|e| ValidationError::PasswordHash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
