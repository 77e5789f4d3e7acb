/// Application name
pub const APP_NAME: &str = "Umbra";

/// Username length bounds (inclusive)
pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 32;

/// Minimum length of any per-user protocol password
pub const MIN_SECRET_LEN: usize = 16;

/// Minimum length of encoded key material (WireGuard, Xray, session secret)
pub const MIN_KEY_LEN: usize = 32;

/// Random bytes drawn for every generated secret and private key
pub const SECRET_BYTES: usize = 32;

/// Curve25519 key size in bytes
pub const X25519_KEY_SIZE: usize = 32;

/// Minimum admin password length accepted by `initialize_server`
pub const MIN_ADMIN_PASSWORD_LEN: usize = 8;

/// How many times the factory redraws a value that collides with an
/// existing identifier before giving up
pub const MAX_GENERATION_ATTEMPTS: usize = 16;
