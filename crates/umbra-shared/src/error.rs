use thiserror::Error;

/// Input or record shape violations.
///
/// Always recoverable: nothing is persisted when one of these is returned,
/// and the caller fixes the input and retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid username '{0}': must be 3-32 characters of letters, digits, '_' or '-'")]
    InvalidUsername(String),

    #[error("User '{0}' already exists")]
    UsernameTaken(String),

    #[error("Record key '{key}' does not match username '{username}'")]
    UsernameMismatch { key: String, username: String },

    #[error("Invalid {field}: '{value}' is not a version 4 UUID")]
    InvalidUuid { field: &'static str, value: String },

    #[error("{field} must be at least {min} characters")]
    TooShort { field: &'static str, min: usize },

    #[error("{0} cannot be empty")]
    Empty(&'static str),

    #[error("Invalid {field}: {reason}")]
    InvalidKey { field: &'static str, reason: String },

    #[error("{0} public key does not match its private key")]
    KeyPairMismatch(&'static str),

    #[error("Invalid {field} timestamp: '{value}'")]
    InvalidTimestamp { field: &'static str, value: String },

    #[error("{field} is shared with another record")]
    Duplicate { field: &'static str },

    #[error("Could not generate a unique {field} after {attempts} attempts")]
    IdentifierSpace { field: &'static str, attempts: usize },

    #[error("Server configuration is already initialized")]
    ServerAlreadyInitialized,

    #[error("Invalid {kind} name '{name}'")]
    InvalidName { kind: &'static str, name: String },

    #[error("Password hashing failed: {0}")]
    PasswordHash(String),
}
