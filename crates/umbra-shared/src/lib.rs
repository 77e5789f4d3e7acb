//! # umbra-shared
//!
//! Data model and credential generation shared by the Umbra admin tooling.
//!
//! The crate does no I/O.  It defines the persisted
//! [`User`] and [`ServerConfig`] records, the validation rules they must
//! satisfy, and the [`CredentialFactory`] that mints per-protocol secrets for
//! new users.  Persistence lives in `umbra-store`.

pub mod constants;
pub mod credentials;
pub mod error;
pub mod keys;
pub mod types;

pub use credentials::{CredentialFactory, IdentifierIndex};
pub use error::ValidationError;
pub use types::{timestamp_now, ServerConfig, ServerSecret, User};
