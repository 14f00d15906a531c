//! Shared library for the twin services.
//!
//! This crate provides the settings layer (environment, `.env` and the remote secret
//! bundle) and the lazily-opened MongoDB client used by the binaries.

pub mod config;
pub mod db;
pub mod error;
pub mod secrets;

pub use config::{token_window_for, ExportOutcome, LoadOutcome, Settings, SETTINGS_SECRET_NAME};
pub use db::{redact_uri, ConnectionState, Connector, LazyConnection, MongoConnection, MongoConnector};
pub use error::{Error, Result};
pub use secrets::{AwsSecretStore, InMemorySecretStore, SecretBundle, SecretStore, SecretStoreError};
