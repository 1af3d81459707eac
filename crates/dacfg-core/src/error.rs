//! Error taxonomy surfaced by the [`Client`](crate::Client).
//!
//! | Variant                          | Kind        | Retry?                     |
//! |----------------------------------|-------------|----------------------------|
//! | `SchemaNotFound`, `SchemaSyntax` | fatal       | no – client is not built   |
//! | `UnknownKey`, `TypeMismatch`     | caller bug  | no                         |
//! | `BackendWrite`                   | operational | at the caller's discretion |
//! | `BackendRead`, `CorruptValue`    | operational | after repairing the store  |
//!
//! Read failures that merely mean "nothing stored yet" never reach the
//! caller: they degrade to the schema default inside the client.

use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendError;
use crate::codec::MarshalError;
use crate::domain::schema::{schema_location, KeyPath, SchemaError};
use crate::domain::value::ValueType;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The schema source could not be read.
    #[error("schema not found at {path}: {source}")]
    SchemaNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The schema source is malformed.
    #[error("schema syntax error{}: {reason}", schema_location(.group, .key))]
    SchemaSyntax {
        group: Option<String>,
        key: Option<String>,
        reason: String,
    },

    /// The (group, key) pair is not declared in the schema.
    #[error("unknown configuration key {group}/{key}")]
    UnknownKey { group: String, key: String },

    /// A value or accessor does not agree with the declared type.
    #[error("type mismatch for {group}/{key}: declared {expected}, got {found}")]
    TypeMismatch {
        group: String,
        key: String,
        expected: ValueType,
        found: String,
    },

    /// Persisting to the backend failed.  `path` is `None` for whole-store
    /// operations such as `reset`.
    #[error("failed to write{}: {source}", key_location(.path))]
    BackendWrite {
        path: Option<KeyPath>,
        #[source]
        source: BackendError,
    },

    /// The backend store is unreadable in a way that is not "no value yet".
    #[error("failed to read{}: {source}", key_location(.path))]
    BackendRead {
        path: Option<KeyPath>,
        #[source]
        source: BackendError,
    },

    /// A stored override cannot be decoded as the declared type.
    #[error("stored value for {path} is corrupt ({raw:?}): {reason}")]
    CorruptValue {
        path: KeyPath,
        raw: String,
        reason: String,
    },

    /// Change notification was requested on a client built without an
    /// event loop.
    #[error("change notification requires an event loop")]
    NoEventLoop,
}

fn key_location(path: &Option<KeyPath>) -> String {
    path.as_ref().map(|p| format!(" {p}")).unwrap_or_default()
}

impl ConfigError {
    /// `true` for programming errors (schema, unknown key, type mismatch)
    /// that must never be retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ConfigError::SchemaNotFound { .. }
                | ConfigError::SchemaSyntax { .. }
                | ConfigError::UnknownKey { .. }
                | ConfigError::TypeMismatch { .. }
        )
    }

    pub(crate) fn mismatch(path: &KeyPath, err: MarshalError) -> Self {
        match err {
            MarshalError::TypeMismatch { expected, found } => ConfigError::TypeMismatch {
                group: path.group.clone(),
                key: path.key.clone(),
                expected,
                found,
            },
            MarshalError::Malformed { raw, reason, .. } => ConfigError::CorruptValue {
                path: path.clone(),
                raw,
                reason,
            },
        }
    }
}

impl From<SchemaError> for ConfigError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::NotFound { path, source } => ConfigError::SchemaNotFound { path, source },
            SchemaError::Syntax { group, key, reason } => {
                ConfigError::SchemaSyntax { group, key, reason }
            }
            SchemaError::UnknownKey { group, key } => ConfigError::UnknownKey { group, key },
        }
    }
}
