use serde::Serialize;
use thiserror::Error;

use crate::{ENGINE_NAME, ENGINE_VERSION};

/// Geolocation database error kinds.
///
/// The numeric codes are part of the error ABI surfaced through
/// [`ErrContext::code`] and must not be renumbered.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbError {
    /// The database holds no record for the queried address.
    #[error("db_enoent")]
    NoEntry,

    /// The record exists but the expected field is absent or has an
    /// unexpected type.
    #[error("db_enodatafortype")]
    NoDataForType,
}

impl DbError {
    /// Stable numeric code for this kind.
    pub fn code(self) -> i64 {
        match self {
            DbError::NoEntry => 1,
            DbError::NoDataForType => 2,
        }
    }
}

/// Context describing a failure reported by an upstream library.
///
/// Serialized verbatim as the `library_error_context` field of
/// `failure.*` events.
#[derive(Debug, Clone, Serialize)]
pub struct ErrContext {
    /// Library-specific numeric code. Initialized to 1 so that an
    /// uninitialized context is never mistaken for success.
    pub code: i64,
    /// Name of the library that produced the failure.
    pub library_name: String,
    /// Version of that library, when known.
    pub library_version: String,
    /// Human-readable reason.
    pub reason: String,
}

impl Default for ErrContext {
    fn default() -> Self {
        Self {
            code: 1,
            library_name: String::new(),
            library_version: String::new(),
            reason: String::new(),
        }
    }
}

impl ErrContext {
    /// Failure inside the HTTP transport. `code` carries the HTTP status
    /// when one was received, 1 otherwise.
    pub fn transport(code: i64, reason: impl Into<String>) -> Self {
        Self {
            code,
            library_name: "reqwest".to_string(),
            library_version: String::new(),
            reason: reason.into(),
        }
    }

    /// Failure serializing or parsing JSON.
    pub fn json(err: &serde_json::Error) -> Self {
        Self {
            code: 1,
            library_name: "serde_json".to_string(),
            library_version: String::new(),
            reason: err.to_string(),
        }
    }

    /// Failure resolving a hostname through the system resolver.
    pub fn resolver(err: &std::io::Error) -> Self {
        Self {
            code: err.raw_os_error().map_or(1, i64::from),
            library_name: "tokio/lookup_host".to_string(),
            library_version: String::new(),
            reason: err.to_string(),
        }
    }

    /// Failure reported by the geolocation database reader.
    pub fn maxminddb(reason: impl Into<String>) -> Self {
        Self {
            code: 1,
            library_name: "maxminddb".to_string(),
            library_version: String::new(),
            reason: reason.into(),
        }
    }

    /// Engine-level geolocation error kind.
    pub fn db(kind: DbError) -> Self {
        Self {
            code: kind.code(),
            library_name: ENGINE_NAME.to_string(),
            library_version: ENGINE_VERSION.to_string(),
            reason: kind.to_string(),
        }
    }

    /// Engine-level failure with a free-form reason.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self {
            code: 1,
            library_name: ENGINE_NAME.to_string(),
            library_version: ENGINE_VERSION.to_string(),
            reason: reason.into(),
        }
    }
}
