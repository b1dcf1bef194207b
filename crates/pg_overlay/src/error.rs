//! Typed error kinds surfaced by overlay setup.
//!
//! Engine failures stay as `tokio_postgres::Error` wrapped in `anyhow` context;
//! only the failures callers may want to match on get their own enums.

use thiserror::Error;

/// Invalid or missing connection option.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required option was absent or empty.
    #[error("missing required configuration option {key}")]
    Missing {
        /// Fully prefixed environment key, e.g. `LOWER_HOST`.
        key: String,
    },
    /// An option was present but could not be parsed.
    #[error("invalid value for configuration option {key}: {value:?} ({reason})")]
    Invalid {
        /// Fully prefixed environment key.
        key: String,
        /// Raw value as supplied.
        value: String,
        /// Parser message.
        reason: String,
    },
}

/// Failure to turn a SQL template and its bindings into executable text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubstitutionError {
    /// The template references a placeholder with no binding.
    #[error("template placeholder #{{{key}}} has no binding in: {template}")]
    MissingKey {
        /// Placeholder name.
        key: String,
        /// Offending template text.
        template: String,
    },
    /// A plain name or qualified-name segment is empty.
    #[error("binding {key} is an empty identifier")]
    EmptyIdentifier {
        /// Placeholder name.
        key: String,
    },
    /// A qualified name was bound with no segments.
    #[error("binding {key} is a qualified name with no segments")]
    EmptyQualifiedName {
        /// Placeholder name.
        key: String,
    },
    /// Identifier or literal text PostgreSQL cannot represent.
    #[error("binding {key} contains a NUL character")]
    NulCharacter {
        /// Placeholder name.
        key: String,
    },
}
