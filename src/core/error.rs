//! ST-002: Expansion error taxonomy.
//!
//! Every failure aborts the whole expansion. There is no partial output and
//! no retry: the error propagates unchanged to the caller.

use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, ExpandError>;

/// An expansion failure.
#[derive(Error, Debug)]
pub enum ExpandError {
    /// A symbolic reference names an id, kind or selector that does not exist.
    #[error("unknown reference '{reference}': {reason}")]
    UnknownReference { reference: String, reason: String },

    /// A shorthand declaration has a shape the expander does not accept.
    #[error("malformed {context}: {message}")]
    Malformed { context: String, message: String },

    /// Same-stage pipeline actions depend on each other.
    #[error("circular dependency in stage '{stage}': {}", chain.join(" -> "))]
    CircularDependency { stage: String, chain: Vec<String> },

    /// A generated logical id collides with one already in the template.
    #[error("duplicate logical id '{0}'")]
    DuplicateLogicalId(String),

    /// An ambient parameter is missing or unusable.
    #[error("parameter error: {0}")]
    Parameter(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl ExpandError {
    pub fn unknown(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnknownReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            context: context.into(),
            message: message.into(),
        }
    }
}
