//! Error types for the gray rollout engine.
//!
//! Configuration problems are reported at load time. Request-time failures
//! never fail the request; they are logged and the gateway passes traffic
//! through.

use thiserror::Error;

/// Errors raised while loading a configuration document.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO errors reading a configuration file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON or a document that does not fit the schema
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A deployment without a version string
    #[error("deployment '{0}' has no version")]
    MissingVersion(String),

    /// Two deployments share a version
    #[error("duplicate deployment version '{0}'")]
    DuplicateVersion(String),

    /// A condition that cannot be evaluated
    #[error("invalid condition on deployment '{deployment}': {reason}")]
    InvalidCondition { deployment: String, reason: String },

    /// `userStickyMaxAge` is not a number of seconds
    #[error("invalid userStickyMaxAge '{0}'")]
    InvalidMaxAge(String),

    /// Rule mode is active but no base deployment is configured
    #[error("rule matching requires a baseDeployment")]
    MissingBase,
}

/// Errors from the not-found fallback fetch.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid fallback request: {0}")]
    Request(String),

    #[error("fallback transport error: {0}")]
    Transport(String),

    #[error("fallback body error: {0}")]
    Body(String),
}

/// A header mutation the host refused to apply.
#[derive(Error, Debug)]
#[error("cannot apply header '{name}': {reason}")]
pub struct HeaderError {
    pub name: String,
    pub reason: String,
}

impl HeaderError {
    pub fn new(name: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}
