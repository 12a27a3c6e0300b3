//! Loader error types.

use std::any::Any;
use thiserror::Error;

use crate::cache::CacheError;
use crate::deferment::DeferError;
use crate::transport::TransportError;

/// Errors surfaced by the loader and its collaborators.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// The origin does not know the object
    #[error("object '{id}' not found")]
    NotFound { id: String },

    /// Fetching a specific object failed
    #[error("fetch failed for '{id}': {message}")]
    Fetch { id: String, message: String },

    /// The origin failed in a way not tied to one object
    #[error("origin error: {0}")]
    Origin(String),

    /// A deferred request was rejected
    #[error(transparent)]
    Deferment(#[from] DeferError),

    /// Cache backend failure
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Ring-buffer transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed object JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The loader was built without a root object id
    #[error("loader has no root object id")]
    NoRoot,

    /// The component was already disposed
    #[error("{0} already disposed")]
    Disposed(&'static str),

    /// Invalid construction options
    #[error("invalid loader configuration: {0}")]
    Config(String),
}

impl LoaderError {
    /// Create a NotFound error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Create a Fetch error.
    pub fn fetch(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Create an Origin error.
    pub fn origin(message: impl Into<String>) -> Self {
        Self::Origin(message.into())
    }

    /// Create a Config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Turn a panic payload into a loggable message.
///
/// Panics carry `&str` or `String` in practice; anything else is reported by
/// its absence of a message. Only used for reporting, never for control flow.
pub fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Describe a failed tokio task join.
pub(crate) fn describe_join_error(error: tokio::task::JoinError) -> String {
    if error.is_panic() {
        describe_panic(error.into_panic().as_ref())
    } else {
        error.to_string()
    }
}
