//! Error types for query composition and federation.
//!
//! Errors are split in two families: request errors, which are always raised
//! before any backend is contacted, and backend errors, which abort the whole
//! federated request when a per-core search fails.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use thiserror::Error;

/// The primary error type for all federation operations.
#[derive(Error, Debug)]
pub enum FederationError {
    /// The request is malformed or references an unknown configuration.
    #[error(transparent)]
    InvalidRequest(#[from] RequestError),

    /// A per-core search failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl FederationError {
    /// Returns true if this error was caused by the caller's request.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, FederationError::InvalidRequest(_))
    }

    /// Returns true if this error was raised by a backend search.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, FederationError::Backend(_))
    }
}

/// Errors in the shape of a composed request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// `add_match` or `unite` was called with the wrong number of cores.
    #[error("expected {operation}(coreA=..., coreB=...) with exactly {expected} cores, got {count}")]
    MatchArity {
        operation: &'static str,
        expected: usize,
        count: usize,
    },

    /// No match declaration covers the given cores.
    #[error("no match set for cores: {cores:?}")]
    NoMatchForCores { cores: Vec<String> },

    /// Several cores are registered but no match was declared at all.
    #[error("no match set for cores")]
    NoMatchSet,

    /// The number of registered cores is out of range.
    #[error("unsupported number of cores ({count}), expected at most {max} and at least 1")]
    UnsupportedCoreCount { count: usize, max: usize },

    /// The results core was never set.
    #[error("core for results not specified, use results_from")]
    ResultsFromNotSet,

    /// A facet requested an ordering other than `count`.
    #[error("unsupported facet sortBy value: {value}")]
    UnsupportedFacetSort { value: String },

    /// A core is referenced for which no backend is registered.
    #[error("unknown core: {core}")]
    UnknownCore { core: String },

    /// The query text could not be parsed.
    #[error("failed to parse query: {message}")]
    QueryParse { message: String },

    /// A serialized composed query could not be decoded.
    #[error("invalid serialized composed query: {message}")]
    InvalidSerialized { message: String },
}

/// Errors raised while executing a per-core search.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend returned an error.
    #[error("search on core '{core}' failed: {message}")]
    SearchFailed {
        core: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The task running a sub-search did not complete.
    #[error("search task for core '{core}' did not complete: {message}")]
    TaskFailed { core: String, message: String },
}

impl BackendError {
    /// Creates a search failure without an underlying source.
    pub fn search_failed(core: impl Into<String>, message: impl Into<String>) -> Self {
        BackendError::SearchFailed {
            core: core.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Returns the core the failure originated from.
    pub fn core(&self) -> &str {
        match self {
            BackendError::SearchFailed { core, .. } | BackendError::TaskFailed { core, .. } => core,
        }
    }
}

/// Result type alias for federation operations.
pub type FederationResult<T> = Result<T, FederationError>;

/// Result type alias for request-shape checks.
pub type RequestResult<T> = Result<T, RequestError>;

impl From<serde_json::Error> for RequestError {
    fn from(err: serde_json::Error) -> Self {
        RequestError::InvalidSerialized {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for FederationError {
    fn from(err: serde_json::Error) -> Self {
        FederationError::InvalidRequest(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_arity_display() {
        let err = RequestError::MatchArity {
            operation: "add_match",
            expected: 2,
            count: 3,
        };
        assert_eq!(
            err.to_string(),
            "expected add_match(coreA=..., coreB=...) with exactly 2 cores, got 3"
        );
    }

    #[test]
    fn test_federation_error_classification() {
        let err: FederationError = RequestError::ResultsFromNotSet.into();
        assert!(err.is_invalid_request());
        assert!(!err.is_backend_failure());

        let err: FederationError = BackendError::search_failed("authors", "index closed").into();
        assert!(err.is_backend_failure());
        assert_eq!(err.to_string(), "search on core 'authors' failed: index closed");
    }

    #[test]
    fn test_backend_error_core() {
        let err = BackendError::TaskFailed {
            core: "articles".to_string(),
            message: "panicked".to_string(),
        };
        assert_eq!(err.core(), "articles");
    }

    #[test]
    fn test_serde_error_is_invalid_request() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: FederationError = err.into();
        assert!(matches!(
            err,
            FederationError::InvalidRequest(RequestError::InvalidSerialized { .. })
        ));
    }
}
