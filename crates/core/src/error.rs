//! Error types for the livedata core.

use crate::value::DocumentId;
use thiserror::Error;

/// Result type alias for livedata operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types shared by every livedata crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Internal bookkeeping desynchronized. Never repaired silently.
    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },
    /// Client input or a trigger object that cannot be interpreted.
    #[error("malformed input: {message}")]
    MalformedInput { message: String },
    /// Selector could not be compiled.
    #[error("invalid selector: {message}")]
    InvalidSelector { message: String },
    /// Update modifier could not be applied.
    #[error("invalid modifier: {message}")]
    InvalidModifier { message: String },
    /// Sort specifier could not be compiled.
    #[error("invalid sort specifier: {message}")]
    InvalidSort { message: String },
    /// Field projection could not be compiled.
    #[error("invalid projection: {message}")]
    InvalidProjection { message: String },
    /// Insert of an id that already exists.
    #[error("duplicate id {id} in collection {collection}")]
    DuplicateId { collection: String, id: DocumentId },
    /// Document not found.
    #[error("document {id} not found in collection {collection}")]
    NotFound { collection: String, id: DocumentId },
    /// Backing store failure.
    #[error("store error: {message}")]
    Store { message: String, transient: bool },
    /// Write fence misuse.
    #[error("write fence: {message}")]
    Fence { message: String },
    /// Operation on a stopped handle, driver or session.
    #[error("{what} is stopped")]
    Stopped { what: String },
    /// No method registered under this name.
    #[error("method '{name}' not found")]
    MethodNotFound { name: String },
    /// No publication registered under this name.
    #[error("subscription '{name}' not found")]
    PublicationNotFound { name: String },
    /// Error raised deliberately by application code, forwarded to the client.
    #[error("{reason} [{error}]")]
    Client { error: String, reason: String },
    /// JSON encoding or decoding failed.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Creates an invariant violation error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Error::InvariantViolation {
            message: message.into(),
        }
    }

    /// Creates a malformed input error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedInput {
            message: message.into(),
        }
    }

    /// Creates an invalid selector error.
    pub fn invalid_selector(message: impl Into<String>) -> Self {
        Error::InvalidSelector {
            message: message.into(),
        }
    }

    /// Creates an invalid modifier error.
    pub fn invalid_modifier(message: impl Into<String>) -> Self {
        Error::InvalidModifier {
            message: message.into(),
        }
    }

    /// Creates an invalid sort error.
    pub fn invalid_sort(message: impl Into<String>) -> Self {
        Error::InvalidSort {
            message: message.into(),
        }
    }

    /// Creates an invalid projection error.
    pub fn invalid_projection(message: impl Into<String>) -> Self {
        Error::InvalidProjection {
            message: message.into(),
        }
    }

    /// Creates a duplicate id error.
    pub fn duplicate_id(collection: impl Into<String>, id: DocumentId) -> Self {
        Error::DuplicateId {
            collection: collection.into(),
            id,
        }
    }

    /// Creates a not found error.
    pub fn not_found(collection: impl Into<String>, id: DocumentId) -> Self {
        Error::NotFound {
            collection: collection.into(),
            id,
        }
    }

    /// Creates a permanent store error.
    pub fn store(message: impl Into<String>) -> Self {
        Error::Store {
            message: message.into(),
            transient: false,
        }
    }

    /// Creates a retryable store error (timeouts, dropped connections).
    pub fn transient_store(message: impl Into<String>) -> Self {
        Error::Store {
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a write fence error.
    pub fn fence(message: impl Into<String>) -> Self {
        Error::Fence {
            message: message.into(),
        }
    }

    /// Creates a stopped error.
    pub fn stopped(what: impl Into<String>) -> Self {
        Error::Stopped { what: what.into() }
    }

    /// Creates an application error that is shown to the client as is.
    pub fn client(error: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Client {
            error: error.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store { transient: true, .. })
    }

    /// Returns true for errors that indicate an internal bug.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::InvariantViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found("docs", DocumentId::from("abc"));
        assert_eq!(err.to_string(), "document abc not found in collection docs");

        let err = Error::invariant("changed for unpublished id");
        assert_eq!(
            err.to_string(),
            "invariant violation: changed for unpublished id"
        );
    }

    #[test]
    fn test_error_transient() {
        assert!(Error::transient_store("timeout").is_transient());
        assert!(!Error::store("bad query").is_transient());
        assert!(!Error::fence("fired").is_transient());
    }

    #[test]
    fn test_error_from_json() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
