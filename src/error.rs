//! Error taxonomy shared by the remote adapter, the cache and mutations.

use thiserror::Error;

/// Failure reported by a catalog operation.
///
/// Errors travel over the broadcast bus, so the type is `Clone` and carries
/// rendered messages instead of source errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// Rejected locally before any request was made.
    #[error("invalid input: {0}")]
    Validation(String),
    /// Request failed or timed out before a response arrived.
    #[error("network error: {0}")]
    Network(String),
    /// The server does not know the addressed resource.
    #[error("not found: {0}")]
    NotFound(String),
    /// The server answered with a non-success status.
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },
    /// The response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),
    /// The local cache mirror could not be read or written.
    #[error("cache mirror error: {0}")]
    Persistence(String),
}

impl CatalogError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogError::NotFound(_))
    }
}

impl From<rusqlite::Error> for CatalogError {
    fn from(err: rusqlite::Error) -> Self {
        CatalogError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::Decode(err.to_string())
    }
}
