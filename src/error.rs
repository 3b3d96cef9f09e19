use thiserror::Error;

use crate::model::Revision;

/// Every failure the storage engine can surface.
///
/// The variants follow the wire-level error taxonomy of the service: each
/// maps to an `exception` kind string and an HTTP status so that the
/// transport layer can render `{"exception": ..., "message": ...}` without
/// inspecting variants itself.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Project not found: {0}")]
    ProjectNotFound(String),
    #[error("Project exists: {0}")]
    ProjectExists(String),
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),
    #[error("Repository exists: {0}")]
    RepositoryExists(String),
    #[error("Revision not found: {0}")]
    RevisionNotFound(Revision),
    #[error("Entry not found: {path} (revision {revision})")]
    EntryNotFound { revision: Revision, path: String },
    #[error("Entry has no content: {0}")]
    EntryNoContent(String),
    #[error("Change conflict: {0}")]
    ChangeConflict(String),
    #[error("Redundant change")]
    RedundantChange,
    #[error("Query execution failed: {0}")]
    QueryExecution(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Invalid parameter: {0}")]
    InvalidParams(&'static str),
    #[error("Repository is not writable: {0}")]
    ReadOnly(String),
    #[error("Mirror failure: {0}")]
    Mirror(String),
    #[error("Access denied: {0}")]
    Authorization(String),
    #[error("Too many requests")]
    TooManyRequests,
    #[error("Server is shutting down")]
    ShuttingDown,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Request timed out")]
    RequestTimeout,
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// The `exception` kind string used on the wire.
    pub fn exception_kind(&self) -> &'static str {
        match self {
            Error::ProjectNotFound(_) => "ProjectNotFoundException",
            Error::ProjectExists(_) => "ProjectExistsException",
            Error::RepositoryNotFound(_) => "RepositoryNotFoundException",
            Error::RepositoryExists(_) => "RepositoryExistsException",
            Error::RevisionNotFound(_) => "RevisionNotFoundException",
            Error::EntryNotFound { .. } => "EntryNotFoundException",
            Error::EntryNoContent(_) => "EntryNoContentException",
            Error::ChangeConflict(_) => "ChangeConflictException",
            Error::RedundantChange => "RedundantChangeException",
            Error::QueryExecution(_) => "QueryExecutionException",
            Error::InvalidPath(_) | Error::InvalidParams(_) => "IllegalArgumentException",
            Error::ReadOnly(_) => "ReadOnlyException",
            Error::Mirror(_) => "MirrorException",
            Error::Authorization(_) => "AuthorizationException",
            Error::TooManyRequests => "TooManyRequestsException",
            Error::ShuttingDown => "ShuttingDownException",
            Error::Cancelled => "CancellationException",
            Error::RequestTimeout => "RequestTimeoutException",
            Error::Storage(_) => "StorageException",
        }
    }

    /// The HTTP status the transport layer maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::ProjectNotFound(_)
            | Error::RepositoryNotFound(_)
            | Error::RevisionNotFound(_)
            | Error::EntryNotFound { .. } => 404,
            Error::ProjectExists(_)
            | Error::RepositoryExists(_)
            | Error::ChangeConflict(_)
            | Error::RedundantChange => 409,
            Error::EntryNoContent(_)
            | Error::QueryExecution(_)
            | Error::InvalidPath(_)
            | Error::InvalidParams(_) => 400,
            Error::Authorization(_) => 403,
            Error::TooManyRequests => 429,
            Error::RequestTimeout => 408,
            Error::Mirror(_) => 502,
            Error::Cancelled => 499,
            Error::ReadOnly(_) | Error::ShuttingDown => 503,
            Error::Storage(_) => 500,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Storage(e.to_string())
    }
}
