//! Error types for the host layer

use weft_repo::RepoError;

/// Result type alias for host operations
pub type Result<T> = std::result::Result<T, HostError>;

/// Errors surfaced by the host layer and wire methods
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum HostError {
    /// No repo stored for the requested DID or handle
    #[error("Repo not found: {0}")]
    RepoNotFound(String),

    /// The repo exists but has been tombstoned
    #[error("Repo deactivated: {0}")]
    #[diagnostic(help("tombstoned repos refuse reads of content beyond their status"))]
    RepoDeactivated(String),

    /// A requested block is not in the store
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    /// A subscribe cursor beyond the current sequence number
    #[error("Cursor {cursor} is past our current sequence number {last_seq}")]
    FutureCursor {
        /// The requested cursor
        cursor: i64,
        /// The stream's last allocated seq
        last_seq: i64,
    },

    /// Repository-engine error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Repo(#[from] RepoError),
}
