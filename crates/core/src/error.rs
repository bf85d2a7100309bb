//! Error kinds surfaced by the engine and the cluster layer.
//!
//! Errors are returned, never panicked across the public API. A failed
//! local write never silently succeeds; replication shortfalls are reported
//! as outcome values rather than errors because the local commit has
//! already happened by the time they are observed.

use thiserror::Error;

/// Result type alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for all engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Dimension mismatch, zero k, unknown shard id, duplicate node id, or
    /// an attempt to remove the current primary.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A named entity (id, node, shard) does not exist where one is
    /// required.
    #[error("not found: {0}")]
    NotFound(String),

    /// Insert of an id that is already present, with replacement disabled.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The index is at capacity and no tombstoned slot can be reused.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Snapshot with a wrong magic number, unsupported version, bad
    /// checksum, or truncated data.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Operation against a closed database or a stopped manager.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Underlying persistence failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_message() {
        let err = Error::InvalidArgument("k must be positive".into());
        assert_eq!(err.to_string(), "invalid argument: k must be positive");
        let err = Error::NotFound("id 7".into());
        assert!(err.to_string().starts_with("not found"));
    }

    #[test]
    fn test_io_error_converts() {
        fn read() -> Result<Vec<u8>> {
            Ok(std::fs::read("/nonexistent/quiver/path")?)
        }
        assert!(matches!(read(), Err(Error::Io(_))));
    }
}
