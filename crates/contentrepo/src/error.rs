use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Resource id already exists: {id}")]
    DuplicateId { id: String },

    #[error("Resource path already exists: {path}")]
    DuplicatePath { path: String },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Index slot {slot} is full")]
    IndexFull { slot: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Closed: {0}")]
    Closed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Wraps an I/O failure on `path` with the action that was attempted.
pub(crate) fn file_error(action: &str, path: &Path, error: std::io::Error) -> RepositoryError {
    RepositoryError::Internal(format!("failed to {action} {}: {error}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};
    use std::path::PathBuf;

    #[test]
    fn io_error_conversion() {
        let error: RepositoryError = IoError::new(ErrorKind::NotFound, "gone").into();
        assert!(matches!(error, RepositoryError::Io(_)));
        assert!(error.to_string().contains("IO error"));
    }

    #[test]
    fn structural_conflicts_display() {
        let error = RepositoryError::DuplicateId {
            id: "4bb19980-8f98-4873-a813-000000000001".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Resource id already exists: 4bb19980-8f98-4873-a813-000000000001"
        );

        let error = RepositoryError::DuplicatePath {
            path: "/news".to_string(),
        };
        assert_eq!(error.to_string(), "Resource path already exists: /news");
    }

    #[test]
    fn file_error_includes_path() {
        let error = file_error(
            "open index file",
            &PathBuf::from("/tmp/id.idx"),
            IoError::new(ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(
            error.to_string(),
            "Internal error: failed to open index file /tmp/id.idx: denied"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RepositoryError>();
    }
}
