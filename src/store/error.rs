use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} exists and is not a directory")]
    NotADirectory(String),

    #[error("Hashing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub(crate) fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            op,
            path: path.display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_names_operation_and_path() {
        let e = StoreError::io(
            "remove",
            Path::new("/tmp/x.jpg"),
            std::io::Error::other("busy"),
        );
        assert_eq!(e.to_string(), "Failed to remove /tmp/x.jpg: busy");
    }
}
