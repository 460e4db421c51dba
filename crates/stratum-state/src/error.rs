//! Error types for stratum-state

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the state persistence layer
#[derive(Error, Debug)]
pub enum StateError {
    /// Reading or writing the backing file failed
    #[error("state io failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error
    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The state document was written by an incompatible version
    #[error("unsupported state format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_names_path() {
        let err = StateError::io(
            "/tmp/state.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/state.json"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_unsupported_version_display() {
        let err = StateError::UnsupportedVersion {
            found: 9,
            expected: 1,
        };
        assert!(err.to_string().contains("version 9"));
    }
}
