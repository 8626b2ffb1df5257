//! Error types for blob backend operations.

use std::fmt;

use crate::UploadState;

/// Result type for blob backend operations.
pub type BlobResult<T> = Result<T, BlobError>;

/// How a caller may react to a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// The same call may succeed if issued again unchanged.
    AsIs,
    /// The call can succeed only with different parameters or after the
    /// caller changes its own state (e.g. adds the missing parts).
    WithDifferentParameters,
    /// Retrying cannot help.
    Fatal,
}

/// Errors that can occur during blob backend operations.
#[derive(Debug)]
pub enum BlobError {
    /// The backend lacks a capability the operation needs.
    UnsupportedOperation {
        operation: &'static str,
        backend: String,
    },

    /// The requested ranges cannot be expressed within the backend's
    /// maximum number of ranges per request.
    PlanTooLarge { groups: usize, max_groups: usize },

    /// A read was requested with no ranges.
    EmptyRequest,

    /// A byte range is malformed or lies outside the blob.
    InvalidRange {
        start: u64,
        count: u64,
        reason: String,
    },

    /// Configuration or tuning parameter is out of bounds.
    InvalidConfig { reason: String },

    /// A multipart operation was attempted in an incompatible state.
    UploadStateConflict {
        upload_id: String,
        state: UploadState,
        operation: &'static str,
    },

    /// No multipart upload with this id is known.
    UploadNotFound { upload_id: String },

    /// Commit was requested while parts are missing.
    MissingParts {
        upload_id: String,
        missing: Vec<u32>,
    },

    /// Commit was requested while part uploads are still running.
    PartsInFlight { upload_id: String, in_flight: usize },

    /// The object exceeds the backend's multipart size limit.
    ObjectTooLarge { size: u64, max: u64 },

    /// A part number is outside the backend's accepted bounds.
    InvalidPart { part_number: u32, reason: String },

    /// Blob not found at the specified key.
    NotFound { key: String },

    /// The operation was cancelled by the caller.
    Cancelled,

    /// I/O error during blob operation.
    IoError { source: std::io::Error },

    /// Transport or authorization error reported by the backend.
    Backend { source: anyhow::Error },
}

impl BlobError {
    pub fn unsupported(operation: &'static str, backend: impl Into<String>) -> Self {
        BlobError::UnsupportedOperation {
            operation,
            backend: backend.into(),
        }
    }

    pub fn invalid_range(start: u64, count: u64, reason: impl Into<String>) -> Self {
        BlobError::InvalidRange {
            start,
            count,
            reason: reason.into(),
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, BlobError::UnsupportedOperation { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound { .. })
    }

    /// Classify the error for the caller's retry decision.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            BlobError::Backend { .. } | BlobError::IoError { .. } | BlobError::Cancelled => {
                RetryClass::AsIs
            }
            BlobError::PlanTooLarge { .. } |
            BlobError::PartsInFlight { .. } |
            BlobError::MissingParts { .. } => RetryClass::WithDifferentParameters,
            _ => RetryClass::Fatal,
        }
    }
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::UnsupportedOperation { operation, backend } => {
                write!(f, "Operation '{}' not supported by backend {}", operation, backend)
            }
            BlobError::PlanTooLarge { groups, max_groups } => write!(
                f,
                "Range plan needs {} requests, backend allows {}",
                groups, max_groups
            ),
            BlobError::EmptyRequest => write!(f, "Read request contains no ranges"),
            BlobError::InvalidRange {
                start,
                count,
                reason,
            } => write!(f, "Invalid range [{}, +{}): {}", start, count, reason),
            BlobError::InvalidConfig { reason } => write!(f, "Invalid configuration: {}", reason),
            BlobError::UploadStateConflict {
                upload_id,
                state,
                operation,
            } => write!(
                f,
                "Cannot {} multipart upload {} in state {}",
                operation, upload_id, state
            ),
            BlobError::UploadNotFound { upload_id } => {
                write!(f, "Multipart upload not found: {}", upload_id)
            }
            BlobError::MissingParts { upload_id, missing } => write!(
                f,
                "Multipart upload {} is missing parts {:?}",
                upload_id, missing
            ),
            BlobError::PartsInFlight {
                upload_id,
                in_flight,
            } => write!(
                f,
                "Multipart upload {} still has {} parts in flight",
                upload_id, in_flight
            ),
            BlobError::ObjectTooLarge { size, max } => write!(
                f,
                "Object size {} exceeds multipart limit {}",
                size, max
            ),
            BlobError::InvalidPart {
                part_number,
                reason,
            } => write!(f, "Invalid part {}: {}", part_number, reason),
            BlobError::NotFound { key } => write!(f, "Blob not found: {}", key),
            BlobError::Cancelled => write!(f, "Operation cancelled"),
            BlobError::IoError { source } => write!(f, "I/O error: {}", source),
            BlobError::Backend { source } => write!(f, "Backend error: {}", source),
        }
    }
}

impl std::error::Error for BlobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BlobError::IoError { source } => Some(source),
            BlobError::Backend { source } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        BlobError::IoError { source: err }
    }
}

impl From<anyhow::Error> for BlobError {
    fn from(err: anyhow::Error) -> Self {
        BlobError::Backend { source: err }
    }
}

impl From<object_store::Error> for BlobError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => BlobError::NotFound { key: path },
            object_store::Error::NotSupported { .. } | object_store::Error::NotImplemented => {
                BlobError::UnsupportedOperation {
                    operation: "object_store",
                    backend: err.to_string(),
                }
            }
            _ => BlobError::Backend {
                source: anyhow::Error::from(err),
            },
        }
    }
}

impl From<figment::Error> for BlobError {
    fn from(err: figment::Error) -> Self {
        BlobError::InvalidConfig {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_class() {
        assert_eq!(BlobError::Cancelled.retry_class(), RetryClass::AsIs);
        assert_eq!(
            BlobError::PlanTooLarge {
                groups: 4,
                max_groups: 2
            }
            .retry_class(),
            RetryClass::WithDifferentParameters
        );
        assert_eq!(BlobError::EmptyRequest.retry_class(), RetryClass::Fatal);
        assert_eq!(
            BlobError::unsupported("get_blob_multi_range", "wasb").retry_class(),
            RetryClass::Fatal
        );
    }

    #[test]
    fn test_not_found_from_object_store() {
        let err = object_store::Error::NotFound {
            path: "a/b".to_string(),
            source: "missing".into(),
        };
        let err = BlobError::from(err);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Blob not found: a/b");
    }
}
