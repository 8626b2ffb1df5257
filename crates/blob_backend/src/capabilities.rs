//! Static per-backend capability descriptors.

use serde::{Deserialize, Serialize};

use crate::{BlobError, BlobResult};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// What a backend supports and the limits it enforces.
///
/// Built once when a backend is constructed and shared read-only by every
/// operation against it. The planner, executor and multipart coordinator
/// branch on this value only, never on the concrete backend type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Backend identifier.
    pub name: String,

    /// Native multi-range GET in one round trip.
    pub supports_multi_range: bool,

    /// Multipart parts must be added strictly one after another.
    pub no_parallel_multipart: bool,

    /// Largest object the backend accepts through a multipart upload.
    /// Zero means the backend has no multipart support.
    pub max_multipart_size: u64,

    /// Highest part number accepted in one multipart upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parts: Option<u32>,

    /// Maximum number of ranges in one multi-range request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ranges_per_request: Option<usize>,

    /// Maximum byte span a single widened request may cover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_request_span: Option<u64>,
}

impl Capabilities {
    pub fn s3() -> Self {
        Self {
            name: "s3".to_string(),
            supports_multi_range: true,
            no_parallel_multipart: false,
            max_multipart_size: 5 * GIB,
            max_parts: Some(10_000),
            max_ranges_per_request: None,
            max_request_span: None,
        }
    }

    pub fn gcs() -> Self {
        Self {
            name: "gcs".to_string(),
            supports_multi_range: true,
            no_parallel_multipart: true,
            max_multipart_size: 5 * GIB,
            max_parts: Some(10_000),
            max_ranges_per_request: None,
            max_request_span: None,
        }
    }

    pub fn azure_blob() -> Self {
        Self {
            name: "wasb".to_string(),
            supports_multi_range: false,
            no_parallel_multipart: false,
            max_multipart_size: 100 * MIB,
            max_parts: Some(50_000),
            max_ranges_per_request: None,
            max_request_span: None,
        }
    }

    pub fn local_file() -> Self {
        Self {
            name: "file".to_string(),
            supports_multi_range: false,
            no_parallel_multipart: true,
            max_multipart_size: 0,
            max_parts: None,
            max_ranges_per_request: None,
            max_request_span: None,
        }
    }

    /// In-process backend; every limit is open unless overridden.
    pub fn memory(supports_multi_range: bool) -> Self {
        Self {
            name: "memory".to_string(),
            supports_multi_range,
            no_parallel_multipart: false,
            max_multipart_size: u64::MAX,
            max_parts: None,
            max_ranges_per_request: None,
            max_request_span: None,
        }
    }

    pub fn supports_multipart(&self) -> bool {
        self.max_multipart_size > 0
    }
}

/// The closed set of backend flavours this crate knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    S3,
    Gcs,
    AzureBlob,
    LocalFile,
    Memory,
}

impl BackendKind {
    /// Resolve a backend flavour from a URL scheme.
    pub fn from_scheme(scheme: &str) -> BlobResult<Self> {
        match scheme {
            "s3" | "s3a" => Ok(BackendKind::S3),
            "gs" | "gcs" => Ok(BackendKind::Gcs),
            "az" | "azure" | "abfs" | "abfss" | "wasb" | "wasbs" => Ok(BackendKind::AzureBlob),
            "file" => Ok(BackendKind::LocalFile),
            "memory" => Ok(BackendKind::Memory),
            other => Err(BlobError::unsupported("connect", other)),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            BackendKind::S3 => Capabilities::s3(),
            BackendKind::Gcs => Capabilities::gcs(),
            BackendKind::AzureBlob => Capabilities::azure_blob(),
            BackendKind::LocalFile => Capabilities::local_file(),
            BackendKind::Memory => Capabilities::memory(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_supports_multi_range() {
        let caps = BackendKind::S3.capabilities();
        assert!(caps.supports_multi_range);
        assert!(!caps.no_parallel_multipart);
        assert_eq!(caps.max_multipart_size, 5 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_gcs_serializes_multipart() {
        let caps = BackendKind::Gcs.capabilities();
        assert_eq!(caps.name, "gcs");
        assert!(caps.supports_multi_range);
        assert!(caps.no_parallel_multipart);
    }

    #[test]
    fn test_azure_has_no_multi_range() {
        let caps = BackendKind::from_scheme("az").unwrap().capabilities();
        assert_eq!(caps.name, "wasb");
        assert!(!caps.supports_multi_range);
        assert_eq!(caps.max_multipart_size, 100 * 1024 * 1024);
    }

    #[test]
    fn test_unknown_scheme() {
        let err = BackendKind::from_scheme("ftp").unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_local_file_has_no_multipart() {
        assert!(!Capabilities::local_file().supports_multipart());
        assert!(Capabilities::memory(false).supports_multipart());
    }
}
