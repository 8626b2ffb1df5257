//! Blob metadata structures.

use std::{collections::HashMap, time::SystemTime};

use serde::{Deserialize, Serialize};

use crate::{BlobBody, Range};

/// Metadata about a stored blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobMetadata {
    /// Key within the bucket.
    pub key: String,

    /// Size in bytes.
    pub size_bytes: u64,

    /// ETag from the object store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    /// Content type / MIME type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<SystemTime>,

    /// User metadata attached when the blob was written.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Identifies a blob version produced by a write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobDescriptor {
    pub key: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Size in bytes, when the writer knows it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    /// SHA256 of the content, when the writer computed it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256_hash: Option<String>,
}

impl BlobDescriptor {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            etag: None,
            version: None,
            size_bytes: None,
            sha256_hash: None,
        }
    }
}

/// A part accepted by the backend during a multipart upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 1-based part number.
    pub part_number: u32,

    /// Backend-assigned identifier for the part.
    pub etag: String,

    pub size_bytes: u64,
}

/// Options for starting a multipart upload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeginOptions {
    /// Expected final object size, checked against the backend limit.
    #[serde(default)]
    pub size_hint: Option<u64>,

    /// Number of parts the caller will add. Commit requires all of them.
    #[serde(default)]
    pub expected_parts: Option<u32>,

    #[serde(default)]
    pub content_type: Option<String>,

    /// User metadata stored with the committed blob.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Listing request.
#[derive(Debug, Clone, Default)]
pub struct ListBlobsInput {
    pub prefix: Option<String>,

    /// Group keys sharing a prefix up to this delimiter.
    pub delimiter: Option<String>,

    pub max_keys: Option<usize>,
}

/// Listing result.
#[derive(Debug, Clone, Default)]
pub struct ListBlobsOutput {
    pub blobs: Vec<BlobMetadata>,
    pub prefixes: Vec<String>,
}

/// Result of a ranged or whole-blob GET.
#[derive(Debug)]
pub struct GetBlobOutput {
    pub metadata: BlobMetadata,
    pub body: BlobBody,
}

/// One range of a multi-range read, in request order.
#[derive(Debug)]
pub struct MultiRangePart {
    pub range: Range,
    pub content_type: String,
    pub body: BlobBody,
}
