//! Core storage backend trait.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    BeginOptions,
    BlobDescriptor,
    BlobError,
    BlobMetadata,
    BlobResult,
    Capabilities,
    GetBlobOutput,
    ListBlobsInput,
    ListBlobsOutput,
    MultiRangePart,
    PartDescriptor,
    Range,
};

/// Operations every cloud provider adapter implements.
///
/// The planner, executor and multipart coordinator only ever talk to a
/// backend through this trait. Keys are relative to the bucket the backend
/// was constructed for.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Immutable capability descriptor for this backend.
    fn capabilities(&self) -> &Capabilities;

    /// Bucket (or container) this backend operates on.
    fn bucket(&self) -> &str;

    /// Get blob metadata without downloading content.
    ///
    /// Returns `BlobError::NotFound` if the blob doesn't exist.
    async fn head_blob(&self, key: &str) -> BlobResult<BlobMetadata>;

    async fn list_blobs(&self, input: ListBlobsInput) -> BlobResult<ListBlobsOutput>;

    async fn delete_blob(&self, key: &str) -> BlobResult<()>;

    async fn delete_blobs(&self, keys: &[String]) -> BlobResult<()> {
        for key in keys {
            self.delete_blob(key).await?;
        }
        Ok(())
    }

    async fn rename_blob(&self, from: &str, to: &str) -> BlobResult<()>;

    async fn copy_blob(&self, from: &str, to: &str) -> BlobResult<BlobDescriptor>;

    /// Upload blob data in one request.
    async fn put_blob(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<String>,
    ) -> BlobResult<BlobDescriptor>;

    /// Get a whole blob, or one byte range of it.
    ///
    /// Ranges reaching past the end of the blob are clipped; a range starting
    /// at or after the end is an `InvalidRange` error.
    async fn get_blob(&self, key: &str, range: Option<Range>) -> BlobResult<GetBlobOutput>;

    /// Fetch several ranges of one blob in a single request.
    ///
    /// Parts come back in the order of `ranges`. Backends without native
    /// support fail with `UnsupportedOperation`.
    async fn get_blob_multi_range(
        &self,
        _key: &str,
        _ranges: &[Range],
    ) -> BlobResult<Vec<MultiRangePart>> {
        Err(BlobError::unsupported(
            "get_blob_multi_range",
            self.capabilities().name.clone(),
        ))
    }

    // --- Multipart Upload Operations ---

    /// Create a multipart upload session, returning its upload id.
    async fn multipart_blob_begin(&self, key: &str, options: &BeginOptions) -> BlobResult<String>;

    /// Upload one part. `part_number` starts from 1.
    async fn multipart_blob_add(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BlobResult<PartDescriptor>;

    /// Cancel the upload and release its partial data.
    async fn multipart_blob_abort(&self, key: &str, upload_id: &str) -> BlobResult<()>;

    /// Combine the parts, ordered by part number, into the final blob.
    async fn multipart_blob_commit(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartDescriptor],
    ) -> BlobResult<BlobDescriptor>;

    /// Abort every in-progress upload older than `older_than`, returning how
    /// many were reclaimed.
    async fn multipart_expire(&self, _older_than: Duration) -> BlobResult<usize> {
        Err(BlobError::unsupported(
            "multipart_expire",
            self.capabilities().name.clone(),
        ))
    }

    async fn make_bucket(&self) -> BlobResult<()> {
        Err(BlobError::unsupported(
            "make_bucket",
            self.capabilities().name.clone(),
        ))
    }

    async fn remove_bucket(&self) -> BlobResult<()> {
        Err(BlobError::unsupported(
            "remove_bucket",
            self.capabilities().name.clone(),
        ))
    }
}

/// Issue a native multi-range read, refusing before any I/O when the
/// backend does not advertise support for it.
pub async fn checked_multi_range(
    backend: &dyn StorageBackend,
    key: &str,
    ranges: &[Range],
) -> BlobResult<Vec<MultiRangePart>> {
    let caps = backend.capabilities();
    if !caps.supports_multi_range {
        return Err(BlobError::unsupported(
            "get_blob_multi_range",
            caps.name.clone(),
        ));
    }
    backend.get_blob_multi_range(key, ranges).await
}
