//! In-process blob backend.
//!
//! Keeps blobs and in-progress multipart uploads in memory. Capabilities are
//! configurable so the same backend can stand in for any provider, and call
//! statistics make the physical I/O pattern observable.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    BeginOptions,
    BlobBody,
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
    StorageBackend,
};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

struct StoredBlob {
    data: Bytes,
    etag: String,
    content_type: Option<String>,
    metadata: HashMap<String, String>,
    modified: SystemTime,
}

impl StoredBlob {
    fn new(data: Bytes, content_type: Option<String>) -> Self {
        Self {
            etag: etag_for(&data),
            data,
            content_type,
            metadata: HashMap::new(),
            modified: SystemTime::now(),
        }
    }

    fn metadata(&self, key: &str) -> BlobMetadata {
        BlobMetadata {
            key: key.to_string(),
            size_bytes: self.data.len() as u64,
            etag: Some(self.etag.clone()),
            content_type: self.content_type.clone(),
            last_modified: Some(self.modified),
            metadata: self.metadata.clone(),
        }
    }

    /// Bytes of `range`, clipped at the end of the blob.
    fn slice(&self, key: &str, range: Range) -> BlobResult<Bytes> {
        let len = self.data.len() as u64;
        if range.start >= len {
            return Err(BlobError::invalid_range(
                range.start,
                range.count,
                format!("starts beyond end of {} ({} bytes)", key, len),
            ));
        }
        let end = range.end().min(len);
        Ok(self.data.slice(range.start as usize..end as usize))
    }
}

struct PendingUpload {
    key: String,
    content_type: Option<String>,
    metadata: HashMap<String, String>,
    parts: BTreeMap<u32, (String, Bytes)>,
    created_at: Instant,
}

/// Snapshot of the calls a [`MemoryBackend`] has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBackendStats {
    pub get_calls: usize,
    pub multi_range_calls: usize,
    pub parts_added: usize,
    /// Highest number of part uploads observed running at once.
    pub max_concurrent_parts: usize,
    pub commits: usize,
    pub aborts: usize,
}

#[derive(Default)]
struct Counters {
    get_calls: AtomicUsize,
    multi_range_calls: AtomicUsize,
    parts_added: AtomicUsize,
    parts_in_flight: AtomicUsize,
    max_concurrent_parts: AtomicUsize,
    commits: AtomicUsize,
    aborts: AtomicUsize,
}

struct InFlightPart<'a>(&'a Counters);

impl<'a> InFlightPart<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.parts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_concurrent_parts.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlightPart<'_> {
    fn drop(&mut self) {
        self.0.parts_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Blob backend holding everything in process memory.
pub struct MemoryBackend {
    caps: Capabilities,
    bucket: String,
    blobs: Mutex<BTreeMap<String, StoredBlob>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    bucket_exists: AtomicBool,
    native_multi_range: AtomicBool,
    part_delay: Option<Duration>,
    commit_delay: Option<Duration>,
    counters: Counters,
}

impl MemoryBackend {
    pub fn new(bucket: impl Into<String>, caps: Capabilities) -> Self {
        Self {
            native_multi_range: AtomicBool::new(caps.supports_multi_range),
            caps,
            bucket: bucket.into(),
            blobs: Mutex::new(BTreeMap::new()),
            uploads: Mutex::new(HashMap::new()),
            bucket_exists: AtomicBool::new(true),
            part_delay: None,
            commit_delay: None,
            counters: Counters::default(),
        }
    }

    /// Backend pre-populated with one blob.
    pub fn with_blob(
        bucket: impl Into<String>,
        caps: Capabilities,
        key: &str,
        data: impl Into<Bytes>,
    ) -> Self {
        let backend = Self::new(bucket, caps);
        backend
            .lock_blobs()
            .insert(key.to_string(), StoredBlob::new(data.into(), None));
        backend
    }

    /// Hold every part upload for `delay`, widening the window in which
    /// concurrent uploads overlap.
    pub fn with_part_delay(mut self, delay: Duration) -> Self {
        self.part_delay = Some(delay);
        self
    }

    /// Hold every commit for `delay` before it takes the upload.
    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    /// Keep advertising multi-range support but reject native multi-range
    /// calls, as a provider does after a configuration change.
    pub fn simulate_multi_range_drift(&self) {
        self.native_multi_range.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> MemoryBackendStats {
        let c = &self.counters;
        MemoryBackendStats {
            get_calls: c.get_calls.load(Ordering::SeqCst),
            multi_range_calls: c.multi_range_calls.load(Ordering::SeqCst),
            parts_added: c.parts_added.load(Ordering::SeqCst),
            max_concurrent_parts: c.max_concurrent_parts.load(Ordering::SeqCst),
            commits: c.commits.load(Ordering::SeqCst),
            aborts: c.aborts.load(Ordering::SeqCst),
        }
    }

    /// Upload ids the backend still holds resources for.
    pub fn pending_uploads(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_uploads().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lock_blobs(&self) -> MutexGuard<'_, BTreeMap<String, StoredBlob>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_uploads(&self) -> MutexGuard<'_, HashMap<String, PendingUpload>> {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_bucket(&self) -> BlobResult<()> {
        if self.bucket_exists.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BlobError::NotFound {
                key: format!("bucket {}", self.bucket),
            })
        }
    }

    fn ensure_multipart(&self, operation: &'static str) -> BlobResult<()> {
        if self.caps.supports_multipart() {
            Ok(())
        } else {
            Err(BlobError::unsupported(operation, self.caps.name.clone()))
        }
    }
}

fn etag_for(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn head_blob(&self, key: &str) -> BlobResult<BlobMetadata> {
        self.ensure_bucket()?;
        self.lock_blobs()
            .get(key)
            .map(|blob| blob.metadata(key))
            .ok_or_else(|| BlobError::NotFound {
                key: key.to_string(),
            })
    }

    async fn list_blobs(&self, input: ListBlobsInput) -> BlobResult<ListBlobsOutput> {
        self.ensure_bucket()?;
        let prefix = input.prefix.unwrap_or_default();
        let blobs = self.lock_blobs();
        let mut output = ListBlobsOutput::default();
        for (key, blob) in blobs.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            if let Some(delimiter) = input.delimiter.as_deref() {
                if let Some(pos) = rest.find(delimiter) {
                    let common = format!("{}{}", prefix, &rest[..pos + delimiter.len()]);
                    if output.prefixes.last() != Some(&common) {
                        output.prefixes.push(common);
                    }
                    continue;
                }
            }
            if input.max_keys.is_some_and(|max| output.blobs.len() >= max) {
                break;
            }
            output.blobs.push(blob.metadata(key));
        }
        Ok(output)
    }

    async fn delete_blob(&self, key: &str) -> BlobResult<()> {
        self.ensure_bucket()?;
        self.lock_blobs().remove(key);
        Ok(())
    }

    async fn rename_blob(&self, from: &str, to: &str) -> BlobResult<()> {
        self.ensure_bucket()?;
        let mut blobs = self.lock_blobs();
        let blob = blobs.remove(from).ok_or_else(|| BlobError::NotFound {
            key: from.to_string(),
        })?;
        blobs.insert(to.to_string(), blob);
        Ok(())
    }

    async fn copy_blob(&self, from: &str, to: &str) -> BlobResult<BlobDescriptor> {
        self.ensure_bucket()?;
        let mut blobs = self.lock_blobs();
        let source = blobs.get(from).ok_or_else(|| BlobError::NotFound {
            key: from.to_string(),
        })?;
        let mut copy = StoredBlob::new(source.data.clone(), source.content_type.clone());
        copy.metadata = source.metadata.clone();
        let descriptor = BlobDescriptor {
            etag: Some(copy.etag.clone()),
            size_bytes: Some(copy.data.len() as u64),
            ..BlobDescriptor::new(to)
        };
        blobs.insert(to.to_string(), copy);
        Ok(descriptor)
    }

    async fn put_blob(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<String>,
    ) -> BlobResult<BlobDescriptor> {
        self.ensure_bucket()?;
        let blob = StoredBlob::new(data, content_type);
        let descriptor = BlobDescriptor {
            etag: Some(blob.etag.clone()),
            size_bytes: Some(blob.data.len() as u64),
            ..BlobDescriptor::new(key)
        };
        self.lock_blobs().insert(key.to_string(), blob);
        Ok(descriptor)
    }

    async fn get_blob(&self, key: &str, range: Option<Range>) -> BlobResult<GetBlobOutput> {
        self.ensure_bucket()?;
        self.counters.get_calls.fetch_add(1, Ordering::SeqCst);
        let blobs = self.lock_blobs();
        let blob = blobs.get(key).ok_or_else(|| BlobError::NotFound {
            key: key.to_string(),
        })?;
        let data = match range {
            Some(range) => blob.slice(key, range)?,
            None => blob.data.clone(),
        };
        Ok(GetBlobOutput {
            metadata: blob.metadata(key),
            body: BlobBody::from_bytes(data),
        })
    }

    async fn get_blob_multi_range(
        &self,
        key: &str,
        ranges: &[Range],
    ) -> BlobResult<Vec<MultiRangePart>> {
        if !self.native_multi_range.load(Ordering::SeqCst) {
            return Err(BlobError::unsupported(
                "get_blob_multi_range",
                self.caps.name.clone(),
            ));
        }
        self.ensure_bucket()?;
        self.counters.multi_range_calls.fetch_add(1, Ordering::SeqCst);
        let blobs = self.lock_blobs();
        let blob = blobs.get(key).ok_or_else(|| BlobError::NotFound {
            key: key.to_string(),
        })?;
        let content_type = blob
            .content_type
            .clone()
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        ranges
            .iter()
            .map(|range| {
                Ok(MultiRangePart {
                    range: *range,
                    content_type: content_type.clone(),
                    body: BlobBody::from_bytes(blob.slice(key, *range)?),
                })
            })
            .collect()
    }

    async fn multipart_blob_begin(&self, key: &str, options: &BeginOptions) -> BlobResult<String> {
        self.ensure_bucket()?;
        self.ensure_multipart("multipart_blob_begin")?;
        let upload_id = nanoid::nanoid!();
        self.lock_uploads().insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                content_type: options.content_type.clone(),
                metadata: options.metadata.clone(),
                parts: BTreeMap::new(),
                created_at: Instant::now(),
            },
        );
        debug!(key, upload_id = %upload_id, "memory multipart upload created");
        Ok(upload_id)
    }

    async fn multipart_blob_add(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BlobResult<PartDescriptor> {
        self.ensure_multipart("multipart_blob_add")?;
        let _in_flight = InFlightPart::enter(&self.counters);
        if let Some(delay) = self.part_delay {
            tokio::time::sleep(delay).await;
        }

        let etag = etag_for(&data);
        let size_bytes = data.len() as u64;
        let mut uploads = self.lock_uploads();
        let upload = uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| BlobError::UploadNotFound {
                upload_id: upload_id.to_string(),
            })?;
        upload.parts.insert(part_number, (etag.clone(), data));
        self.counters.parts_added.fetch_add(1, Ordering::SeqCst);
        Ok(PartDescriptor {
            part_number,
            etag,
            size_bytes,
        })
    }

    async fn multipart_blob_abort(&self, _key: &str, upload_id: &str) -> BlobResult<()> {
        self.counters.aborts.fetch_add(1, Ordering::SeqCst);
        self.lock_uploads().remove(upload_id);
        Ok(())
    }

    async fn multipart_blob_commit(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartDescriptor],
    ) -> BlobResult<BlobDescriptor> {
        self.ensure_bucket()?;
        if let Some(delay) = self.commit_delay {
            tokio::time::sleep(delay).await;
        }
        let upload = self
            .lock_uploads()
            .remove(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| BlobError::UploadNotFound {
                upload_id: upload_id.to_string(),
            })?;

        let mut data = BytesMut::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => data.extend_from_slice(bytes),
                _ => {
                    return Err(BlobError::InvalidPart {
                        part_number: part.part_number,
                        reason: format!("not uploaded to {} with etag {}", upload_id, part.etag),
                    });
                }
            }
        }
        let size = data.len() as u64;
        if size > self.caps.max_multipart_size {
            return Err(BlobError::ObjectTooLarge {
                size,
                max: self.caps.max_multipart_size,
            });
        }

        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        let mut blob = StoredBlob::new(data.freeze(), upload.content_type);
        blob.metadata = upload.metadata;
        let descriptor = BlobDescriptor {
            etag: Some(blob.etag.clone()),
            size_bytes: Some(size),
            ..BlobDescriptor::new(key)
        };
        self.lock_blobs().insert(key.to_string(), blob);
        Ok(descriptor)
    }

    async fn multipart_expire(&self, older_than: Duration) -> BlobResult<usize> {
        let mut uploads = self.lock_uploads();
        let before = uploads.len();
        uploads.retain(|_, upload| upload.created_at.elapsed() < older_than);
        Ok(before - uploads.len())
    }

    async fn make_bucket(&self) -> BlobResult<()> {
        self.bucket_exists.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_bucket(&self) -> BlobResult<()> {
        if !self.lock_blobs().is_empty() {
            return Err(BlobError::Backend {
                source: anyhow::anyhow!("bucket {} is not empty", self.bucket),
            });
        }
        self.bucket_exists.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATA: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    fn backend(multi_range: bool) -> MemoryBackend {
        MemoryBackend::with_blob(
            "test-bucket",
            Capabilities::memory(multi_range),
            "test-key",
            Bytes::from_static(DATA),
        )
    }

    fn r(start: u64, count: u64) -> Range {
        Range { start, count }
    }

    #[tokio::test]
    async fn test_multi_range_request() {
        let backend = backend(true);
        let parts = backend
            .get_blob_multi_range("test-key", &[r(0, 5), r(10, 5), r(20, 5)])
            .await
            .unwrap();
        assert_eq!(parts.len(), 3);

        let expected = ["01234", "abcde", "klmno"];
        for (part, expected) in parts.into_iter().zip(expected) {
            assert_eq!(part.content_type, DEFAULT_CONTENT_TYPE);
            assert_eq!(part.body.collect().await.unwrap(), Bytes::from(expected));
        }
    }

    #[tokio::test]
    async fn test_multi_range_unsupported() {
        let backend = MemoryBackend::with_blob(
            "test-bucket",
            Capabilities::memory(false),
            "test-key",
            Bytes::from_static(b"test"),
        );
        let err = backend
            .get_blob_multi_range("test-key", &[r(0, 2)])
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
        assert_eq!(backend.stats().multi_range_calls, 0);
    }

    #[tokio::test]
    async fn test_get_range_clips_at_end() {
        let backend = backend(false);
        let out = backend.get_blob("test-key", Some(r(30, 100))).await.unwrap();
        assert_eq!(out.body.collect().await.unwrap().as_ref(), b"uvwxyz");

        let err = backend.get_blob("test-key", Some(r(36, 1))).await.unwrap_err();
        assert!(matches!(err, BlobError::InvalidRange { start: 36, .. }));

        let err = backend.get_blob("missing", None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_with_delimiter() {
        let backend = MemoryBackend::new("b", Capabilities::memory(true));
        for key in ["dir/a", "dir/sub/b", "dir/sub/c", "other"] {
            backend.put_blob(key, Bytes::from_static(b"x"), None).await.unwrap();
        }
        let out = backend
            .list_blobs(ListBlobsInput {
                prefix: Some("dir/".to_string()),
                delimiter: Some("/".to_string()),
                max_keys: None,
            })
            .await
            .unwrap();
        let keys: Vec<&str> = out.blobs.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["dir/a"]);
        assert_eq!(out.prefixes, vec!["dir/sub/".to_string()]);
    }

    #[tokio::test]
    async fn test_rename_and_copy() {
        let backend = backend(true);
        let copy = backend.copy_blob("test-key", "copy").await.unwrap();
        assert_eq!(copy.size_bytes, Some(DATA.len() as u64));
        backend.rename_blob("copy", "moved").await.unwrap();
        assert!(backend.head_blob("copy").await.unwrap_err().is_not_found());
        assert_eq!(
            backend.head_blob("moved").await.unwrap().etag,
            backend.head_blob("test-key").await.unwrap().etag
        );
        backend
            .delete_blobs(&["moved".to_string(), "test-key".to_string()])
            .await
            .unwrap();
        backend.remove_bucket().await.unwrap();
        assert!(backend.head_blob("test-key").await.is_err());
        backend.make_bucket().await.unwrap();
    }

    #[tokio::test]
    async fn test_multipart_round_trip() {
        let backend = MemoryBackend::new("b", Capabilities::memory(true));
        let id = backend
            .multipart_blob_begin("out", &BeginOptions::default())
            .await
            .unwrap();
        let p2 = backend
            .multipart_blob_add("out", &id, 2, Bytes::from("world"))
            .await
            .unwrap();
        let p1 = backend
            .multipart_blob_add("out", &id, 1, Bytes::from("hello "))
            .await
            .unwrap();
        let descriptor = backend
            .multipart_blob_commit("out", &id, &[p1, p2])
            .await
            .unwrap();
        assert_eq!(descriptor.size_bytes, Some(11));
        let out = backend.get_blob("out", None).await.unwrap();
        assert_eq!(out.body.collect().await.unwrap().as_ref(), b"hello world");
        assert!(backend.pending_uploads().is_empty());
    }

    #[tokio::test]
    async fn test_multipart_keeps_begin_metadata() {
        let backend = MemoryBackend::new("b", Capabilities::memory(true));
        let options = BeginOptions {
            content_type: Some("application/json".to_string()),
            metadata: [("owner".to_string(), "ingest".to_string())].into(),
            ..Default::default()
        };
        let id = backend.multipart_blob_begin("out", &options).await.unwrap();
        let p1 = backend
            .multipart_blob_add("out", &id, 1, Bytes::from("{}"))
            .await
            .unwrap();
        backend.multipart_blob_commit("out", &id, &[p1]).await.unwrap();

        let meta = backend.head_blob("out").await.unwrap();
        assert_eq!(meta.content_type.as_deref(), Some("application/json"));
        assert_eq!(meta.metadata.get("owner").map(String::as_str), Some("ingest"));

        backend.copy_blob("out", "copy").await.unwrap();
        assert_eq!(backend.head_blob("copy").await.unwrap().metadata, meta.metadata);
    }

    #[tokio::test]
    async fn test_commit_rejects_unknown_part() {
        let backend = MemoryBackend::new("b", Capabilities::memory(true));
        let id = backend
            .multipart_blob_begin("out", &BeginOptions::default())
            .await
            .unwrap();
        let bogus = PartDescriptor {
            part_number: 1,
            etag: "nope".to_string(),
            size_bytes: 1,
        };
        let err = backend
            .multipart_blob_commit("out", &id, &[bogus])
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::InvalidPart { part_number: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multipart_expire() {
        let backend = MemoryBackend::new("b", Capabilities::memory(true));
        let old = backend
            .multipart_blob_begin("old", &BeginOptions::default())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        let fresh = backend
            .multipart_blob_begin("fresh", &BeginOptions::default())
            .await
            .unwrap();

        let reclaimed = backend
            .multipart_expire(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(backend.pending_uploads(), vec![fresh]);
        assert!(!backend.pending_uploads().contains(&old));
    }

    #[tokio::test]
    async fn test_multipart_unsupported_without_limit() {
        let backend = MemoryBackend::new("b", Capabilities::local_file());
        let err = backend
            .multipart_blob_begin("out", &BeginOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
    }
}
