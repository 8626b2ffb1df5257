//! Cloud backends built on the `object_store` crate.
//!
//! One adapter serves S3, GCS, Azure and the local filesystem; the
//! [`Capabilities`] handed in at construction decide which operations the
//! layers above will attempt.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::{
    Attribute,
    Attributes,
    GetOptions,
    GetRange,
    ObjectMeta,
    ObjectStore,
    PutOptions,
    memory::InMemory,
    multipart::{MultipartStore, PartId},
    path::Path as ObjectPath,
};
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

/// [`StorageBackend`] over any `object_store` implementation.
pub struct ObjectStoreBackend {
    caps: Capabilities,

    /// Bucket name extracted from base path.
    bucket: String,

    /// Optional prefix for all keys.
    prefix: String,

    /// object_store client for data I/O.
    store: Arc<dyn ObjectStore>,

    /// Upload-id based multipart client, when the store offers one.
    multipart: Option<Arc<dyn MultipartStore>>,

    /// Whether puts carry a content-type attribute.
    attributes: bool,
}

impl ObjectStoreBackend {
    pub fn new(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        caps: Capabilities,
        store: Arc<dyn ObjectStore>,
        multipart: Option<Arc<dyn MultipartStore>>,
    ) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        let bucket = bucket.into();
        debug!(
            backend = %caps.name,
            bucket = %bucket,
            prefix = %prefix,
            "Created object store backend"
        );
        Self {
            caps,
            bucket,
            prefix,
            store,
            multipart,
            attributes: true,
        }
    }

    /// Drop content types on put, for stores without attribute support
    /// such as the local filesystem.
    pub fn without_attributes(mut self) -> Self {
        self.attributes = false;
        self
    }

    /// Backend over `object_store`'s in-memory store.
    pub fn in_memory(caps: Capabilities) -> Self {
        let store = Arc::new(InMemory::new());
        Self::new("memory", "", caps, store.clone(), Some(store))
    }

    /// Convert a key to an ObjectPath for object_store.
    fn key_to_path(&self, key: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, key))
        }
    }

    fn path_to_key(&self, path: &ObjectPath) -> String {
        let path = path.as_ref();
        if self.prefix.is_empty() {
            return path.to_string();
        }
        path.strip_prefix(&self.prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(path)
            .to_string()
    }

    fn metadata(&self, meta: &ObjectMeta) -> BlobMetadata {
        BlobMetadata {
            key: self.path_to_key(&meta.location),
            size_bytes: meta.size as u64,
            etag: meta.e_tag.clone(),
            content_type: None,
            last_modified: Some(meta.last_modified.into()),
            metadata: Default::default(),
        }
    }

    fn multipart(&self, operation: &'static str) -> BlobResult<&dyn MultipartStore> {
        match &self.multipart {
            Some(store) if self.caps.supports_multipart() => Ok(store.as_ref()),
            _ => Err(BlobError::unsupported(operation, self.caps.name.clone())),
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn head_blob(&self, key: &str) -> BlobResult<BlobMetadata> {
        let meta = self.store.head(&self.key_to_path(key)).await?;
        Ok(self.metadata(&meta))
    }

    async fn list_blobs(&self, input: ListBlobsInput) -> BlobResult<ListBlobsOutput> {
        let prefix = match input.prefix.as_deref() {
            Some(p) => Some(self.key_to_path(p)),
            None if !self.prefix.is_empty() => Some(ObjectPath::from(self.prefix.as_str())),
            None => None,
        };

        let mut output = match input.delimiter.as_deref() {
            Some("/") => {
                let listed = self.store.list_with_delimiter(prefix.as_ref()).await?;
                ListBlobsOutput {
                    blobs: listed.objects.iter().map(|m| self.metadata(m)).collect(),
                    prefixes: listed
                        .common_prefixes
                        .iter()
                        .map(|p| format!("{}/", self.path_to_key(p)))
                        .collect(),
                }
            }
            Some(other) => {
                return Err(BlobError::InvalidConfig {
                    reason: format!("object stores only list with '/' delimiter, got '{}'", other),
                });
            }
            None => {
                let objects: Vec<ObjectMeta> =
                    self.store.list(prefix.as_ref()).try_collect().await?;
                ListBlobsOutput {
                    blobs: objects.iter().map(|m| self.metadata(m)).collect(),
                    prefixes: Vec::new(),
                }
            }
        };

        output.blobs.sort_by(|a, b| a.key.cmp(&b.key));
        if let Some(max) = input.max_keys {
            output.blobs.truncate(max);
        }
        Ok(output)
    }

    async fn delete_blob(&self, key: &str) -> BlobResult<()> {
        match self.store.delete(&self.key_to_path(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rename_blob(&self, from: &str, to: &str) -> BlobResult<()> {
        self.store
            .rename(&self.key_to_path(from), &self.key_to_path(to))
            .await?;
        Ok(())
    }

    async fn copy_blob(&self, from: &str, to: &str) -> BlobResult<BlobDescriptor> {
        let to_path = self.key_to_path(to);
        self.store.copy(&self.key_to_path(from), &to_path).await?;
        let meta = self.store.head(&to_path).await?;
        Ok(BlobDescriptor {
            etag: meta.e_tag,
            version: meta.version,
            size_bytes: Some(meta.size as u64),
            ..BlobDescriptor::new(to)
        })
    }

    async fn put_blob(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<String>,
    ) -> BlobResult<BlobDescriptor> {
        let size = data.len() as u64;
        let mut attributes = Attributes::new();
        if let Some(content_type) = content_type.filter(|_| self.attributes) {
            attributes.insert(Attribute::ContentType, content_type.into());
        }
        let options = PutOptions {
            attributes,
            ..Default::default()
        };
        let result = self
            .store
            .put_opts(&self.key_to_path(key), data.into(), options)
            .await?;
        Ok(BlobDescriptor {
            etag: result.e_tag,
            version: result.version,
            size_bytes: Some(size),
            ..BlobDescriptor::new(key)
        })
    }

    async fn get_blob(&self, key: &str, range: Option<Range>) -> BlobResult<GetBlobOutput> {
        let options = GetOptions {
            range: range.map(|r| GetRange::Bounded(r.as_std())),
            ..Default::default()
        };
        let result = self.store.get_opts(&self.key_to_path(key), options).await?;
        let metadata = self.metadata(&result.meta);
        let body = BlobBody::from_stream(result.into_stream().map_err(BlobError::from));
        Ok(GetBlobOutput { metadata, body })
    }

    async fn get_blob_multi_range(
        &self,
        key: &str,
        ranges: &[Range],
    ) -> BlobResult<Vec<MultiRangePart>> {
        if !self.caps.supports_multi_range {
            return Err(BlobError::unsupported(
                "get_blob_multi_range",
                self.caps.name.clone(),
            ));
        }
        let std_ranges: Vec<std::ops::Range<u64>> = ranges.iter().map(Range::as_std).collect();
        let fetched = self
            .store
            .get_ranges(&self.key_to_path(key), &std_ranges)
            .await?;
        Ok(ranges
            .iter()
            .zip(fetched)
            .map(|(range, data)| MultiRangePart {
                range: *range,
                content_type: DEFAULT_CONTENT_TYPE.to_string(),
                body: BlobBody::from_bytes(data),
            })
            .collect())
    }

    async fn multipart_blob_begin(&self, key: &str, options: &BeginOptions) -> BlobResult<String> {
        let store = self.multipart("multipart_blob_begin")?;
        // Upload-id based multipart creation takes no attributes.
        if options.content_type.is_some() || !options.metadata.is_empty() {
            return Err(BlobError::unsupported(
                "multipart_attributes",
                self.caps.name.clone(),
            ));
        }
        let upload_id = store.create_multipart(&self.key_to_path(key)).await?;
        Ok(upload_id)
    }

    async fn multipart_blob_add(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BlobResult<PartDescriptor> {
        let store = self.multipart("multipart_blob_add")?;
        if part_number == 0 {
            return Err(BlobError::InvalidPart {
                part_number,
                reason: "part numbers start at 1".to_string(),
            });
        }
        let size_bytes = data.len() as u64;
        let part = store
            .put_part(
                &self.key_to_path(key),
                &upload_id.to_string(),
                (part_number - 1) as usize,
                data.into(),
            )
            .await?;
        Ok(PartDescriptor {
            part_number,
            etag: part.content_id,
            size_bytes,
        })
    }

    async fn multipart_blob_abort(&self, key: &str, upload_id: &str) -> BlobResult<()> {
        let store = self.multipart("multipart_blob_abort")?;
        store
            .abort_multipart(&self.key_to_path(key), &upload_id.to_string())
            .await?;
        Ok(())
    }

    async fn multipart_blob_commit(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartDescriptor],
    ) -> BlobResult<BlobDescriptor> {
        let store = self.multipart("multipart_blob_commit")?;
        let part_ids = parts
            .iter()
            .map(|p| PartId {
                content_id: p.etag.clone(),
            })
            .collect();
        let result = store
            .complete_multipart(&self.key_to_path(key), &upload_id.to_string(), part_ids)
            .await?;
        Ok(BlobDescriptor {
            etag: result.e_tag,
            version: result.version,
            size_bytes: Some(parts.iter().map(|p| p.size_bytes).sum()),
            ..BlobDescriptor::new(key)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> ObjectStoreBackend {
        ObjectStoreBackend::in_memory(Capabilities::memory(true))
    }

    #[tokio::test]
    async fn test_put_get_range() {
        let backend = backend();
        backend
            .put_blob("dir/test.txt", Bytes::from("hello world"), None)
            .await
            .unwrap();

        let out = backend
            .get_blob("dir/test.txt", Some(Range { start: 6, count: 5 }))
            .await
            .unwrap();
        assert_eq!(out.body.collect().await.unwrap().as_ref(), b"world");

        let meta = backend.head_blob("dir/test.txt").await.unwrap();
        assert_eq!(meta.size_bytes, 11);
        assert_eq!(meta.key, "dir/test.txt");
    }

    #[tokio::test]
    async fn test_get_ranges_in_request_order() {
        let backend = backend();
        backend
            .put_blob("k", Bytes::from_static(b"0123456789abcdefghij"), None)
            .await
            .unwrap();
        let parts = backend
            .get_blob_multi_range(
                "k",
                &[Range { start: 10, count: 3 }, Range { start: 0, count: 2 }],
            )
            .await
            .unwrap();
        assert_eq!(parts[0].range.start, 10);
        let mut bodies = Vec::new();
        for part in parts {
            bodies.push(part.body.collect().await.unwrap());
        }
        assert_eq!(bodies, vec![Bytes::from("abc"), Bytes::from("01")]);
    }

    #[tokio::test]
    async fn test_multi_range_refused_without_capability() {
        let backend = ObjectStoreBackend::in_memory(Capabilities::memory(false));
        let err = backend
            .get_blob_multi_range("k", &[Range { start: 0, count: 1 }])
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let backend = backend();
        for key in ["a/1", "a/b/2", "c"] {
            backend.put_blob(key, Bytes::from_static(b"x"), None).await.unwrap();
        }
        let out = backend
            .list_blobs(ListBlobsInput {
                prefix: Some("a".to_string()),
                delimiter: Some("/".to_string()),
                max_keys: None,
            })
            .await
            .unwrap();
        let keys: Vec<&str> = out.blobs.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["a/1"]);
        assert_eq!(out.prefixes, vec!["a/b/".to_string()]);
    }

    #[tokio::test]
    async fn test_multipart_round_trip() {
        let backend = backend();
        let upload_id = backend
            .multipart_blob_begin("out", &BeginOptions::default())
            .await
            .unwrap();
        let p1 = backend
            .multipart_blob_add("out", &upload_id, 1, Bytes::from("hello "))
            .await
            .unwrap();
        let p2 = backend
            .multipart_blob_add("out", &upload_id, 2, Bytes::from("world"))
            .await
            .unwrap();
        let descriptor = backend
            .multipart_blob_commit("out", &upload_id, &[p1, p2])
            .await
            .unwrap();
        assert_eq!(descriptor.size_bytes, Some(11));

        let out = backend.get_blob("out", None).await.unwrap();
        assert_eq!(out.body.collect().await.unwrap().as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn test_multipart_begin_refuses_attributes() {
        let backend = backend();
        let options = BeginOptions {
            metadata: [("owner".to_string(), "ingest".to_string())].into(),
            ..Default::default()
        };
        let err = backend
            .multipart_blob_begin("out", &options)
            .await
            .unwrap_err();
        assert!(err.is_unsupported());

        let options = BeginOptions {
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        };
        assert!(
            backend
                .multipart_blob_begin("out", &options)
                .await
                .unwrap_err()
                .is_unsupported()
        );
    }

    #[tokio::test]
    async fn test_bucket_management_unsupported() {
        let backend = backend();
        assert!(backend.make_bucket().await.unwrap_err().is_unsupported());
        assert!(
            backend
                .multipart_expire(std::time::Duration::from_secs(1))
                .await
                .unwrap_err()
                .is_unsupported()
        );
    }
}
