//! Storage backend implementations and scheme based construction.

pub mod memory;
pub mod object_store;

use std::sync::Arc;

#[cfg(feature = "azure")]
use ::object_store::azure::MicrosoftAzureBuilder;
#[cfg(feature = "gcp")]
use ::object_store::gcp::GoogleCloudStorageBuilder;
#[cfg(feature = "aws")]
use ::object_store::aws::AmazonS3Builder;
use ::object_store::local::LocalFileSystem;
use tracing::info;
use url::Url;

use crate::{
    BackendKind,
    BlobBackendConfig,
    BlobError,
    BlobResult,
    MemoryBackend,
    ObjectStoreBackend,
    StorageBackend,
};

/// Build the backend named by the scheme of `config.path`.
///
/// `s3://`, `gs://` and `az://` (or `azure://`) need the matching crate
/// feature; `file://` and `memory://` are always available.
pub fn connect(config: &BlobBackendConfig) -> BlobResult<Arc<dyn StorageBackend>> {
    config.validate()?;
    let url = Url::parse(&config.path).map_err(|e| BlobError::InvalidConfig {
        reason: format!("invalid blob path '{}': {}", config.path, e),
    })?;
    let kind = BackendKind::from_scheme(url.scheme())?;
    let caps = kind.capabilities();
    let bucket = url.host_str().unwrap_or_default().to_string();
    let prefix = url.path().trim_matches('/').to_string();

    info!(
        backend = %caps.name,
        path = %config.path,
        "connecting blob backend"
    );

    let backend: Arc<dyn StorageBackend> = match kind {
        BackendKind::Memory => Arc::new(MemoryBackend::new(bucket, caps)),
        BackendKind::LocalFile => {
            let root = url.path();
            std::fs::create_dir_all(root)?;
            let store = LocalFileSystem::new_with_prefix(root)?;
            Arc::new(
                ObjectStoreBackend::new(root, "", caps, Arc::new(store), None)
                    .without_attributes(),
            )
        }
        #[cfg(feature = "aws")]
        BackendKind::S3 => {
            let mut builder = AmazonS3Builder::from_env().with_url(config.path.as_str());
            if let Some(region) = &config.region {
                builder = builder.with_region(region);
            }
            // For supporting localstack/minio for testing
            if let Some(endpoint) = &config.endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            let store = Arc::new(builder.build()?);
            Arc::new(ObjectStoreBackend::new(
                bucket,
                prefix,
                caps,
                store.clone(),
                Some(store),
            ))
        }
        #[cfg(feature = "gcp")]
        BackendKind::Gcs => {
            let mut builder = GoogleCloudStorageBuilder::from_env().with_url(config.path.as_str());
            if let Some(path) = &config.gcp_service_account_path {
                builder = builder.with_service_account_path(path);
            }
            let store = Arc::new(builder.build()?);
            Arc::new(ObjectStoreBackend::new(
                bucket,
                prefix,
                caps,
                store.clone(),
                Some(store),
            ))
        }
        #[cfg(feature = "azure")]
        BackendKind::AzureBlob => {
            let mut builder = MicrosoftAzureBuilder::from_env().with_url(config.path.as_str());
            if let Some(account) = &config.azure_storage_account {
                builder = builder.with_account(account);
            }
            let store = Arc::new(builder.build()?);
            Arc::new(ObjectStoreBackend::new(
                bucket,
                prefix,
                caps,
                store.clone(),
                Some(store),
            ))
        }
        #[allow(unreachable_patterns)]
        other => {
            return Err(BlobError::unsupported(
                "connect",
                format!("{:?} (feature not enabled)", other),
            ));
        }
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::Range;

    #[tokio::test]
    async fn test_connect_memory() {
        let config = BlobBackendConfig {
            path: "memory://scratch".to_string(),
            ..Default::default()
        };
        let backend = connect(&config).unwrap();
        assert_eq!(backend.capabilities().name, "memory");
        assert_eq!(backend.bucket(), "scratch");
    }

    #[tokio::test]
    async fn test_connect_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = BlobBackendConfig {
            path: format!("file://{}", dir.path().to_str().unwrap()),
            ..Default::default()
        };
        let backend = connect(&config).unwrap();
        assert!(!backend.capabilities().supports_multi_range);

        backend
            .put_blob("nested/blob", Bytes::from("0123456789"), None)
            .await
            .unwrap();
        let out = backend
            .get_blob("nested/blob", Some(Range { start: 2, count: 3 }))
            .await
            .unwrap();
        assert_eq!(out.body.collect().await.unwrap().as_ref(), b"234");
        assert!(dir.path().join("nested/blob").exists());

        let err = backend
            .multipart_blob_begin("big", &Default::default())
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_connect_unknown_scheme() {
        let config = BlobBackendConfig {
            path: "ftp://host/dir".to_string(),
            ..Default::default()
        };
        assert!(connect(&config).is_err());
    }
}
