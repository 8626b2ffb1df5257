//! Capability-aware blob storage backend abstraction.
//!
//! This crate puts one interface in front of object stores with different
//! abilities (S3, GCS, Azure Blob, local filesystem, memory). It provides:
//!
//! - A [`Capabilities`] descriptor per backend
//! - Range planning that folds neighbouring byte ranges into fewer requests
//! - Multi-range reads, native where the backend supports them
//! - A multipart upload coordinator with an explicit state machine
//!
//! # Architecture
//!
//! Every provider adapter implements the [`StorageBackend`] trait. The
//! [`MultiRangeExecutor`] and [`MultipartCoordinator`] sit on top of it and
//! branch on the backend's capabilities, never on its identity. [`connect`]
//! builds the adapter named by a URL scheme (s3://, gs://, file://, ...).
//!
//! # Usage
//!
//! ## Reading several ranges of one blob
//!
//! ```rust,no_run
//! use blob_backend::{BlobBackendConfig, MultiRangeExecutor, Range, connect};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), blob_backend::BlobError> {
//! let config = BlobBackendConfig {
//!     path: "s3://my-bucket/prefix".to_string(),
//!     region: Some("us-west-2".to_string()),
//!     ..Default::default()
//! };
//! let backend = connect(&config)?;
//! let executor = MultiRangeExecutor::new(backend, config.read.clone());
//!
//! let ranges = [Range::new(0, 5)?, Range::new(10, 5)?, Range::new(20, 5)?];
//! let parts = executor
//!     .read("data/blob", &ranges, &CancellationToken::new())
//!     .await?;
//! for part in parts {
//!     let bytes = part.body.collect().await?;
//!     println!("{}: {} bytes", part.range, bytes.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Uploading in parts
//!
//! ```rust,no_run
//! use blob_backend::{BeginOptions, BlobBackendConfig, MultipartCoordinator, connect};
//! use bytes::Bytes;
//!
//! # async fn example() -> Result<(), blob_backend::BlobError> {
//! let config = BlobBackendConfig {
//!     path: "s3://my-bucket".to_string(),
//!     ..Default::default()
//! };
//! let coordinator = MultipartCoordinator::new(connect(&config)?, config.upload.clone());
//!
//! let upload = coordinator.begin("output", BeginOptions::default()).await?;
//! upload.add_part(2, Bytes::from("world")).await?;
//! upload.add_part(1, Bytes::from("hello ")).await?;
//! let descriptor = upload.commit().await?;
//! println!("{:?}", descriptor.etag);
//! # Ok(())
//! # }
//! ```

mod backends;
mod body;
mod capabilities;
mod config;
mod error;
mod executor;
mod metadata;
mod metrics;
mod multipart;
mod plan;
mod range;
mod traits;

pub use backends::{
    connect,
    memory::{MemoryBackend, MemoryBackendStats},
    object_store::ObjectStoreBackend,
};
pub use body::BlobBody;
pub use capabilities::{BackendKind, Capabilities};
pub use config::{
    BlobBackendConfig,
    ENV_PREFIX,
    ReadConfig,
    UploadConfig,
    default_blob_store_path,
};
pub use error::{BlobError, BlobResult, RetryClass};
pub use executor::MultiRangeExecutor;
pub use metadata::{
    BeginOptions,
    BlobDescriptor,
    BlobMetadata,
    GetBlobOutput,
    ListBlobsInput,
    ListBlobsOutput,
    MultiRangePart,
    PartDescriptor,
};
pub use metrics::{BlobMetrics, Timer};
pub use multipart::{ExpireReport, MultipartCoordinator, MultipartUpload, UploadState};
pub use plan::{ExecutionPlan, PhysicalGroup, PlanOptions, plan};
pub use range::{IndexedRange, Range, gap_ratio, normalize, span, validate_all};
pub use traits::{StorageBackend, checked_multi_range};
