//! Blob backend configuration.

use std::env;

use figment::{
    Figment,
    providers::{Env, Format, Toml, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{BlobError, BlobResult};

/// Prefix of environment variables overriding file configuration, e.g.
/// `BLOB_BACKEND_READ__GAP_THRESHOLD=0.1`.
pub const ENV_PREFIX: &str = "BLOB_BACKEND_";

/// Configuration for a blob backend and the read/write paths above it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobBackendConfig {
    /// Storage location (e.g., `file:///path`, `s3://bucket/prefix`,
    /// `gs://bucket/prefix`, `az://container/prefix`, `memory://`).
    #[serde(default = "default_blob_store_path")]
    pub path: String,

    /// AWS region (for S3).
    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible stores (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Azure storage account name.
    #[serde(default)]
    pub azure_storage_account: Option<String>,

    /// GCP service account key path.
    #[serde(default)]
    pub gcp_service_account_path: Option<String>,

    #[serde(default)]
    pub read: ReadConfig,

    #[serde(default)]
    pub upload: UploadConfig,
}

impl Default for BlobBackendConfig {
    fn default() -> Self {
        Self {
            path: default_blob_store_path(),
            region: None,
            endpoint: None,
            azure_storage_account: None,
            gcp_service_account_path: None,
            read: ReadConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl BlobBackendConfig {
    /// Load from a YAML or TOML file, with environment overrides on top.
    pub fn from_path(path: &str) -> BlobResult<Self> {
        let config_str = std::fs::read_to_string(path)?;
        let figment = if path.ends_with(".toml") {
            Figment::new().merge(Toml::string(&config_str))
        } else {
            Figment::new().merge(Yaml::string(&config_str))
        };
        let config: BlobBackendConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BlobResult<()> {
        if !self.path.contains("://") {
            return Err(BlobError::InvalidConfig {
                reason: format!(
                    "blob path '{}' is missing a scheme (expected scheme://...)",
                    self.path
                ),
            });
        }
        self.read.validate()?;
        self.upload.validate()
    }
}

/// Tuning for multi-range reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadConfig {
    /// Largest fraction of wasted bytes accepted when widening neighbouring
    /// ranges into one request. Zero disables widening across gaps.
    #[serde(default = "default_gap_threshold")]
    pub gap_threshold: f64,

    /// Maximum concurrent backend requests for one logical read.
    #[serde(default = "default_read_concurrency")]
    pub concurrency: usize,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            gap_threshold: default_gap_threshold(),
            concurrency: default_read_concurrency(),
        }
    }
}

impl ReadConfig {
    pub fn validate(&self) -> BlobResult<()> {
        if !self.gap_threshold.is_finite() || !(0.0..=1.0).contains(&self.gap_threshold) {
            return Err(BlobError::InvalidConfig {
                reason: format!("read.gap_threshold {} outside [0, 1]", self.gap_threshold),
            });
        }
        if self.concurrency == 0 {
            return Err(BlobError::InvalidConfig {
                reason: "read.concurrency must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Tuning for multipart uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum concurrent part uploads for one upload. Backends that forbid
    /// parallel parts always use one.
    #[serde(default = "default_upload_concurrency")]
    pub concurrency: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_upload_concurrency(),
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> BlobResult<()> {
        if self.concurrency == 0 {
            return Err(BlobError::InvalidConfig {
                reason: "upload.concurrency must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn default_gap_threshold() -> f64 {
    0.25
}

fn default_read_concurrency() -> usize {
    8
}

fn default_upload_concurrency() -> usize {
    4
}

/// Default blob store path (local filesystem).
pub fn default_blob_store_path() -> String {
    format!(
        "file://{}",
        env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join("blob_storage")
            .to_str()
            .unwrap_or("./blob_storage")
    )
}
