//! Blob storage access for the ingestion pipeline.
//!
//! Goal:
//! - S3-compatible storage in production/staging (and local-stack in development)
//! - On-disk storage for local dev
//! - In-memory storage for tests
//!
//! Implementation note:
//! This is a small wrapper around `object_store`, which already provides
//! S3, local filesystem, and in-memory backends. Objects are addressed by
//! [`BlobReference`]; the filesystem and memory backends map a bucket to a
//! top-level directory.

mod fetcher;

use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use ingest_core::BlobReference;
use ingest_core::config::{ConfigError, Env};
use object_store::ObjectStore;
use object_store::ObjectStoreExt;
use object_store::path::Path;
use tokio::sync::RwLock;

pub use fetcher::{BlobFetcher, BlobStream, FetchError};

/// Endpoint used for every AWS service when local-stack mode is on.
pub const LOCALSTACK_ENDPOINT: &str = "http://localhost:4566";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage config: {0}")]
    InvalidConfig(String),

    #[error("invalid blob reference {0}: {1}")]
    InvalidReference(BlobReference, String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object_store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl From<ConfigError> for StorageError {
    fn from(e: ConfigError) -> Self {
        StorageError::InvalidConfig(e.to_string())
    }
}

impl StorageError {
    /// The object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectStore(object_store::Error::NotFound { .. })
        )
    }

    /// Whether a later attempt could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::InvalidConfig(_) | StorageError::InvalidReference(..) => false,
            StorageError::Io(_) => true,
            StorageError::ObjectStore(e) => !matches!(
                e,
                object_store::Error::NotFound { .. }
                    | object_store::Error::InvalidPath { .. }
                    | object_store::Error::PermissionDenied { .. }
                    | object_store::Error::Unauthenticated { .. }
                    | object_store::Error::NotSupported { .. }
                    | object_store::Error::NotImplemented { .. }
                    | object_store::Error::UnknownConfigurationKey { .. }
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    S3,
    Filesystem,
    Memory,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::S3 => "s3",
            StorageKind::Filesystem => "filesystem",
            StorageKind::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    pub endpoint: Option<String>,
    pub allow_http: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub virtual_hosted_style: bool,
}

impl S3Config {
    /// Settings for a local-stack S3 emulator (path-style, plain HTTP).
    pub fn localstack(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            endpoint: Some(LOCALSTACK_ENDPOINT.to_string()),
            allow_http: true,
            access_key_id: Some("test".into()),
            secret_access_key: Some("test".into()),
            session_token: None,
            virtual_hosted_style: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StorageBackendConfig {
    S3(S3Config),
    Filesystem { root: PathBuf },
    Memory,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackendConfig,
    /// Optional key prefix applied to all object keys.
    pub prefix: Option<String>,
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self {
            backend: StorageBackendConfig::Memory,
            prefix: None,
        }
    }

    pub fn filesystem(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: StorageBackendConfig::Filesystem { root: root.into() },
            prefix: None,
        }
    }

    pub fn s3(cfg: S3Config) -> Self {
        Self {
            backend: StorageBackendConfig::S3(cfg),
            prefix: None,
        }
    }

    /// Build a config from environment variables.
    ///
    /// Selection rules:
    /// - If `INGEST_USE_LOCALSTACK` is true: S3 against `http://localhost:4566`
    /// - If `STORAGE_BACKEND` is set: use it (`s3`, `filesystem`, `memory`)
    /// - Otherwise: default to filesystem (`./data/object_store`)
    ///
    /// S3 env vars (S3-compatible):
    /// - `AWS_REGION` (default: `eu-west-2`)
    /// - `S3_ENDPOINT` (optional, e.g. `http://localhost:9000`)
    /// - `S3_ALLOW_HTTP` (`true`/`false`, default: auto true if endpoint is http://)
    /// - `S3_VIRTUAL_HOSTED_STYLE` (`true`/`false`, default: false)
    /// - `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_SESSION_TOKEN` (optional)
    ///
    /// Filesystem env vars:
    /// - `STORAGE_FS_ROOT` (default: `./data/object_store`)
    ///
    /// Common:
    /// - `STORAGE_PREFIX` (optional, e.g. `results/`)
    pub fn from_env(env: &Env) -> Result<Self, StorageError> {
        let prefix = env.string("STORAGE_PREFIX");

        if env.bool("INGEST_USE_LOCALSTACK")?.unwrap_or(false) {
            let region = env
                .string("AWS_REGION")
                .unwrap_or_else(|| "eu-west-2".to_string());
            return Ok(Self {
                prefix,
                ..Self::s3(S3Config::localstack(region))
            });
        }

        let backend = env.string("STORAGE_BACKEND");
        let fs_root = || {
            env.string("STORAGE_FS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/object_store"))
        };

        let cfg = match backend.as_deref() {
            Some("s3") => Self::s3(read_s3_config(env)?),
            Some("filesystem") | Some("fs") | None => Self::filesystem(fs_root()),
            Some("memory") | Some("mem") => Self::memory(),
            Some(other) => {
                return Err(StorageError::InvalidConfig(format!(
                    "unsupported STORAGE_BACKEND={other} (expected s3|filesystem|memory)"
                )));
            }
        };

        Ok(Self { prefix, ..cfg })
    }
}

enum Backend {
    /// One client per bucket, built on first use.
    S3 {
        cfg: S3Config,
        buckets: RwLock<HashMap<String, Arc<dyn ObjectStore>>>,
    },
    /// A single store; buckets become top-level directories.
    Shared(Arc<dyn ObjectStore>),
}

#[derive(Clone)]
pub struct Storage {
    kind: StorageKind,
    backend: Arc<Backend>,
    prefix: Option<String>,
}

impl Storage {
    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    pub fn kind_str(&self) -> &'static str {
        self.kind.as_str()
    }

    pub async fn new(cfg: StorageConfig) -> Result<Self, StorageError> {
        let (kind, backend) = match cfg.backend {
            StorageBackendConfig::S3(s3) => (
                StorageKind::S3,
                Backend::S3 {
                    cfg: s3,
                    buckets: RwLock::new(HashMap::new()),
                },
            ),
            StorageBackendConfig::Filesystem { root } => {
                ensure_dir(&root)?;
                let fs = object_store::local::LocalFileSystem::new_with_prefix(&root)?;
                (StorageKind::Filesystem, Backend::Shared(Arc::new(fs)))
            }
            StorageBackendConfig::Memory => {
                let mem = object_store::memory::InMemory::new();
                (StorageKind::Memory, Backend::Shared(Arc::new(mem)))
            }
        };

        tracing::info!(backend = kind.as_str(), "Blob storage ready");

        Ok(Self {
            kind,
            backend: Arc::new(backend),
            prefix: cfg.prefix.and_then(ingest_core::config::non_empty),
        })
    }

    pub async fn from_env(env: &Env) -> Result<Self, StorageError> {
        Self::new(StorageConfig::from_env(env)?).await
    }

    async fn store_for(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
        match self.backend.as_ref() {
            Backend::Shared(store) => Ok(store.clone()),
            Backend::S3 { cfg, buckets } => {
                if let Some(store) = buckets.read().await.get(bucket) {
                    return Ok(store.clone());
                }

                let mut buckets = buckets.write().await;
                if let Some(store) = buckets.get(bucket) {
                    return Ok(store.clone());
                }
                let store: Arc<dyn ObjectStore> = Arc::new(build_s3(cfg.clone(), bucket)?);
                buckets.insert(bucket.to_string(), store.clone());
                Ok(store)
            }
        }
    }

    fn to_path(&self, blob: &BlobReference) -> Result<Path, StorageError> {
        let key = blob.key.trim_start_matches('/');
        let bucket = blob.bucket.trim_matches('/');
        if key.is_empty() || bucket.is_empty() {
            return Err(StorageError::InvalidReference(
                blob.clone(),
                "bucket and key must not be empty".to_string(),
            ));
        }

        let mut parts = Vec::with_capacity(3);
        if let Some(prefix) = self.prefix.as_deref() {
            let prefix = prefix.trim_matches('/');
            if !prefix.is_empty() {
                parts.push(prefix);
            }
        }
        if matches!(self.backend.as_ref(), Backend::Shared(_)) {
            parts.push(bucket);
        }
        parts.push(key);

        Path::parse(parts.join("/"))
            .map_err(|e| StorageError::InvalidReference(blob.clone(), e.to_string()))
    }

    pub async fn put_bytes(&self, blob: &BlobReference, bytes: Bytes) -> Result<(), StorageError> {
        let path = self.to_path(blob)?;
        let store = self.store_for(&blob.bucket).await?;
        store.put(&path, object_store::PutPayload::from(bytes)).await?;
        Ok(())
    }

    pub async fn get_bytes(&self, blob: &BlobReference) -> Result<Bytes, StorageError> {
        let path = self.to_path(blob)?;
        let store = self.store_for(&blob.bucket).await?;
        let res = store.get(&path).await?;
        Ok(res.bytes().await?)
    }

    pub async fn delete(&self, blob: &BlobReference) -> Result<(), StorageError> {
        let path = self.to_path(blob)?;
        let store = self.store_for(&blob.bucket).await?;
        store.delete(&path).await?;
        Ok(())
    }
}

fn ensure_dir(root: &FsPath) -> Result<(), StorageError> {
    std::fs::create_dir_all(root)?;
    Ok(())
}

fn read_s3_config(env: &Env) -> Result<S3Config, StorageError> {
    let region = env
        .string("AWS_REGION")
        .unwrap_or_else(|| "eu-west-2".to_string());

    let endpoint = env.string("S3_ENDPOINT");
    let allow_http = match env.bool("S3_ALLOW_HTTP")? {
        Some(v) => v,
        None => endpoint
            .as_deref()
            .is_some_and(|e| e.to_ascii_lowercase().starts_with("http://")),
    };

    let virtual_hosted_style = env.bool("S3_VIRTUAL_HOSTED_STYLE")?.unwrap_or(false);

    Ok(S3Config {
        region,
        endpoint,
        allow_http,
        access_key_id: env.string("AWS_ACCESS_KEY_ID"),
        secret_access_key: env.string("AWS_SECRET_ACCESS_KEY"),
        session_token: env.string("AWS_SESSION_TOKEN"),
        virtual_hosted_style,
    })
}

fn build_s3(cfg: S3Config, bucket: &str) -> Result<object_store::aws::AmazonS3, StorageError> {
    let mut builder = object_store::aws::AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region(cfg.region)
        .with_virtual_hosted_style_request(cfg.virtual_hosted_style);

    if let Some(endpoint) = cfg.endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    if cfg.allow_http {
        builder = builder.with_allow_http(true);
    }
    if let Some(access_key_id) = cfg.access_key_id {
        builder = builder.with_access_key_id(access_key_id);
    }
    if let Some(secret_access_key) = cfg.secret_access_key {
        builder = builder.with_secret_access_key(secret_access_key);
    }
    if let Some(session_token) = cfg.session_token {
        builder = builder.with_token(session_token);
    }

    Ok(builder.build()?)
}
