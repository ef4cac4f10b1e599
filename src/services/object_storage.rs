//! Object store client: bucket/key addressed blobs with ranged reads.
//!
//! [`BucketObjectStorage`] adapts the `object_store` crate. The local and
//! in-memory backends share one store and use the bucket as the first path
//! segment; the S3 backend builds one client per bucket on first use.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{StreamExt, stream::BoxStream};
use object_store::{
    Attribute, Attributes, GetOptions, GetRange, ObjectStore, PutMultipartOptions, WriteMultipart,
    aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, path::Path,
};
use std::{io, ops::Range, path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
/// Parts buffered in flight by a single upload.
const UPLOAD_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Request body chunks handed to [`ObjectStorage::put`].
pub type ByteStream<'a> = BoxStream<'a, io::Result<Bytes>>;

/// Object content returned by [`ObjectStorage::get_range`].
pub type ObjectStream = BoxStream<'static, StorageResult<Bytes>>;

/// Bucket/key object storage used by the relay.
///
/// Implementations must be safe to share between concurrent requests.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Write `data` to `bucket/key`, replacing any existing object. Returns the size written.
    async fn put<'a>(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        data: ByteStream<'a>,
    ) -> StorageResult<u64>;

    /// Size of the object in bytes.
    async fn stat(&self, bucket: &str, key: &str) -> StorageResult<u64>;

    /// Stream the half-open byte `range` of the object.
    async fn get_range(&self, bucket: &str, key: &str, range: Range<u64>)
    -> StorageResult<ObjectStream>;

    /// Remove the object. Deleting a missing object succeeds.
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()>;

    /// Readiness check for the backend.
    async fn ready(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Connection settings for an S3-compatible endpoint such as MinIO.
#[derive(Clone)]
pub struct S3Settings {
    pub endpoint: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub region: String,
}

enum Layout {
    /// One store for every bucket; the bucket is the first path segment.
    Shared {
        store: Arc<dyn ObjectStore>,
        supports_attributes: bool,
    },
    /// One store per bucket, built lazily.
    PerBucket {
        settings: S3Settings,
        stores: DashMap<String, Arc<dyn ObjectStore>>,
    },
}

/// [`ObjectStorage`] on top of the `object_store` crate.
pub struct BucketObjectStorage {
    layout: Layout,
}

impl BucketObjectStorage {
    /// Objects on local disk under `root/{bucket}/{key}`.
    pub fn local(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let store = LocalFileSystem::new_with_prefix(&root)?.with_automatic_cleanup(true);
        Ok(Self {
            layout: Layout::Shared {
                store: Arc::new(store),
                // the local backend rejects object attributes
                supports_attributes: false,
            },
        })
    }

    /// Objects kept in process memory.
    pub fn in_memory() -> Self {
        Self {
            layout: Layout::Shared {
                store: Arc::new(InMemory::new()),
                supports_attributes: true,
            },
        }
    }

    /// Objects in an S3-compatible service; each relay bucket is a real bucket there.
    pub fn s3(settings: S3Settings) -> Self {
        Self {
            layout: Layout::PerBucket {
                settings,
                stores: DashMap::new(),
            },
        }
    }

    /// Whether the declared content type of an upload is kept with the object.
    pub fn supports_attributes(&self) -> bool {
        match &self.layout {
            Layout::Shared {
                supports_attributes,
                ..
            } => *supports_attributes,
            Layout::PerBucket { .. } => true,
        }
    }

    /// Resolve the store and path holding `bucket/key`.
    fn locate(&self, bucket: &str, key: &str) -> StorageResult<(Arc<dyn ObjectStore>, Path)> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)?;

        match &self.layout {
            Layout::Shared { store, .. } => {
                let path = std::iter::once(bucket).chain(key.split('/')).collect();
                Ok((store.clone(), path))
            }
            Layout::PerBucket { settings, stores } => {
                let store = match stores.get(bucket) {
                    Some(store) => store.clone(),
                    None => {
                        let built = build_s3_store(settings, bucket)?;
                        stores
                            .entry(bucket.to_string())
                            .or_insert(built)
                            .value()
                            .clone()
                    }
                };
                Ok((store, key.split('/').collect()))
            }
        }
    }
}

#[async_trait]
impl ObjectStorage for BucketObjectStorage {
    async fn put<'a>(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        mut data: ByteStream<'a>,
    ) -> StorageResult<u64> {
        let (store, path) = self.locate(bucket, key)?;

        let mut opts = PutMultipartOptions::default();
        if let Some(content_type) = content_type {
            if self.supports_attributes() {
                let mut attributes = Attributes::new();
                attributes.insert(Attribute::ContentType, content_type.to_string().into());
                opts.attributes = attributes;
            } else {
                debug!(bucket, key, content_type, "backend does not keep content type");
            }
        }

        let upload = store.put_multipart_opts(&path, opts).await?;
        let mut writer = WriteMultipart::new(upload);
        let mut size_bytes: u64 = 0;
        while let Some(chunk) = data.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    if let Err(abort_err) = writer.abort().await {
                        warn!(bucket, key, "failed to abort upload: {}", abort_err);
                    }
                    return Err(StorageError::Io(err));
                }
            };
            writer.wait_for_capacity(UPLOAD_CONCURRENCY).await?;
            size_bytes += chunk.len() as u64;
            writer.write(&chunk);
        }
        writer.finish().await?;

        debug!(bucket, key, size_bytes, "stored object");
        Ok(size_bytes)
    }

    async fn stat(&self, bucket: &str, key: &str) -> StorageResult<u64> {
        let (store, path) = self.locate(bucket, key)?;
        let meta = store
            .head(&path)
            .await
            .map_err(|err| not_found_or(err, bucket, key))?;
        Ok(meta.size)
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> StorageResult<ObjectStream> {
        let (store, path) = self.locate(bucket, key)?;
        let options = GetOptions {
            range: Some(GetRange::Bounded(range)),
            ..Default::default()
        };
        let result = store
            .get_opts(&path, options)
            .await
            .map_err(|err| not_found_or(err, bucket, key))?;

        Ok(result
            .into_stream()
            .map(|chunk| chunk.map_err(StorageError::from))
            .boxed())
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let (store, path) = self.locate(bucket, key)?;
        match store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Write, read back and delete a probe object on shared backends.
    async fn ready(&self) -> StorageResult<()> {
        let Layout::Shared { store, .. } = &self.layout else {
            return Ok(());
        };

        let path = Path::from(format!("readyz-{}", Uuid::new_v4()));
        store.put(&path, Bytes::from_static(b"readyz").into()).await?;
        let bytes = async { store.get(&path).await?.bytes().await }.await;
        // best-effort cleanup
        let _ = store.delete(&path).await;

        if bytes?.as_ref() != b"readyz" {
            return Err(StorageError::Io(io::Error::other("probe content mismatch")));
        }
        Ok(())
    }
}

fn build_s3_store(settings: &S3Settings, bucket: &str) -> StorageResult<Arc<dyn ObjectStore>> {
    let mut builder = AmazonS3Builder::new()
        .with_endpoint(&settings.endpoint)
        .with_bucket_name(bucket)
        .with_region(&settings.region)
        .with_allow_http(settings.endpoint.starts_with("http://"));
    if let Some(access_key) = &settings.access_key {
        builder = builder.with_access_key_id(access_key);
    }
    if let Some(secret_key) = &settings.secret_key {
        builder = builder.with_secret_access_key(secret_key);
    }

    debug!(bucket, endpoint = %settings.endpoint, "built S3 client");
    Ok(Arc::new(builder.build()?))
}

fn not_found_or(err: object_store::Error, bucket: &str, key: &str) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        other => StorageError::ObjectStore(other),
    }
}

/// Reject keys that are empty, oversized, or could escape their bucket.
pub fn validate_object_key(key: &str) -> StorageResult<()> {
    let invalid = || StorageError::InvalidObjectKey(key.to_string());

    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(invalid());
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(invalid());
    }
    if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
        return Err(invalid());
    }
    Ok(())
}

/// Validate bucket name format.
///
/// Enforces S3 naming rules:
/// - 3 to 63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub fn validate_bucket_name(name: &str) -> StorageResult<()> {
    let invalid = |reason: &str| StorageError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid("must be between 3 and 63 characters"));
    }

    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }

    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }

    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }

    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }

    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}
