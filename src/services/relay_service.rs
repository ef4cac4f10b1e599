//! Upload and download orchestration over the metadata and object stores.
//!
//! Upload: validate bucket → split file name → new identifier → claim the
//! object key → object write → metadata insert (object deleted again if the
//! insert fails). A key that already holds an object is never overwritten.
//!
//! Download: metadata lookup → stat → range resolution → ranged read, with
//! the body trimmed to exactly the resolved length.

use crate::{
    identifier::{IdentifierError, generate_identifier},
    models::file_record::{FileRecord, NewFileRecord, StoredName, relative_path_for},
    range::{ByteRange, RangeError, resolve_range},
    services::{
        file_repository::{FileRepository, RepositoryError},
        object_storage::{
            ByteStream, ObjectStorage, ObjectStream, StorageError, validate_bucket_name,
            validate_object_key,
        },
    },
};
use chrono::Utc;
use dashmap::DashSet;
use futures::{StreamExt, stream};
use std::{
    future::Future,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("BucketName can not be empty")]
    EmptyBucketName,
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("file part is missing")]
    MissingFile,
    #[error("file name can not be empty")]
    EmptyFileName,
    #[error("file name can not be used as an object key")]
    InvalidFileName,
    #[error("file `{key}` already exists in bucket `{bucket}`")]
    AlreadyExists { bucket: String, key: String },
    #[error("uuid query parameter is required")]
    MissingIdentifier,
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
    #[error(transparent)]
    Storage(StorageError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl From<StorageError> for RelayError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidBucketName { name, reason } => {
                RelayError::InvalidBucketName { name, reason }
            }
            StorageError::InvalidObjectKey(_) => RelayError::InvalidFileName,
            other => RelayError::Storage(other),
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

/// A file part as received from the client.
pub struct IncomingFile<'a> {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: ByteStream<'a>,
}

/// A download ready to be written to the client.
pub struct Download {
    pub record: FileRecord,
    /// Size of the whole object.
    pub total_size: u64,
    /// Bytes being served; `None` only for an empty object.
    pub range: Option<ByteRange>,
    /// Whether the client asked for a range.
    pub partial: bool,
    /// Exactly `range.len()` bytes; errors once headers are out abort the connection.
    pub body: ObjectStream,
}

/// Orchestrates the metadata store and object store. Cheap to clone.
#[derive(Clone)]
pub struct RelayService {
    pub files: Arc<dyn FileRepository>,
    pub objects: Arc<dyn ObjectStorage>,
    store_timeout: Duration,
    /// `bucket/key` pairs with an upload in flight.
    claimed_keys: Arc<DashSet<String>>,
}

/// Exclusive hold on an object key for the duration of one upload.
struct KeyClaim<'a> {
    claimed: &'a DashSet<String>,
    slot: String,
}

impl Drop for KeyClaim<'_> {
    fn drop(&mut self) {
        self.claimed.remove(&self.slot);
    }
}

impl RelayService {
    pub fn new(
        files: Arc<dyn FileRepository>,
        objects: Arc<dyn ObjectStorage>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            files,
            objects,
            store_timeout,
            claimed_keys: Arc::new(DashSet::new()),
        }
    }

    /// Check the `bucketName` form value before anything is written.
    pub fn validate_bucket(bucket: Option<&str>) -> RelayResult<&str> {
        let bucket = bucket.map(str::trim).unwrap_or_default();
        if bucket.is_empty() {
            return Err(RelayError::EmptyBucketName);
        }
        validate_bucket_name(bucket)?;
        Ok(bucket)
    }

    /// Store a file and return its new identifier.
    pub async fn upload(&self, bucket: &str, file: IncomingFile<'_>) -> RelayResult<String> {
        let bucket = Self::validate_bucket(Some(bucket))?;
        let name = file
            .file_name
            .as_deref()
            .and_then(StoredName::parse)
            .ok_or(RelayError::EmptyFileName)?;

        let identifier = generate_identifier()?;
        let record = NewFileRecord {
            identifier,
            bucket: bucket.to_string(),
            relative_path: relative_path_for(Utc::now().date_naive()),
            file_name: name.base_name,
            extension: name.extension,
        };
        let key = record.object_key();
        validate_object_key(&key).map_err(|_| RelayError::InvalidFileName)?;

        let _claim = self.claim_key(bucket, &key)?;
        match self.bounded("object stat", self.objects.stat(bucket, &key)).await {
            Ok(_) => return Err(already_exists(bucket, &key)),
            Err(RelayError::Storage(StorageError::ObjectNotFound { .. })) => {}
            Err(err) => return Err(err),
        }

        info!(
            identifier = %record.identifier,
            bucket,
            key = %key,
            "Upload file: {} > {}",
            file.file_name.as_deref().unwrap_or_default(),
            key
        );

        let size_bytes = self
            .bounded_put(bucket, &key, file.content_type.as_deref(), file.data)
            .await
            .inspect_err(|err| {
                error!(identifier = %record.identifier, bucket, key = %key, "object write failed: {}", err)
            })?;

        let identifier = record.identifier.clone();
        let inserted = self
            .bounded("metadata insert", self.files.insert(record))
            .await;

        match inserted {
            Ok(stored) => {
                info!(identifier = %stored.identifier, bucket, key = %key, size_bytes, "upload complete");
                Ok(stored.identifier)
            }
            Err(err) => {
                error!(identifier = %identifier, bucket, key = %key, "metadata insert failed: {}", err);
                if let Err(cleanup) = self
                    .bounded("object delete", self.objects.delete(bucket, &key))
                    .await
                {
                    warn!(bucket, key = %key, "could not remove orphaned object: {}", cleanup);
                }
                Err(err)
            }
        }
    }

    /// Resolve an identifier and optional `Range` header into a ready download.
    pub async fn download(
        &self,
        identifier: Option<&str>,
        range_header: Option<&str>,
    ) -> RelayResult<Download> {
        let identifier = identifier
            .filter(|id| !id.is_empty())
            .ok_or(RelayError::MissingIdentifier)?;

        let record = self
            .bounded("metadata lookup", self.files.find_by_identifier(identifier))
            .await?
            .ok_or_else(|| RelayError::NotFound(identifier.to_string()))?;

        let bucket = record.bucket.clone();
        let key = record.object_key();

        let total_size = self
            .bounded("object stat", self.objects.stat(&bucket, &key))
            .await
            .inspect_err(|err| {
                error!(identifier, bucket = %bucket, key = %key, "object stat failed: {}", err)
            })?;

        if total_size == 0 {
            if range_header.is_some() {
                return Err(RangeError::Unsatisfiable { size: 0 }.into());
            }
            return Ok(Download {
                record,
                total_size,
                range: None,
                partial: false,
                body: stream::empty().boxed(),
            });
        }

        let range = resolve_range(range_header, total_size).inspect_err(|err| {
            warn!(identifier, range = ?range_header, "rejected range: {}", err)
        })?;

        info!(identifier, bucket = %bucket, key = %key, range = %range, "Download file {} < {}", identifier, key);

        let stream = self
            .bounded(
                "object read",
                self.objects.get_range(&bucket, &key, range.to_exclusive()),
            )
            .await?;

        let label: Arc<str> = format!("{} ({}/{})", identifier, bucket, key).into();
        Ok(Download {
            record,
            total_size,
            range: Some(range),
            partial: range_header.is_some(),
            body: exact_length(stream, range.len(), self.store_timeout, label),
        })
    }

    fn claim_key(&self, bucket: &str, key: &str) -> RelayResult<KeyClaim<'_>> {
        let slot = format!("{}/{}", bucket, key);
        if !self.claimed_keys.insert(slot.clone()) {
            return Err(already_exists(bucket, key));
        }
        Ok(KeyClaim {
            claimed: &self.claimed_keys,
            slot,
        })
    }

    /// Run an object write with `store_timeout` applied to the store side only.
    ///
    /// The write fails once a whole timeout window passes without a body chunk
    /// being handed over while the store is not waiting on the client.
    async fn bounded_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        mut data: ByteStream<'_>,
    ) -> RelayResult<u64> {
        let awaiting_client = Arc::new(AtomicBool::new(false));
        let chunks_seen = Arc::new(AtomicU64::new(0));

        let paced = {
            let awaiting_client = awaiting_client.clone();
            let chunks_seen = chunks_seen.clone();
            stream::poll_fn(move |cx| {
                let poll = data.poll_next_unpin(cx);
                awaiting_client.store(poll.is_pending(), Ordering::Relaxed);
                if poll.is_ready() {
                    chunks_seen.fetch_add(1, Ordering::Relaxed);
                }
                poll
            })
            .boxed()
        };

        let put = self.objects.put(bucket, key, content_type, paced);
        tokio::pin!(put);

        let mut last_seen = 0;
        loop {
            tokio::select! {
                result = &mut put => return result.map_err(RelayError::from),
                _ = tokio::time::sleep(self.store_timeout) => {
                    let seen = chunks_seen.load(Ordering::Relaxed);
                    if seen == last_seen && !awaiting_client.load(Ordering::Relaxed) {
                        return Err(RelayError::Timeout("object write"));
                    }
                    last_seen = seen;
                }
            }
        }
    }

    async fn bounded<T, E>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, E>>,
    ) -> RelayResult<T>
    where
        RelayError: From<E>,
    {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result.map_err(RelayError::from),
            Err(_) => Err(RelayError::Timeout(operation)),
        }
    }
}

fn already_exists(bucket: &str, key: &str) -> RelayError {
    RelayError::AlreadyExists {
        bucket: bucket.to_string(),
        key: key.to_string(),
    }
}

/// Yield exactly `expected` bytes from `inner`.
///
/// Extra bytes are cut off; a source that ends early, fails, or stalls longer
/// than `chunk_timeout` yields one error and then ends.
fn exact_length(
    inner: ObjectStream,
    expected: u64,
    chunk_timeout: Duration,
    label: Arc<str>,
) -> ObjectStream {
    stream::unfold((inner, expected), move |(mut inner, remaining)| {
        let label = label.clone();
        async move {
            if remaining == 0 {
                return None;
            }

            let failure = match tokio::time::timeout(chunk_timeout, inner.next()).await {
                Ok(Some(Ok(mut chunk))) => {
                    if chunk.len() as u64 > remaining {
                        chunk.truncate(remaining as usize);
                    }
                    let left = remaining - chunk.len() as u64;
                    return Some((Ok(chunk), (inner, left)));
                }
                Ok(Some(Err(err))) => err,
                Ok(None) => StorageError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("object ended with {} bytes outstanding", remaining),
                )),
                Err(_) => StorageError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "object read stalled",
                )),
            };

            error!("download {} aborted mid-stream: {}", label, failure);
            Some((Err(failure), (inner, 0)))
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{file_repository::RepositoryResult, object_storage::StorageResult};
    use async_trait::async_trait;
    use bytes::Bytes;

    struct NoFiles;

    #[async_trait]
    impl FileRepository for NoFiles {
        async fn insert(&self, _record: NewFileRecord) -> RepositoryResult<FileRecord> {
            Err(RepositoryError::Sqlx(sqlx::Error::PoolClosed))
        }

        async fn find_by_identifier(&self, _identifier: &str) -> RepositoryResult<Option<FileRecord>> {
            Ok(None)
        }

        async fn ping(&self) -> RepositoryResult<()> {
            Ok(())
        }
    }

    fn chunks(parts: Vec<StorageResult<&'static [u8]>>) -> ObjectStream {
        stream::iter(
            parts
                .into_iter()
                .map(|p| p.map(Bytes::from_static))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    async fn collect(stream: ObjectStream) -> (Vec<u8>, Option<StorageError>) {
        let mut out = Vec::new();
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(err) => return (out, Some(err)),
            }
        }
        (out, None)
    }

    #[tokio::test]
    async fn passes_exact_length_through() {
        let body = exact_length(
            chunks(vec![Ok(&b"abc"[..]), Ok(&b"def"[..])]),
            6,
            Duration::from_secs(1),
            "t".into(),
        );
        let (bytes, err) = collect(body).await;
        assert_eq!(bytes, b"abcdef");
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn trims_overlong_source() {
        let body = exact_length(
            chunks(vec![Ok(&b"abc"[..]), Ok(&b"def"[..]), Ok(&b"ghi"[..])]),
            4,
            Duration::from_secs(1),
            "t".into(),
        );
        let (bytes, err) = collect(body).await;
        assert_eq!(bytes, b"abcd");
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn short_source_is_an_error() {
        let body = exact_length(
            chunks(vec![Ok(&b"abc"[..])]),
            10,
            Duration::from_secs(1),
            "t".into(),
        );
        let (bytes, err) = collect(body).await;
        assert_eq!(bytes, b"abc");
        assert!(matches!(err, Some(StorageError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn source_error_ends_stream() {
        let body = exact_length(
            chunks(vec![
                Ok(&b"ab"[..]),
                Err(StorageError::Io(io::Error::other("reset"))),
                Ok(&b"cd"[..]),
            ]),
            4,
            Duration::from_secs(1),
            "t".into(),
        );
        let mut body = body;
        assert!(body.next().await.unwrap().is_ok());
        assert!(body.next().await.unwrap().is_err());
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn stalled_source_times_out() {
        let stalled: ObjectStream = stream::pending().boxed();
        let body = exact_length(stalled, 4, Duration::from_millis(50), "t".into());
        let (bytes, err) = collect(body).await;
        assert!(bytes.is_empty());
        assert!(matches!(err, Some(StorageError::Io(e)) if e.kind() == io::ErrorKind::TimedOut));
    }

    #[test]
    fn key_claim_is_exclusive_until_dropped() {
        let service = RelayService::new(
            Arc::new(NoFiles),
            Arc::new(crate::services::object_storage::BucketObjectStorage::in_memory()),
            Duration::from_secs(1),
        );

        let claim = service.claim_key("media", "2024/01/01/a.txt").unwrap();
        assert!(matches!(
            service.claim_key("media", "2024/01/01/a.txt"),
            Err(RelayError::AlreadyExists { .. })
        ));
        assert!(service.claim_key("other", "2024/01/01/a.txt").is_ok());

        drop(claim);
        assert!(service.claim_key("media", "2024/01/01/a.txt").is_ok());
    }

    #[test]
    fn invalid_object_key_is_a_file_name_error() {
        let err = RelayError::from(StorageError::InvalidObjectKey("a\tb".into()));
        assert!(matches!(err, RelayError::InvalidFileName));
    }

    #[test]
    fn bucket_validation_distinguishes_empty_from_invalid() {
        assert!(matches!(
            RelayService::validate_bucket(None),
            Err(RelayError::EmptyBucketName)
        ));
        assert!(matches!(
            RelayService::validate_bucket(Some("  ")),
            Err(RelayError::EmptyBucketName)
        ));
        assert!(matches!(
            RelayService::validate_bucket(Some("Bad_Name")),
            Err(RelayError::InvalidBucketName { .. })
        ));
        assert_eq!(RelayService::validate_bucket(Some("media")).unwrap(), "media");
    }
}
