//! Shared fixtures for the HTTP tests: in-memory stores, counting and failing
//! fakes, and a multipart request builder.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response, header},
};
use bytes::Bytes;
use file_relay::{
    build_app,
    models::file_record::{FileRecord, NewFileRecord},
    services::{
        file_repository::{
            self, FileRepository, RepositoryError, RepositoryResult, SqliteFileRepository,
        },
        object_storage::{
            BucketObjectStorage, ByteStream, ObjectStorage, ObjectStream, StorageResult,
        },
        relay_service::RelayService,
    },
};
use http_body_util::BodyExt;
use std::{
    ops::Range,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tower::ServiceExt;

pub const BOUNDARY: &str = "relay-test-boundary";
pub const MAX_UPLOAD_BYTES: usize = 8 * 1024 * 1024;

/// Object storage that counts calls and remembers the last written key.
pub struct CountingStorage {
    pub inner: Arc<dyn ObjectStorage>,
    pub puts: AtomicUsize,
    pub stats: AtomicUsize,
    pub gets: AtomicUsize,
    pub deletes: AtomicUsize,
    pub last_put: Mutex<Option<(String, String)>>,
}

impl CountingStorage {
    pub fn new(inner: Arc<dyn ObjectStorage>) -> Self {
        Self {
            inner,
            puts: AtomicUsize::new(0),
            stats: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            last_put: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
            + self.stats.load(Ordering::SeqCst)
            + self.gets.load(Ordering::SeqCst)
            + self.deletes.load(Ordering::SeqCst)
    }

    pub fn last_put(&self) -> Option<(String, String)> {
        self.last_put.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStorage for CountingStorage {
    async fn put<'a>(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        data: ByteStream<'a>,
    ) -> StorageResult<u64> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        *self.last_put.lock().unwrap() = Some((bucket.to_string(), key.to_string()));
        self.inner.put(bucket, key, content_type, data).await
    }

    async fn stat(&self, bucket: &str, key: &str) -> StorageResult<u64> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        self.inner.stat(bucket, key).await
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> StorageResult<ObjectStream> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_range(bucket, key, range).await
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(bucket, key).await
    }
}

/// Metadata store that counts inserts, optionally failing every one of them.
pub struct CountingRepository {
    pub inner: Arc<dyn FileRepository>,
    pub inserts: AtomicUsize,
    pub fail_inserts: bool,
}

#[async_trait]
impl FileRepository for CountingRepository {
    async fn insert(&self, record: NewFileRecord) -> RepositoryResult<FileRecord> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts {
            return Err(RepositoryError::Sqlx(sqlx::Error::PoolTimedOut));
        }
        self.inner.insert(record).await
    }

    async fn find_by_identifier(&self, identifier: &str) -> RepositoryResult<Option<FileRecord>> {
        self.inner.find_by_identifier(identifier).await
    }

    async fn ping(&self) -> RepositoryResult<()> {
        self.inner.ping().await
    }
}

pub struct TestApp {
    pub app: Router,
    pub objects: Arc<CountingStorage>,
    pub files: Arc<CountingRepository>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::build(Arc::new(BucketObjectStorage::in_memory()), false).await
    }

    pub async fn with_failing_inserts() -> Self {
        Self::build(Arc::new(BucketObjectStorage::in_memory()), true).await
    }

    pub async fn with_storage(storage: Arc<dyn ObjectStorage>) -> Self {
        Self::build(storage, false).await
    }

    async fn build(storage: Arc<dyn ObjectStorage>, fail_inserts: bool) -> Self {
        let pool = file_repository::connect("sqlite::memory:", 1).await.unwrap();
        file_repository::run_migrations(&pool).await.unwrap();

        let files = Arc::new(CountingRepository {
            inner: Arc::new(SqliteFileRepository::new(Arc::new(pool))),
            inserts: AtomicUsize::new(0),
            fail_inserts,
        });
        let objects = Arc::new(CountingStorage::new(storage));
        let service = RelayService::new(files.clone(), objects.clone(), Duration::from_secs(5));

        Self {
            app: build_app(service, MAX_UPLOAD_BYTES),
            objects,
            files,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub fn inserts(&self) -> usize {
        self.files.inserts.load(Ordering::SeqCst)
    }

    /// Upload `data` as `file_name` into `bucket` and return the identifier.
    pub async fn upload(&self, bucket: &str, file_name: &str, data: &[u8]) -> String {
        let response = self
            .send(multipart_request(&[
                Part::Text("bucketName", bucket),
                Part::File {
                    name: "file",
                    file_name,
                    content_type: "application/octet-stream",
                    data,
                },
            ]))
            .await;
        assert_eq!(response.status(), 200);
        let json = body_json(response).await;
        json["uuid"].as_str().unwrap().to_string()
    }

    pub async fn download(&self, uuid: &str, range: Option<&str>) -> Response<Body> {
        let mut builder = Request::builder().uri(format!("/download?uuid={}", uuid));
        if let Some(range) = range {
            builder = builder.header(header::RANGE, range);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }
}

pub enum Part<'a> {
    Text(&'a str, &'a str),
    File {
        name: &'a str,
        file_name: &'a str,
        content_type: &'a str,
        data: &'a [u8],
    },
}

pub fn multipart_request(parts: &[Part<'_>]) -> Request<Body> {
    let mut body: Vec<u8> = Vec::new();
    for part in parts {
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!(
                        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                    )
                    .as_bytes(),
                );
            }
            Part::File {
                name,
                file_name,
                content_type,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Deterministic content that never contains the multipart boundary.
pub fn sample_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn header_str<'a>(response: &'a Response<Body>, name: header::HeaderName) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}
