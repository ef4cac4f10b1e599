//! HTTP handlers for file upload and download.
//! Streams bodies in both directions and delegates store access to
//! `RelayService`.

use crate::{
    errors::AppError,
    services::relay_service::{Download, IncomingFile, RelayError, RelayService},
};
use axum::{
    Json,
    body::Body,
    extract::{
        Multipart, Query, State,
        multipart::MultipartError,
        rejection::QueryRejection,
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use std::io;

const FILE_FIELD: &str = "file";
const BUCKET_FIELD: &str = "bucketName";

/// Query params accepted by `GET /download`.
#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub uuid: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub uuid: String,
}

/// File part read before `bucketName` was seen.
struct BufferedFile {
    file_name: Option<String>,
    content_type: Option<String>,
    chunks: Vec<Bytes>,
}

/// `POST /upload`: multipart form with a `file` part and a `bucketName` field.
///
/// When `bucketName` precedes the file the part is streamed straight into the
/// object store; otherwise it is buffered until the bucket is known.
pub async fn upload_file(
    State(service): State<RelayService>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut bucket: Option<String> = None;
    let mut buffered: Option<BufferedFile> = None;

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(BUCKET_FIELD) => {
                bucket = Some(field.text().await.map_err(multipart_error)?);
            }
            Some(FILE_FIELD) if buffered.is_none() => {
                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);

                if let Some(bucket) = bucket.as_deref() {
                    let bucket = RelayService::validate_bucket(Some(bucket))?;
                    let data = field
                        .map(|chunk| chunk.map_err(io::Error::other))
                        .boxed();
                    let file = IncomingFile {
                        file_name,
                        content_type,
                        data,
                    };
                    let uuid = service.upload(bucket, file).await?;
                    return Ok(Json(UploadResponse { uuid }));
                }

                let mut chunks = Vec::new();
                while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                    chunks.push(chunk);
                }
                buffered = Some(BufferedFile {
                    file_name,
                    content_type,
                    chunks,
                });
            }
            // unknown fields are skipped
            _ => {}
        }
    }

    let bucket = RelayService::validate_bucket(bucket.as_deref())?;
    let file = buffered.ok_or(RelayError::MissingFile)?;
    let incoming = IncomingFile {
        file_name: file.file_name,
        content_type: file.content_type,
        data: stream::iter(file.chunks.into_iter().map(Ok)).boxed(),
    };

    let uuid = service.upload(bucket, incoming).await?;
    Ok(Json(UploadResponse { uuid }))
}

/// `GET /download?uuid=<identifier>`: whole file or a single `Range`.
pub async fn download_file(
    State(service): State<RelayService>,
    query: Result<Query<DownloadQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let Query(query) = query.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    let range_header = headers
        .get(header::RANGE)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| AppError::bad_request("Range header is not valid text"))
        })
        .transpose()?;

    let download = service
        .download(query.uuid.as_deref(), range_header)
        .await?;

    let status = if download.partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let mut resp_headers = HeaderMap::new();
    set_download_headers(&mut resp_headers, &download);

    let mut response = Response::new(Body::from_stream(download.body));
    *response.status_mut() = status;
    *response.headers_mut() = resp_headers;
    Ok(response)
}

fn set_download_headers(headers: &mut HeaderMap, download: &Download) {
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&download.record.display_name()),
    );

    let length = download.range.map(|r| r.len()).unwrap_or(0);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    if let Some(range) = download.range {
        if let Ok(value) = HeaderValue::from_str(&range.content_range(download.total_size)) {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }
}

/// `attachment; filename=<name>`, falling back to a quoted ASCII name plus an
/// RFC 5987 `filename*` when the name is not a plain token.
fn content_disposition(name: &str) -> HeaderValue {
    let plain = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && !matches!(b, b'"' | b'\\' | b';' | b','));

    let value = if plain {
        format!("attachment; filename={}", name)
    } else {
        let fallback: String = name
            .chars()
            .map(|c| match c {
                ' ' => ' ',
                '"' | '\\' => '_',
                c if c.is_ascii_graphic() => c,
                _ => '_',
            })
            .collect();
        format!(
            "attachment; filename=\"{}\"; filename*=UTF-8''{}",
            fallback,
            urlencoding::encode(name)
        )
    };

    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}
