use crate::{range::RangeError, services::relay_service::RelayError};
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for request errors that keeps the message local.
///
/// Every error body rendered by the service has the shape `{"message": "..."}`.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Total object size, set for 416 responses so `Content-Range: bytes */N` can be emitted.
    pub unsatisfied_size: Option<u64>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            unsatisfied_size: None,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// 416 Range Not Satisfiable for an object of `size` bytes.
    pub fn range_not_satisfiable(msg: impl Into<String>, size: u64) -> Self {
        Self {
            status: StatusCode::RANGE_NOT_SATISFIABLE,
            message: msg.into(),
            unsatisfied_size: Some(size),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "message": self.message }));
        let mut response = (self.status, body).into_response();

        if let Some(size) = self.unsatisfied_size {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }

        response
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::EmptyBucketName => AppError::bad_request("BucketName can not be empty"),
            RelayError::InvalidBucketName { .. }
            | RelayError::MissingFile
            | RelayError::EmptyFileName
            | RelayError::InvalidFileName
            | RelayError::MissingIdentifier => AppError::bad_request(err.to_string()),
            RelayError::AlreadyExists { .. } => AppError::new(StatusCode::CONFLICT, err.to_string()),
            RelayError::NotFound(identifier) => AppError::not_found(identifier),
            RelayError::Range(RangeError::Unsatisfiable { size }) => {
                AppError::range_not_satisfiable(err.to_string(), size)
            }
            RelayError::Range(_) => AppError::bad_request(err.to_string()),
            RelayError::Identifier(_)
            | RelayError::Storage(_)
            | RelayError::Repository(_)
            | RelayError::Timeout(_) => AppError::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bucket_maps_to_bad_request_with_fixed_message() {
        let err = AppError::from(RelayError::EmptyBucketName);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "BucketName can not be empty");
    }

    #[test]
    fn not_found_carries_identifier_as_message() {
        let err = AppError::from(RelayError::NotFound("abc".into()));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "abc");
    }

    #[test]
    fn unsatisfiable_range_sets_content_range() {
        let err = AppError::from(RelayError::Range(RangeError::Unsatisfiable { size: 10 }));
        assert_eq!(err.status, StatusCode::RANGE_NOT_SATISFIABLE);

        let response = err.into_response();
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */10"
        );
    }

    #[test]
    fn existing_object_is_a_conflict() {
        let err = AppError::from(RelayError::AlreadyExists {
            bucket: "media".into(),
            key: "2024/01/01/a.txt".into(),
        });
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.message, "file `2024/01/01/a.txt` already exists in bucket `media`");
    }

    #[test]
    fn unusable_file_name_is_client_error() {
        let err = AppError::from(RelayError::InvalidFileName);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(!err.message.contains('/'));
    }

    #[test]
    fn malformed_range_is_client_error() {
        let err = AppError::from(RelayError::Range(RangeError::MultipleRanges));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
