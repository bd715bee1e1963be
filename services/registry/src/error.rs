//! Error types for the registry

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found, or not linked into the repository
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Blob is still referenced and cannot be deleted
    #[error("blob is still referenced: {0}")]
    BlobInUse(String),

    /// Unknown upload session
    #[error("blob upload unknown: {0}")]
    BlobUploadUnknown(String),

    /// Blob upload invalid
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Repository not found
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Unsupported manifest media type
    #[error("unsupported manifest type: {0}")]
    UnsupportedManifestType(String),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Invalid tag name
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// Range not satisfiable
    #[error("range not satisfiable")]
    RangeNotSatisfiable,

    /// Malformed query parameters
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Operation not supported
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Missing or invalid credentials
    #[error("authentication required")]
    Unauthorized {
        /// `WWW-Authenticate` challenge
        challenge: Option<HeaderValue>,
    },

    /// Credentials do not allow the operation
    #[error("access denied")]
    Forbidden {
        /// `WWW-Authenticate` challenge
        challenge: Option<HeaderValue>,
    },

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Metadata store error
    #[error("metadata error: {0}")]
    Metadata(#[from] metadata::MetadataError),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobNotFound(_)
            | RegistryError::BlobUploadUnknown(_)
            | RegistryError::ManifestNotFound(_)
            | RegistryError::RepositoryNotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidDigest(_)
            | RegistryError::InvalidManifest(_)
            | RegistryError::UnsupportedManifestType(_)
            | RegistryError::InvalidRepository(_)
            | RegistryError::InvalidTag(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::InvalidQuery(_)
            | RegistryError::BlobUploadInvalid(_) => StatusCode::BAD_REQUEST,
            RegistryError::BlobInUse(_) => StatusCode::CONFLICT,
            RegistryError::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            RegistryError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            RegistryError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            RegistryError::Forbidden { .. } => StatusCode::FORBIDDEN,
            RegistryError::Storage(_) | RegistryError::Metadata(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::BlobInUse(_) => "DENIED",
            RegistryError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::BlobUploadInvalid(_) => "BLOB_UPLOAD_INVALID",
            RegistryError::ManifestNotFound(_) => "MANIFEST_UNKNOWN",
            RegistryError::RepositoryNotFound(_) => "NAME_UNKNOWN",
            RegistryError::InvalidDigest(_) | RegistryError::DigestMismatch { .. } => {
                "DIGEST_INVALID"
            }
            RegistryError::InvalidManifest(_) | RegistryError::UnsupportedManifestType(_) => {
                "MANIFEST_INVALID"
            }
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::InvalidTag(_) => "TAG_INVALID",
            RegistryError::RangeNotSatisfiable => "RANGE_INVALID",
            RegistryError::InvalidQuery(_) | RegistryError::Unsupported(_) => "UNSUPPORTED",
            RegistryError::Unauthorized { .. } => "UNAUTHORIZED",
            RegistryError::Forbidden { .. } => "DENIED",
            RegistryError::Storage(_) | RegistryError::Metadata(_) => "UNKNOWN",
        }
    }

    /// Map a storage error, turning `NotFound` into the given protocol error.
    pub(crate) fn or_not_found(
        error: storage::StorageError,
        not_found: impl FnOnce() -> RegistryError,
    ) -> RegistryError {
        if error.is_not_found() {
            not_found()
        } else {
            RegistryError::Storage(error)
        }
    }

    fn detail(&self) -> serde_json::Value {
        match self {
            RegistryError::DigestMismatch { expected, actual } => {
                serde_json::json!({ "expected": expected, "actual": actual })
            }
            RegistryError::BlobNotFound(digest) | RegistryError::BlobInUse(digest) => {
                serde_json::json!({ "digest": digest })
            }
            RegistryError::RepositoryNotFound(name) | RegistryError::InvalidRepository(name) => {
                serde_json::json!({ "name": name })
            }
            _ => serde_json::Value::Null,
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
pub(crate) struct ErrorResponse {
    pub(crate) errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
pub(crate) struct ErrorDetail {
    pub(crate) code: &'static str,
    pub(crate) message: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub(crate) detail: serde_json::Value,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Registry request failed");
        } else {
            tracing::debug!(error = %self, "Registry request rejected");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code: self.error_code(),
                message: self.to_string(),
                detail: self.detail(),
            }],
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let RegistryError::Unauthorized {
            challenge: Some(challenge),
        }
        | RegistryError::Forbidden {
            challenge: Some(challenge),
        } = self
        {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, challenge);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses() {
        let err = RegistryError::DigestMismatch {
            expected: "sha256:aa".into(),
            actual: "sha256:bb".into(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "DIGEST_INVALID");

        let err = RegistryError::RepositoryNotFound("app".into());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.error_code(), "NAME_UNKNOWN");

        let err = RegistryError::BlobInUse("sha256:aa".into());
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn challenge_header_is_attached() {
        let challenge = HeaderValue::from_static("Bearer realm=\"r\",service=\"s\"");
        let response = RegistryError::Unauthorized {
            challenge: Some(challenge.clone()),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE),
            Some(&challenge)
        );
    }

    #[test]
    fn storage_not_found_maps_to_protocol_error() {
        let err = storage::StorageError::not_found("memory", "blobs/x");
        let mapped = RegistryError::or_not_found(err, || RegistryError::BlobNotFound("x".into()));
        assert!(matches!(mapped, RegistryError::BlobNotFound(_)));

        let err = storage::StorageError::new(
            "memory",
            storage::StorageErrorKind::PermissionDenied,
            std::io::Error::other("nope"),
        );
        let mapped = RegistryError::or_not_found(err, || RegistryError::BlobNotFound("x".into()));
        assert_eq!(mapped.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
