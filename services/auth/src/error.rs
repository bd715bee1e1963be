//! Error types for token issuance and validation

use camino::Utf8PathBuf;

/// Errors from the token service and permission checks.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Unknown user or wrong password.
    #[error("invalid username or password")]
    InvalidCredentials,

    /// The token could not be decoded or its signature did not verify.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The token is past its expiry.
    #[error("token expired")]
    TokenExpired,

    /// The token has been revoked.
    #[error("token revoked")]
    Revoked,

    /// The token claims to have been issued in the future.
    #[error("token issued in the future")]
    FutureIssued,

    /// The token's not-before time has not arrived.
    #[error("token not yet valid")]
    NotYetValid,

    /// No usable grant could be read from the requested scope.
    #[error("invalid scope: {0}")]
    InvalidScope(String),

    /// The identity lacks the permission.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No credentials were supplied, and anonymous access is disabled.
    #[error("authentication required")]
    Unauthorized,

    /// The token service configuration is unusable.
    #[error("invalid auth configuration: {0}")]
    InvalidConfig(String),

    /// A signing or verification key could not be read.
    #[error("reading key {path}")]
    KeyFile {
        /// Path to the key
        path: Utf8PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A key could not be parsed, or a token could not be signed.
    #[error("signing: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    /// The metadata store failed.
    #[error("metadata: {0}")]
    Metadata(#[from] metadata::MetadataError),
}

impl AuthError {
    /// Whether the caller should be asked to authenticate (as opposed to being refused).
    pub fn is_challenge(&self) -> bool {
        !matches!(
            self,
            AuthError::Forbidden(_)
                | AuthError::InvalidConfig(_)
                | AuthError::KeyFile { .. }
                | AuthError::Signing(_)
        )
    }
}
