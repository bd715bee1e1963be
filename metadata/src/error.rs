/// Errors from a metadata store.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// No user with this name.
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// No group with this name.
    #[error("group not found: {0}")]
    GroupNotFound(String),

    /// No role with this name.
    #[error("role not found: {0}")]
    RoleNotFound(String),

    /// No image record for this repository and digest.
    #[error("image not found: {repository}@{digest}")]
    ImageNotFound {
        /// Repository name
        repository: String,
        /// Manifest digest
        digest: String,
    },

    /// The backing store failed.
    #[error("metadata backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl MetadataError {
    /// Whether this error means a record is missing, as opposed to the store failing.
    pub fn is_not_found(&self) -> bool {
        !matches!(self, MetadataError::Backend(_))
    }
}
