use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What is known about one manifest pushed to one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Repository name, e.g. `library/alpine`.
    pub repository: String,

    /// Manifest digest, e.g. `sha256:...`.
    pub digest: String,

    /// Tags currently pointing at this manifest.
    pub tags: BTreeSet<String>,

    /// Total size of the image: config plus layers.
    pub size: u64,

    /// Manifest media type.
    pub media_type: String,

    /// Subject that first pushed this manifest.
    pub owner: String,

    /// Free-form labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Whether the image is hidden from anonymous callers.
    #[serde(default)]
    pub private: bool,

    /// When the record was created
    pub created: DateTime<Utc>,

    /// When the record was last changed
    pub updated: DateTime<Utc>,
}

impl ImageMetadata {
    /// A fresh record with no tags.
    pub fn new(
        repository: impl Into<String>,
        digest: impl Into<String>,
        media_type: impl Into<String>,
        size: u64,
        owner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            repository: repository.into(),
            digest: digest.into(),
            tags: BTreeSet::new(),
            size,
            media_type: media_type.into(),
            owner: owner.into(),
            labels: BTreeMap::new(),
            private: false,
            created: now,
            updated: now,
        }
    }

    /// Mark the record as changed now.
    pub fn touch(&mut self) {
        self.updated = Utc::now();
    }
}
