//! Keeping image records in the metadata store in step with manifests and tags

use std::sync::Arc;

use metadata::{ImageMetadata, MetadataStore};

use crate::digest::Digest;
use crate::document::ManifestDocument;
use crate::error::RegistryResult;

/// Writes [`ImageMetadata`] as manifests are pushed, retagged and removed.
///
/// A tag name belongs to at most one record per repository: moving a tag
/// removes it from the record it previously belonged to.
#[derive(Debug, Clone)]
pub struct ImageRecords {
    store: Arc<dyn MetadataStore>,
}

impl ImageRecords {
    /// Records kept in `store`.
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    async fn existing(
        &self,
        repository: &str,
        digest: &str,
    ) -> RegistryResult<Option<ImageMetadata>> {
        match self.store.image(repository, digest).await {
            Ok(image) => Ok(Some(image)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Record a manifest write, optionally under `tag`.
    #[tracing::instrument(skip(self, document))]
    pub async fn manifest_pushed(
        &self,
        repository: &str,
        digest: &Digest,
        document: &ManifestDocument,
        tag: Option<&str>,
        owner: &str,
    ) -> RegistryResult<()> {
        let digest = digest.to_string();

        if let Some(tag) = tag {
            if let Some(mut previous) = self.store.image_by_tag(repository, tag).await? {
                if previous.digest != digest {
                    tracing::debug!(from = %previous.digest, "Moving tag");
                    previous.tags.remove(tag);
                    previous.touch();
                    self.store.put_image(previous).await?;
                }
            }
        }

        let mut image = match self.existing(repository, &digest).await? {
            Some(image) => image,
            None => ImageMetadata::new(repository, &digest, document.media_type(), 0, owner),
        };
        image.size = document.total_size();
        image.media_type = document.media_type().to_owned();
        if let Some(tag) = tag {
            image.tags.insert(tag.to_owned());
        }
        image.touch();
        self.store.put_image(image).await?;
        Ok(())
    }

    /// Drop `tag` from the record for `digest`.
    #[tracing::instrument(skip(self))]
    pub async fn tag_removed(&self, repository: &str, tag: &str, digest: &Digest) -> RegistryResult<()> {
        if let Some(mut image) = self.existing(repository, &digest.to_string()).await? {
            if image.tags.remove(tag) {
                image.touch();
                self.store.put_image(image).await?;
            }
        }
        Ok(())
    }

    /// Delete the record for a removed manifest.
    #[tracing::instrument(skip(self))]
    pub async fn manifest_removed(&self, repository: &str, digest: &Digest) -> RegistryResult<()> {
        self.store
            .delete_image(repository, &digest.to_string())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use metadata::MemoryMetadataStore;

    use super::*;
    use crate::document::fixtures::image_manifest;

    fn document(seed: &[u8]) -> (Digest, ManifestDocument) {
        let config = Digest::of(seed);
        let layer = Digest::of(b"layer");
        let body = image_manifest((&config, 10), &[(&layer, 90)]);
        (Digest::of(&body), ManifestDocument::parse(&body).unwrap())
    }

    #[tokio::test]
    async fn repush_does_not_duplicate_tags() {
        let records = ImageRecords::new(Arc::new(MemoryMetadataStore::new()));
        let (digest, doc) = document(b"a");

        for _ in 0..2 {
            records
                .manifest_pushed("app", &digest, &doc, Some("v1"), "alice")
                .await
                .unwrap();
        }

        let image = records
            .store()
            .image("app", &digest.to_string())
            .await
            .unwrap();
        assert_eq!(image.tags.len(), 1);
        assert_eq!(image.size, 100);
        assert_eq!(image.owner, "alice");
    }

    #[tokio::test]
    async fn moving_a_tag_removes_it_from_previous_record() {
        let records = ImageRecords::new(Arc::new(MemoryMetadataStore::new()));
        let (first, first_doc) = document(b"a");
        let (second, second_doc) = document(b"b");

        records
            .manifest_pushed("app", &first, &first_doc, Some("latest"), "alice")
            .await
            .unwrap();
        records
            .manifest_pushed("app", &second, &second_doc, Some("latest"), "bob")
            .await
            .unwrap();

        let store = records.store();
        assert!(store.image("app", &first.to_string()).await.unwrap().tags.is_empty());
        let owner = store.image_by_tag("app", "latest").await.unwrap().unwrap();
        assert_eq!(owner.digest, second.to_string());

        records.tag_removed("app", "latest", &second).await.unwrap();
        assert!(store.image_by_tag("app", "latest").await.unwrap().is_none());

        records.manifest_removed("app", &second).await.unwrap();
        assert!(store.image("app", &second.to_string()).await.is_err());
    }
}
