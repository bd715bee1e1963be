//! Garbage collection on tag, manifest and blob deletion

use std::collections::BTreeSet;

use crate::digest::Digest;
use crate::document::ManifestDocument;
use crate::error::{RegistryError, RegistryResult};
use crate::images::ImageRecords;
use crate::storage::RegistryStorage;

/// Deletes tags, manifests and blobs, and removes whatever they leave
/// unreferenced.
///
/// Every operation holds the storage's exclusive reference lock, so no push
/// can add a link while a collection is deciding what is unreferenced.
#[derive(Debug, Clone)]
pub struct GarbageCollector {
    storage: RegistryStorage,
    images: ImageRecords,
}

impl GarbageCollector {
    /// A collector over `storage`, keeping `images` up to date.
    pub fn new(storage: RegistryStorage, images: ImageRecords) -> Self {
        Self { storage, images }
    }

    /// Remove a tag. If no other tag in the repository points at the same
    /// manifest, the manifest and its now-unreferenced blobs go too.
    #[tracing::instrument(skip(self))]
    pub async fn delete_tag(&self, repository: &str, tag: &str) -> RegistryResult<()> {
        let _exclusive = self.storage.collecting().await;

        let digest = self.storage.resolve_tag(repository, tag).await?;
        self.storage.delete_tag_link(repository, tag).await?;
        self.images.tag_removed(repository, tag, &digest).await?;

        let remaining = self.storage.tags_pointing_at(repository, &digest).await?;
        if !remaining.is_empty() {
            tracing::debug!(%digest, ?remaining, "Manifest still tagged");
            return Ok(());
        }

        self.cleanup(repository, &digest).await
    }

    /// Remove a manifest by digest along with every tag pointing at it.
    #[tracing::instrument(skip(self))]
    pub async fn delete_manifest(&self, repository: &str, digest: &Digest) -> RegistryResult<()> {
        let _exclusive = self.storage.collecting().await;

        if !self.storage.manifest_exists(repository, digest).await? {
            return Err(RegistryError::ManifestNotFound(format!(
                "{repository}@{digest}"
            )));
        }

        for tag in self.storage.tags_pointing_at(repository, digest).await? {
            self.storage.delete_tag_link(repository, &tag).await?;
            tracing::debug!(%tag, "Removed tag");
        }

        self.cleanup(repository, digest).await
    }

    /// Remove a blob from a repository, and from the store. Fails if any
    /// manifest in the repository or any other repository still references it.
    #[tracing::instrument(skip(self))]
    pub async fn delete_blob(&self, repository: &str, digest: &Digest) -> RegistryResult<()> {
        let _exclusive = self.storage.collecting().await;

        if !self.storage.layer_linked(repository, digest).await? {
            return Err(RegistryError::BlobNotFound(digest.to_string()));
        }

        if self
            .referenced_in(repository, None)
            .await?
            .contains(digest)
        {
            return Err(RegistryError::BlobInUse(digest.to_string()));
        }

        let others: Vec<String> = self
            .storage
            .linking_repositories(digest)
            .await?
            .into_iter()
            .filter(|name| name != repository)
            .collect();
        if !others.is_empty() {
            tracing::debug!(%digest, ?others, "Blob linked elsewhere");
            return Err(RegistryError::BlobInUse(digest.to_string()));
        }

        self.storage.unlink_layer(repository, digest).await?;
        self.storage.delete_blob_data(digest).await?;
        tracing::info!(%digest, "Blob deleted");
        Ok(())
    }

    /// Blobs referenced by the manifests in `repository`, except `skip`.
    async fn referenced_in(
        &self,
        repository: &str,
        skip: Option<&Digest>,
    ) -> RegistryResult<BTreeSet<Digest>> {
        let mut referenced = BTreeSet::new();
        for manifest in self.storage.manifest_digests(repository).await? {
            if Some(&manifest) == skip {
                continue;
            }
            let data = self.storage.read_manifest(repository, &manifest).await?;
            match ManifestDocument::parse(&data) {
                Ok(document) => referenced.extend(document.blob_digests()),
                Err(error) => {
                    tracing::warn!(%manifest, %error, "Unreadable manifest, ignoring its references")
                }
            }
        }
        Ok(referenced)
    }

    /// Remove a manifest and every blob it alone referenced.
    ///
    /// Per-blob failures are logged and skipped; the manifest itself is
    /// always removed.
    async fn cleanup(&self, repository: &str, digest: &Digest) -> RegistryResult<()> {
        let data = self.storage.read_manifest(repository, digest).await?;
        let blobs = match ManifestDocument::parse(&data) {
            Ok(document) => document.blob_digests(),
            Err(error) => {
                tracing::warn!(%digest, %error, "Unreadable manifest, leaving its blobs");
                Vec::new()
            }
        };

        let still_referenced = self.referenced_in(repository, Some(digest)).await?;

        for blob in blobs {
            if still_referenced.contains(&blob) {
                tracing::debug!(%blob, "Blob used by another manifest in the repository");
                continue;
            }
            if let Err(error) = self.release(repository, &blob).await {
                tracing::warn!(%blob, %error, "Failed to clean up blob, skipping");
            }
        }

        self.storage.delete_manifest_data(repository, digest).await?;
        self.images.manifest_removed(repository, digest).await?;
        tracing::info!(%repository, %digest, "Manifest removed");
        Ok(())
    }

    /// Unlink a blob from `repository` and delete it if no repository links it.
    async fn release(&self, repository: &str, blob: &Digest) -> RegistryResult<()> {
        match self.storage.unlink_layer(repository, blob).await {
            Ok(()) | Err(RegistryError::BlobNotFound(_)) => {}
            Err(error) => return Err(error),
        }

        let linking = self.storage.linking_repositories(blob).await?;
        if !linking.is_empty() {
            tracing::debug!(%blob, ?linking, "Blob still linked");
            return Ok(());
        }

        match self.storage.delete_blob_data(blob).await {
            Ok(()) => {
                tracing::debug!(%blob, "Blob deleted");
                Ok(())
            }
            Err(RegistryError::BlobNotFound(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }
}
