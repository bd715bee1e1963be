//! Storage layer for the registry
//!
//! Layout under the store root:
//!
//! ```text
//! blobs/sha256/<aa>/<hex>/data
//! repositories/<name>/_layers/sha256/<hex>/link
//! repositories/<name>/_manifests/revisions/sha256/<hex>/data
//! repositories/<name>/_manifests/tags/<tag>/link
//! uploads/<session>/data
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use storage::{ByteRange, Metadata, Storage};
use tokio::io::AsyncWrite;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

const BLOBS: &str = "blobs";
const REPOSITORIES: &str = "repositories";
const UPLOADS: &str = "uploads";
const LAYERS: &str = "_layers";
const MANIFESTS: &str = "_manifests";

fn blob_path(digest: &Digest) -> Utf8PathBuf {
    let hex = digest.hex();
    Utf8PathBuf::from(format!(
        "{BLOBS}/{}/{}/{hex}/data",
        digest.algorithm(),
        &hex[..2]
    ))
}

fn repository_path(repository: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{REPOSITORIES}/{repository}"))
}

fn layer_link_path(repository: &str, digest: &Digest) -> Utf8PathBuf {
    repository_path(repository).join(format!(
        "{LAYERS}/{}/{}/link",
        digest.algorithm(),
        digest.hex()
    ))
}

fn revisions_path(repository: &str) -> Utf8PathBuf {
    repository_path(repository).join(format!("{MANIFESTS}/revisions/sha256"))
}

fn manifest_path(repository: &str, digest: &Digest) -> Utf8PathBuf {
    revisions_path(repository).join(format!("{}/data", digest.hex()))
}

fn tags_path(repository: &str) -> Utf8PathBuf {
    repository_path(repository).join(format!("{MANIFESTS}/tags"))
}

fn tag_path(repository: &str, tag: &str) -> Utf8PathBuf {
    tags_path(repository).join(format!("{tag}/link"))
}

pub(crate) fn upload_dir(session: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{UPLOADS}/{session}"))
}

pub(crate) fn upload_path(session: &str) -> Utf8PathBuf {
    upload_dir(session).join("data")
}

/// Content-addressed blob, manifest and tag storage.
///
/// Operations which create references (layer links, manifests, tags) hold
/// the shared side of a reference lock, and garbage collection holds the
/// exclusive side, so a collection's reference scan never races a push.
#[derive(Clone, Debug)]
pub struct RegistryStorage {
    storage: Storage,
    references: Arc<RwLock<()>>,
}

impl RegistryStorage {
    /// Create a new registry storage
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            references: Arc::new(RwLock::new(())),
        }
    }

    /// The underlying store.
    pub(crate) fn inner(&self) -> &Storage {
        &self.storage
    }

    /// Hold while creating references.
    pub(crate) async fn referencing(&self) -> RwLockReadGuard<'_, ()> {
        self.references.read().await
    }

    /// Hold while scanning for and removing references.
    pub(crate) async fn collecting(&self) -> RwLockWriteGuard<'_, ()> {
        self.references.write().await
    }

    async fn prune(&self, path: &Utf8Path, stop: &str) {
        if let Some(parent) = path.parent() {
            if let Err(error) = self.storage.prune(parent, Utf8Path::new(stop)).await {
                tracing::warn!(%path, %error, "Failed to prune empty directories");
            }
        }
    }

    async fn read_link(&self, path: &Utf8Path) -> Result<Digest, storage::StorageError> {
        let data = self.storage.read(path).await?;
        String::from_utf8_lossy(&data)
            .trim()
            .parse()
            .map_err(|error: RegistryError| {
                storage::StorageError::builder(
                    "registry",
                    storage::StorageErrorKind::Other,
                    error,
                )
                .path(path.as_str())
                .context("corrupt link file")
                .build()
            })
    }

    // Blobs

    /// Check if a blob exists anywhere in the store
    pub async fn blob_exists(&self, digest: &Digest) -> RegistryResult<bool> {
        Ok(self.storage.exists(&blob_path(digest)).await?)
    }

    /// Size and creation time of a blob
    pub async fn blob_metadata(&self, digest: &Digest) -> RegistryResult<Metadata> {
        self.storage
            .metadata(&blob_path(digest))
            .await
            .map_err(|error| {
                RegistryError::or_not_found(error, || RegistryError::BlobNotFound(digest.to_string()))
            })
    }

    /// Stream a blob, or part of one, into `writer`.
    pub async fn download_blob<W>(
        &self,
        digest: &Digest,
        range: Option<ByteRange>,
        writer: &mut W,
    ) -> RegistryResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let path = blob_path(digest);
        let result = match range {
            Some(range) => self.storage.download_range(&path, range, writer).await,
            None => self.storage.download(&path, writer).await,
        };
        result.map_err(|error| {
            RegistryError::or_not_found(error, || RegistryError::BlobNotFound(digest.to_string()))
        })
    }

    /// Move verified upload data into the blob's content-addressed path.
    /// If the blob already exists the upload data is discarded instead.
    pub(crate) async fn commit_blob(&self, upload: &Utf8Path, digest: &Digest) -> RegistryResult<()> {
        let path = blob_path(digest);
        if self.storage.exists(&path).await? {
            tracing::debug!(%digest, "Blob already present");
            self.storage.delete(upload).await?;
        } else {
            self.storage.rename(upload, &path).await?;
        }
        Ok(())
    }

    /// Remove a blob's data.
    pub(crate) async fn delete_blob_data(&self, digest: &Digest) -> RegistryResult<()> {
        let path = blob_path(digest);
        self.storage.delete(&path).await.map_err(|error| {
            RegistryError::or_not_found(error, || RegistryError::BlobNotFound(digest.to_string()))
        })?;
        self.prune(&path, BLOBS).await;
        Ok(())
    }

    // Layer links

    /// Whether `repository` links the blob.
    pub async fn layer_linked(&self, repository: &str, digest: &Digest) -> RegistryResult<bool> {
        Ok(self
            .storage
            .exists(&layer_link_path(repository, digest))
            .await?)
    }

    /// Link a blob into a repository. Callers hold [`RegistryStorage::referencing`].
    pub(crate) async fn link_layer(&self, repository: &str, digest: &Digest) -> RegistryResult<()> {
        self.storage
            .write(
                &layer_link_path(repository, digest),
                digest.to_string().as_bytes(),
            )
            .await?;
        Ok(())
    }

    /// Remove a repository's link to a blob.
    pub(crate) async fn unlink_layer(&self, repository: &str, digest: &Digest) -> RegistryResult<()> {
        let path = layer_link_path(repository, digest);
        self.storage.delete(&path).await.map_err(|error| {
            RegistryError::or_not_found(error, || RegistryError::BlobNotFound(digest.to_string()))
        })?;
        self.prune(&path, REPOSITORIES).await;
        Ok(())
    }

    /// Repositories holding a link to the blob.
    pub async fn linking_repositories(&self, digest: &Digest) -> RegistryResult<Vec<String>> {
        let mut linking = Vec::new();
        for repository in self.repositories().await? {
            if self.layer_linked(&repository, digest).await? {
                linking.push(repository);
            }
        }
        Ok(linking)
    }

    // Repositories

    /// Walk `repositories/`, grouping files by repository name and the
    /// `_layers` or `_manifests` section they sit in.
    async fn scan(&self) -> RegistryResult<BTreeMap<String, BTreeSet<String>>> {
        let files = self.storage.list(Utf8Path::new(REPOSITORIES)).await?;
        let mut repositories: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for file in files {
            let Ok(rest) = file.strip_prefix(REPOSITORIES) else {
                continue;
            };
            let mut name = Vec::new();
            for component in rest.iter() {
                if component.starts_with('_') {
                    if !name.is_empty() {
                        repositories
                            .entry(name.join("/"))
                            .or_default()
                            .insert(component.to_owned());
                    }
                    break;
                }
                name.push(component);
            }
        }
        Ok(repositories)
    }

    /// Every repository with at least one layer link, manifest or tag.
    pub async fn repositories(&self) -> RegistryResult<Vec<String>> {
        Ok(self.scan().await?.into_keys().collect())
    }

    /// Repositories holding at least one manifest revision or tag, sorted.
    pub async fn catalog(&self) -> RegistryResult<Vec<String>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter(|(_, sections)| sections.contains(MANIFESTS))
            .map(|(name, _)| name)
            .collect())
    }

    /// Whether anything is stored for `repository`.
    pub async fn repository_exists(&self, repository: &str) -> RegistryResult<bool> {
        Ok(!self
            .storage
            .children(&repository_path(repository))
            .await?
            .is_empty())
    }

    // Manifests

    /// Whether the manifest revision exists in `repository`.
    pub async fn manifest_exists(&self, repository: &str, digest: &Digest) -> RegistryResult<bool> {
        Ok(self
            .storage
            .exists(&manifest_path(repository, digest))
            .await?)
    }

    /// Read a manifest by digest.
    pub async fn read_manifest(&self, repository: &str, digest: &Digest) -> RegistryResult<Vec<u8>> {
        self.storage
            .read(&manifest_path(repository, digest))
            .await
            .map_err(|error| {
                RegistryError::or_not_found(error, || {
                    RegistryError::ManifestNotFound(format!("{repository}@{digest}"))
                })
            })
    }

    /// Store manifest bytes under their digest. Callers hold
    /// [`RegistryStorage::referencing`].
    pub(crate) async fn write_manifest(
        &self,
        repository: &str,
        digest: &Digest,
        data: &[u8],
    ) -> RegistryResult<()> {
        self.storage
            .write(&manifest_path(repository, digest), data)
            .await?;
        Ok(())
    }

    /// Remove a manifest revision.
    pub(crate) async fn delete_manifest_data(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> RegistryResult<()> {
        let path = manifest_path(repository, digest);
        self.storage.delete(&path).await.map_err(|error| {
            RegistryError::or_not_found(error, || {
                RegistryError::ManifestNotFound(format!("{repository}@{digest}"))
            })
        })?;
        self.prune(&path, REPOSITORIES).await;
        Ok(())
    }

    /// Digests of every manifest revision in `repository`.
    pub async fn manifest_digests(&self, repository: &str) -> RegistryResult<Vec<Digest>> {
        let names = self.storage.children(&revisions_path(repository)).await?;
        Ok(names
            .into_iter()
            .filter_map(|hex| match format!("sha256:{hex}").parse() {
                Ok(digest) => Some(digest),
                Err(_) => {
                    tracing::warn!(%repository, %hex, "Ignoring stray manifest revision");
                    None
                }
            })
            .collect())
    }

    // Tags

    /// Resolve a tag to the digest it points at.
    pub async fn resolve_tag(&self, repository: &str, tag: &str) -> RegistryResult<Digest> {
        self.read_link(&tag_path(repository, tag))
            .await
            .map_err(|error| {
                RegistryError::or_not_found(error, || {
                    RegistryError::ManifestNotFound(format!("{repository}:{tag}"))
                })
            })
    }

    /// Point a tag at a digest. Callers hold [`RegistryStorage::referencing`].
    pub(crate) async fn write_tag(
        &self,
        repository: &str,
        tag: &str,
        digest: &Digest,
    ) -> RegistryResult<()> {
        self.storage
            .write(&tag_path(repository, tag), digest.to_string().as_bytes())
            .await?;
        Ok(())
    }

    /// Remove a tag pointer.
    pub(crate) async fn delete_tag_link(&self, repository: &str, tag: &str) -> RegistryResult<()> {
        let path = tag_path(repository, tag);
        self.storage.delete(&path).await.map_err(|error| {
            RegistryError::or_not_found(error, || {
                RegistryError::ManifestNotFound(format!("{repository}:{tag}"))
            })
        })?;
        self.prune(&path, REPOSITORIES).await;
        Ok(())
    }

    /// List tags for a repository, sorted
    pub async fn list_tags(&self, repository: &str) -> RegistryResult<Vec<String>> {
        Ok(self.storage.children(&tags_path(repository)).await?)
    }

    /// Tags in `repository` which resolve to `digest`.
    pub async fn tags_pointing_at(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> RegistryResult<Vec<String>> {
        let mut tags = Vec::new();
        for tag in self.list_tags(repository).await? {
            match self.resolve_tag(repository, &tag).await {
                Ok(target) if &target == digest => tags.push(tag),
                Ok(_) => {}
                Err(RegistryError::ManifestNotFound(_)) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(tags)
    }
}
