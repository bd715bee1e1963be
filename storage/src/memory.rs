use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::RwLock,
};

use storage_driver::{
    ByteRange, Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer,
};

const ENGINE: &str = "memory";

fn io_error_to_storage(err: std::io::Error) -> StorageError {
    StorageError::new(ENGINE, StorageErrorKind::from_io(err.kind()), err)
}

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl AsRef<[u8]> for MemoryFileItem {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

/// Storage driver that stores files in memory.
///
/// Directories are implied by the paths of the stored files, so an empty
/// directory can never be observed.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: RwLock<BTreeMap<Utf8PathBuf, MemoryFileItem>>,
}

impl MemoryStorage {
    /// Create a new, empty `MemoryStorage` instance.
    pub fn new() -> Self {
        Self::default()
    }
}

async fn read_all(reader: &mut Reader<'_>) -> Result<Vec<u8>, StorageError> {
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .map_err(io_error_to_storage)?;
    Ok(buf)
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let files = self.files.read().await;
        Ok(files
            .get(remote)
            .ok_or_else(|| StorageError::not_found(ENGINE, remote.as_str()))?
            .into())
    }

    async fn upload(&self, remote: &Utf8Path, local: &mut Reader<'_>) -> Result<u64, StorageError> {
        let buf = read_all(local).await?;
        let size = buf.len() as u64;

        let mut files = self.files.write().await;
        files.insert(remote.to_owned(), buf.into());

        Ok(size)
    }

    async fn append(&self, remote: &Utf8Path, local: &mut Reader<'_>) -> Result<u64, StorageError> {
        let buf = read_all(local).await?;

        let mut files = self.files.write().await;
        let item = files
            .entry(remote.to_owned())
            .or_insert_with(|| Vec::new().into());
        item.data.extend_from_slice(&buf);
        Ok(item.data.len() as u64)
    }

    async fn download(&self, remote: &Utf8Path, local: &mut Writer<'_>) -> Result<(), StorageError> {
        let files = self.files.read().await;
        let data = files
            .get(remote)
            .ok_or_else(|| StorageError::not_found(ENGINE, remote.as_str()))?
            .as_ref();

        local.write_all(data).await.map_err(io_error_to_storage)?;
        local.flush().await.map_err(io_error_to_storage)?;

        Ok(())
    }

    async fn download_range(
        &self,
        remote: &Utf8Path,
        range: ByteRange,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let files = self.files.read().await;
        let data = files
            .get(remote)
            .ok_or_else(|| StorageError::not_found(ENGINE, remote.as_str()))?
            .as_ref();

        let size = data.len() as u64;
        let (start, end) = range.resolve(size).ok_or_else(|| {
            StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                format!("range {range} not satisfiable for {size} bytes"),
            )
            .path(remote.as_str())
            .build()
        })?;

        local
            .write_all(&data[start as usize..=end as usize])
            .await
            .map_err(io_error_to_storage)?;
        local.flush().await.map_err(io_error_to_storage)?;
        Ok(())
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        let item = files
            .remove(from)
            .ok_or_else(|| StorageError::not_found(ENGINE, from.as_str()))?;
        files.insert(to.to_owned(), item);
        Ok(())
    }

    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        files
            .remove(remote)
            .ok_or_else(|| StorageError::not_found(ENGINE, remote.as_str()))?;
        Ok(())
    }

    async fn delete_dir(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        files.retain(|path, _| !(path.starts_with(remote) && path.as_path() != remote));
        Ok(())
    }

    async fn list(&self, prefix: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        tracing::trace!(%prefix, "list memory storage");

        let files = self.files.read().await;
        Ok(files
            .keys()
            .filter(|path| path.starts_with(prefix) && path.as_path() != prefix)
            .cloned()
            .collect())
    }

    async fn children(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError> {
        let files = self.files.read().await;
        let names: BTreeSet<String> = files
            .keys()
            .filter_map(|path| path.strip_prefix(prefix).ok())
            .filter_map(|rest| rest.components().next())
            .map(|name| name.as_str().to_owned())
            .collect();
        Ok(names.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let storage = MemoryStorage::new();
        let err = storage
            .metadata(Utf8Path::new("blobs/nothing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!storage.exists(Utf8Path::new("blobs/nothing")).await.unwrap());
    }

    #[tokio::test]
    async fn append_and_range() {
        let storage = MemoryStorage::new();
        let path = Utf8Path::new("uploads/u/data");
        assert_eq!(storage.append(path, &mut &b"abc"[..]).await.unwrap(), 3);
        assert_eq!(storage.append(path, &mut &b"def"[..]).await.unwrap(), 6);

        let mut buf = Vec::new();
        storage
            .download_range(
                path,
                ByteRange {
                    start: 1,
                    end: Some(3),
                },
                &mut buf,
            )
            .await
            .unwrap();
        assert_eq!(buf, b"bcd");
    }

    #[tokio::test]
    async fn directories_are_implicit() {
        let storage = MemoryStorage::new();
        for path in ["r/a/_layers/x", "r/a/_manifests/y", "r/b/_layers/z"] {
            storage
                .upload(Utf8Path::new(path), &mut &b"."[..])
                .await
                .unwrap();
        }

        assert_eq!(
            storage.children(Utf8Path::new("r")).await.unwrap(),
            vec!["a".to_owned(), "b".to_owned()]
        );
        assert_eq!(storage.list(Utf8Path::new("r/a")).await.unwrap().len(), 2);

        storage.delete_dir(Utf8Path::new("r/a")).await.unwrap();
        assert_eq!(
            storage.children(Utf8Path::new("r")).await.unwrap(),
            vec!["b".to_owned()]
        );
        assert!(storage.list(Utf8Path::new("r/a")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rename_moves_content() {
        let storage = MemoryStorage::new();
        storage
            .upload(Utf8Path::new("from"), &mut &b"moved"[..])
            .await
            .unwrap();
        storage
            .rename(Utf8Path::new("from"), Utf8Path::new("to/here"))
            .await
            .unwrap();

        let mut buf = Vec::new();
        storage
            .download(Utf8Path::new("to/here"), &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"moved");
        assert!(storage
            .metadata(Utf8Path::new("from"))
            .await
            .unwrap_err()
            .is_not_found());
    }
}
