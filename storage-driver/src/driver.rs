use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for file contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + 'r;

/// A writer stream for file contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + 'w;

/// File object metadata, which will be generically provided by the driver.
///
/// This struct only provides common metadata fields, and drivers may provide more specific
/// metadata fields directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the file in bytes.
    pub size: u64,

    /// The creation timestamp of the file.
    pub created: DateTime<Utc>,
}

/// An inclusive byte range within a stored object.
///
/// `end` is optional so that `bytes=100-` style requests read to the end of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte to read.
    pub start: u64,

    /// Last byte to read (inclusive), or `None` for the rest of the object.
    pub end: Option<u64>,
}

impl ByteRange {
    /// Resolve this range against an object of `size` bytes, returning the
    /// inclusive `(start, end)` pair, or `None` when the range cannot be satisfied.
    pub fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        if size == 0 || self.start >= size {
            return None;
        }
        let end = self.end.map(|end| end.min(size - 1)).unwrap_or(size - 1);
        if end < self.start {
            return None;
        }
        Some((self.start, end))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}-{}", self.start, end),
            None => write!(f, "{}-", self.start),
        }
    }
}

/// A storage driver, which provides the ability to interact with a storage backend.
///
/// All paths are relative to the driver's root. Directories are implicit: writing
/// a file creates whatever parents it needs.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Get the metadata for a file, by path.
    async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Upload a file to the storage, replacing any existing content.
    ///
    /// Returns the number of bytes written.
    async fn upload(&self, remote: &Utf8Path, reader: &mut Reader<'_>)
        -> Result<u64, StorageError>;

    /// Append to a file, creating it if it does not exist.
    ///
    /// Returns the total size of the file after the append.
    async fn append(&self, remote: &Utf8Path, reader: &mut Reader<'_>)
        -> Result<u64, StorageError>;

    /// Download a file from storage, into a writer stream.
    async fn download(&self, remote: &Utf8Path, writer: &mut Writer<'_>)
        -> Result<(), StorageError>;

    /// Download part of a file from storage, into a writer stream.
    async fn download_range(
        &self,
        remote: &Utf8Path,
        range: ByteRange,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError>;

    /// Move a file from one path to another. The destination is replaced if it exists.
    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError>;

    /// Delete a file from the storage, by path.
    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Delete a directory and everything beneath it.
    ///
    /// Deleting a directory which does not exist is not an error.
    async fn delete_dir(&self, remote: &Utf8Path) -> Result<(), StorageError>;

    /// List every file beneath a prefix, recursively.
    ///
    /// A prefix which does not exist yields an empty list.
    async fn list(&self, prefix: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError>;

    /// List the immediate children (files and directories) of a directory, by name.
    ///
    /// A directory which does not exist yields an empty list.
    async fn children(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError>;

    /// Check whether a file exists.
    async fn exists(&self, remote: &Utf8Path) -> Result<bool, StorageError> {
        match self.metadata(remote).await {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == StorageErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Remove empty directories starting at `remote` and walking upwards, stopping
    /// before `stop` or at the first directory which still has children.
    async fn prune(&self, remote: &Utf8Path, stop: &Utf8Path) -> Result<(), StorageError> {
        let mut current = Some(remote);
        while let Some(dir) = current {
            if dir == stop || !dir.starts_with(stop) || dir.as_str().is_empty() {
                break;
            }
            if !self.children(dir).await?.is_empty() {
                break;
            }
            tracing::trace!(%dir, "Pruning empty directory");
            self.delete_dir(dir).await?;
            current = dir.parent();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);

    #[test]
    fn byte_range_resolves_against_size() {
        let range = ByteRange {
            start: 10,
            end: Some(19),
        };
        assert_eq!(range.resolve(100), Some((10, 19)));
        assert_eq!(range.resolve(15), Some((10, 14)));
        assert_eq!(range.resolve(10), None);

        let open = ByteRange {
            start: 90,
            end: None,
        };
        assert_eq!(open.resolve(100), Some((90, 99)));
        assert_eq!(open.to_string(), "90-");
    }

    #[test]
    fn byte_range_rejects_inverted() {
        let range = ByteRange {
            start: 20,
            end: Some(10),
        };
        assert_eq!(range.resolve(100), None);
    }
}
