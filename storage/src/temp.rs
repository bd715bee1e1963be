use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{ByteRange, Driver, Metadata, Reader, StorageError, Writer};

/// A storage driver that stores files in a temporary directory.
///
/// The directory is removed when the driver is dropped.
#[derive(Debug)]
pub struct TempDriver {
    #[allow(unused)]
    dir: TempDir,
    driver: LocalDriver,
}

impl TempDriver {
    /// Create a new `TempDriver` instance, storing files in a temporary directory.
    pub fn new() -> io::Result<Self> {
        let tmp = TempDir::new()?;
        let root = Utf8Path::from_path(tmp.path())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "temp dir is not utf-8"))?
            .to_owned();

        Ok(Self {
            dir: tmp,
            driver: LocalDriver::new(root),
        })
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(remote).await
    }

    async fn upload(&self, remote: &Utf8Path, local: &mut Reader<'_>) -> Result<u64, StorageError> {
        self.driver.upload(remote, local).await
    }

    async fn append(&self, remote: &Utf8Path, local: &mut Reader<'_>) -> Result<u64, StorageError> {
        self.driver.append(remote, local).await
    }

    async fn download(&self, remote: &Utf8Path, local: &mut Writer<'_>) -> Result<(), StorageError> {
        self.driver.download(remote, local).await
    }

    async fn download_range(
        &self,
        remote: &Utf8Path,
        range: ByteRange,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.driver.download_range(remote, range, local).await
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.driver.rename(from, to).await
    }

    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(remote).await
    }

    async fn delete_dir(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete_dir(remote).await
    }

    async fn list(&self, prefix: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        self.driver.list(prefix).await
    }

    async fn children(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError> {
        self.driver.children(prefix).await
    }
}
