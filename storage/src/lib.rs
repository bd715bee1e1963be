//! # Storage backends
//!
//! Configuration and unification for the storage backends.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tokio::io;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{ByteRange, Driver, Metadata, StorageError, StorageErrorKind};

/// Which storage backend to use, as read from the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep everything in memory. Contents are lost on restart.
    Memory,

    /// Store files under a directory on the local file system.
    #[cfg(feature = "local")]
    Local {
        /// Root directory for the store.
        path: Utf8PathBuf,
    },

    /// Store files in a temporary directory, removed on shutdown.
    #[cfg(feature = "tmp")]
    Temp,
}

impl StorageConfig {
    /// Construct the configured backend.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory => MemoryStorage::new().into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => LocalDriver::new(path).into(),
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => TempDriver::new()
                .map_err(StorageError::with("temp", StorageErrorKind::Io))?
                .into(),
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cheaply cloneable handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(remote).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn exists(&self, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.driver.exists(remote).await
    }

    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name()))]
    pub async fn download<'d, W>(
        &'d self,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + 'd,
    {
        tracing::trace!(%remote, "Downloading from: {remote}");
        self.driver.download(remote, writer).await
    }

    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name(), %range))]
    pub async fn download_range<'d, W>(
        &'d self,
        remote: &Utf8Path,
        range: ByteRange,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + 'd,
    {
        self.driver.download_range(remote, range, writer).await
    }

    /// Read a whole file into memory.
    pub async fn read(&self, remote: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        let mut buf = Vec::new();
        self.download(remote, &mut buf).await?;
        Ok(buf)
    }

    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name()))]
    pub async fn upload<'d, R>(&'d self, remote: &Utf8Path, reader: &mut R) -> Result<u64, StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {remote}");
        self.driver.upload(remote, reader).await
    }

    /// Write a whole file from memory, replacing any existing content.
    pub async fn write(&self, remote: &Utf8Path, mut contents: &[u8]) -> Result<u64, StorageError> {
        self.upload(remote, &mut contents).await
    }

    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name()))]
    pub async fn append<'d, R>(&'d self, remote: &Utf8Path, reader: &mut R) -> Result<u64, StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + 'd,
    {
        self.driver.append(remote, reader).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.driver.rename(from, to).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(path).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn delete_dir(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete_dir(path).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn list(&self, prefix: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        self.driver.list(prefix).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn children(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError> {
        self.driver.children(prefix).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn prune(&self, path: &Utf8Path, stop: &Utf8Path) -> Result<(), StorageError> {
        self.driver.prune(path, stop).await
    }
}
