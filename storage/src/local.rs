use std::io::SeekFrom;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use eyre::Context;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::Instrument;

use storage_driver::{
    ByteRange, Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer,
};

const ENGINE: &str = "local";

/// Storage driver backed by a directory on the local file system.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`. The directory is created lazily.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        if remote
            .components()
            .any(|c| !matches!(c, Utf8Component::Normal(_)))
        {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                "paths must be relative and may not contain '..'",
            )
            .path(remote.as_str())
            .build());
        }
        Ok(self.root.join(remote))
    }

    async fn create_parent(&self, path: &Utf8Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StorageError::io(ENGINE, parent.as_str()))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(remote)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(StorageError::io(ENGINE, remote.as_str()))?;
        if metadata.is_dir() {
            return Err(StorageError::not_found(ENGINE, remote.as_str()));
        }

        // Not every file system records a birth time.
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(StorageError::io(ENGINE, remote.as_str()))?;
        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn upload(&self, remote: &Utf8Path, reader: &mut Reader<'_>) -> Result<u64, StorageError> {
        let path = self.path(remote)?;
        self.create_parent(&path).await?;

        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&path)
                .await
                .map_err(StorageError::io(ENGINE, remote.as_str()))?,
        );

        let written = tokio::io::copy(reader, &mut writer)
            .await
            .map_err(StorageError::io(ENGINE, remote.as_str()))?;

        writer
            .shutdown()
            .await
            .map_err(StorageError::io(ENGINE, remote.as_str()))?;
        Ok(written)
    }

    async fn append(&self, remote: &Utf8Path, reader: &mut Reader<'_>) -> Result<u64, StorageError> {
        let path = self.path(remote)?;
        self.create_parent(&path).await?;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(StorageError::io(ENGINE, remote.as_str()))?;
        let mut writer = tokio::io::BufWriter::new(file);

        tokio::io::copy(reader, &mut writer)
            .await
            .map_err(StorageError::io(ENGINE, remote.as_str()))?;
        writer
            .shutdown()
            .await
            .map_err(StorageError::io(ENGINE, remote.as_str()))?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(StorageError::io(ENGINE, remote.as_str()))?;
        Ok(metadata.len())
    }

    async fn download(&self, remote: &Utf8Path, local: &mut Writer<'_>) -> Result<(), StorageError> {
        let path = self.path(remote)?;

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(StorageError::io(ENGINE, remote.as_str()))?,
        );

        tokio::io::copy(&mut reader, local)
            .await
            .map_err(StorageError::io(ENGINE, remote.as_str()))?;

        local
            .flush()
            .await
            .map_err(StorageError::io(ENGINE, remote.as_str()))?;

        Ok(())
    }

    async fn download_range(
        &self,
        remote: &Utf8Path,
        range: ByteRange,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(remote)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(StorageError::io(ENGINE, remote.as_str()))?;
        let size = file
            .metadata()
            .await
            .map_err(StorageError::io(ENGINE, remote.as_str()))?
            .len();

        let (start, end) = range.resolve(size).ok_or_else(|| {
            StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                format!("range {range} not satisfiable for {size} bytes"),
            )
            .path(remote.as_str())
            .build()
        })?;

        file.seek(SeekFrom::Start(start))
            .await
            .map_err(StorageError::io(ENGINE, remote.as_str()))?;
        let mut reader = tokio::io::BufReader::new(file).take(end - start + 1);
        tokio::io::copy(&mut reader, local)
            .await
            .map_err(StorageError::io(ENGINE, remote.as_str()))?;
        local
            .flush()
            .await
            .map_err(StorageError::io(ENGINE, remote.as_str()))?;
        Ok(())
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let source = self.path(from)?;
        let target = self.path(to)?;
        self.create_parent(&target).await?;
        tokio::fs::rename(&source, &target)
            .await
            .map_err(StorageError::io(ENGINE, from.as_str()))?;
        Ok(())
    }

    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(remote)?;
        tokio::fs::remove_file(path)
            .await
            .map_err(StorageError::io(ENGINE, remote.as_str()))?;
        Ok(())
    }

    async fn delete_dir(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(remote)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(StorageError::io(ENGINE, remote.as_str())(error)),
        }
    }

    async fn list(&self, prefix: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        let root = self.root.clone();
        let target = self.path(prefix)?;

        let items = tokio::task::spawn_blocking(move || collect_list(&root, &target))
            .in_current_span()
            .await
            .wrap_err("local driver: list task")
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Other))?
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Io))?;

        tracing::debug!("Found {} entries under {prefix}", items.len());
        Ok(items)
    }

    async fn children(&self, prefix: &Utf8Path) -> Result<Vec<String>, StorageError> {
        let path = self.path(prefix)?;
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(StorageError::io(ENGINE, prefix.as_str())(error)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(StorageError::io(ENGINE, prefix.as_str()))?
        {
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[tracing::instrument]
fn collect_list(root: &Utf8Path, target: &Utf8Path) -> eyre::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();

    if target.is_dir() {
        visit(target, &mut files)?;
    }

    let mut files: Vec<_> = files
        .into_iter()
        .filter_map(|p| p.strip_prefix(root).ok().map(|p| p.to_owned()))
        .collect();
    files.sort();
    Ok(files)
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path
        .read_dir_utf8()
        .wrap_err_with(|| format!("read directory {path}"))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, LocalDriver::new(root))
    }

    #[tokio::test]
    async fn append_grows_file() {
        let (_dir, driver) = driver();
        let path = Utf8Path::new("uploads/abc/data");

        assert_eq!(driver.append(path, &mut &b"hello "[..]).await.unwrap(), 6);
        assert_eq!(driver.append(path, &mut &b"world"[..]).await.unwrap(), 11);

        let mut buf = Vec::new();
        driver.download(path, &mut buf).await.unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[tokio::test]
    async fn range_reads_inclusive_bytes() {
        let (_dir, driver) = driver();
        let path = Utf8Path::new("blob");
        driver.upload(path, &mut &b"0123456789"[..]).await.unwrap();

        let mut buf = Vec::new();
        driver
            .download_range(
                path,
                ByteRange {
                    start: 2,
                    end: Some(5),
                },
                &mut buf,
            )
            .await
            .unwrap();
        assert_eq!(buf, b"2345");

        let err = driver
            .download_range(
                path,
                ByteRange {
                    start: 20,
                    end: None,
                },
                &mut Vec::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn list_missing_prefix_is_empty() {
        let (_dir, driver) = driver();
        assert!(driver.list(Utf8Path::new("nope")).await.unwrap().is_empty());
        assert!(driver
            .children(Utf8Path::new("nope"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn list_is_recursive_and_relative() {
        let (_dir, driver) = driver();
        driver
            .upload(Utf8Path::new("a/b/c"), &mut &b"1"[..])
            .await
            .unwrap();
        driver
            .upload(Utf8Path::new("a/d"), &mut &b"2"[..])
            .await
            .unwrap();

        let files = driver.list(Utf8Path::new("a")).await.unwrap();
        assert_eq!(
            files,
            vec![Utf8PathBuf::from("a/b/c"), Utf8PathBuf::from("a/d")]
        );
        assert_eq!(
            driver.children(Utf8Path::new("a")).await.unwrap(),
            vec!["b".to_owned(), "d".to_owned()]
        );
    }

    #[tokio::test]
    async fn rename_and_prune() {
        let (_dir, driver) = driver();
        driver
            .upload(Utf8Path::new("uploads/x/data"), &mut &b"data"[..])
            .await
            .unwrap();
        driver
            .rename(Utf8Path::new("uploads/x/data"), Utf8Path::new("blobs/y/data"))
            .await
            .unwrap();

        assert!(!driver.exists(Utf8Path::new("uploads/x/data")).await.unwrap());
        assert!(driver.exists(Utf8Path::new("blobs/y/data")).await.unwrap());

        driver
            .prune(Utf8Path::new("uploads/x"), Utf8Path::new("uploads"))
            .await
            .unwrap();
        assert!(driver
            .children(Utf8Path::new("uploads"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn rejects_parent_components() {
        let (_dir, driver) = driver();
        let err = driver
            .metadata(Utf8Path::new("../etc/passwd"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }
}
