//! Resumable blob upload sessions

use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::AsyncBufRead;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::digest::{Digest, DigestWriter};
use crate::error::{RegistryError, RegistryResult};
use crate::storage::{RegistryStorage, upload_dir, upload_path};

#[derive(Debug)]
struct UploadSession {
    repository: String,
    offset: Mutex<u64>,
}

/// Outcome of a blob mount request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    /// The blob is now linked into the target repository
    Mounted(Digest),
    /// The blob could not be mounted; a fresh session was started instead
    Started(Uuid),
}

/// In-flight upload sessions.
///
/// Each session is appended to under its own lock, so chunks for the same
/// session are written one at a time in arrival order. Sessions live only in
/// memory: after a restart their ids are unknown and the partial data under
/// `uploads/` is orphaned.
#[derive(Debug, Clone)]
pub struct UploadSessions {
    storage: RegistryStorage,
    sessions: Arc<DashMap<Uuid, Arc<UploadSession>>>,
}

impl UploadSessions {
    /// Sessions writing through `storage`.
    pub fn new(storage: RegistryStorage) -> Self {
        Self {
            storage,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are open.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn session(&self, repository: &str, id: &Uuid) -> RegistryResult<Arc<UploadSession>> {
        match self.sessions.get(id) {
            Some(session) if session.repository == repository => Ok(Arc::clone(session.value())),
            _ => Err(RegistryError::BlobUploadUnknown(id.to_string())),
        }
    }

    /// Parse a session id from a URL segment.
    pub fn parse_id(id: &str) -> RegistryResult<Uuid> {
        Uuid::parse_str(id).map_err(|_| RegistryError::BlobUploadUnknown(id.to_owned()))
    }

    /// Start a session for `repository`.
    #[tracing::instrument(skip(self))]
    pub async fn initiate(&self, repository: &str) -> RegistryResult<Uuid> {
        let id = Uuid::new_v4();
        self.storage
            .inner()
            .write(&upload_path(&id.to_string()), &[])
            .await?;
        self.sessions.insert(
            id,
            Arc::new(UploadSession {
                repository: repository.to_owned(),
                offset: Mutex::new(0),
            }),
        );
        tracing::debug!(%id, "Upload started");
        Ok(id)
    }

    /// Bytes received so far.
    pub async fn offset(&self, repository: &str, id: &Uuid) -> RegistryResult<u64> {
        let session = self.session(repository, id)?;
        let offset = *session.offset.lock().await;
        Ok(offset)
    }

    /// Append a chunk, returning the new total size.
    ///
    /// When `start` is given it must equal the current offset.
    #[tracing::instrument(skip(self, reader))]
    pub async fn append<R>(
        &self,
        repository: &str,
        id: &Uuid,
        start: Option<u64>,
        reader: &mut R,
    ) -> RegistryResult<u64>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let session = self.session(repository, id)?;
        let mut offset = session.offset.lock().await;
        if let Some(start) = start {
            if start != *offset {
                tracing::debug!(start, offset = *offset, "Out of order chunk");
                return Err(RegistryError::RangeNotSatisfiable);
            }
        }

        let size = self.write_chunk(id, &mut offset, reader).await?;
        tracing::trace!(size, "Chunk appended");
        Ok(size)
    }

    /// Append to the session data and move `offset` to the new size.
    ///
    /// A failed append may still have written part of the chunk, so the
    /// offset is re-read from storage before the error is returned.
    async fn write_chunk<R>(&self, id: &Uuid, offset: &mut u64, reader: &mut R) -> RegistryResult<u64>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let data = upload_path(&id.to_string());
        match self.storage.inner().append(&data, reader).await {
            Ok(size) => {
                *offset = size;
                Ok(size)
            }
            Err(error) => {
                match self.storage.inner().metadata(&data).await {
                    Ok(metadata) => {
                        if metadata.size != *offset {
                            tracing::debug!(%id, from = *offset, to = metadata.size, "Partial chunk kept");
                        }
                        *offset = metadata.size;
                    }
                    Err(stat) => {
                        tracing::warn!(%id, error = %stat, "Unable to read upload size after failed append");
                    }
                }
                Err(error.into())
            }
        }
    }

    /// Finish a session, verifying the uploaded bytes hash to `expected`.
    ///
    /// Any final chunk in `reader` is appended first. On a digest mismatch
    /// the session and its data are discarded and nothing is committed.
    /// Completing a session which already finished succeeds as long as the
    /// blob is linked into the repository.
    #[tracing::instrument(skip(self, reader))]
    pub async fn complete<R>(
        &self,
        repository: &str,
        id: &Uuid,
        expected: &Digest,
        reader: &mut R,
    ) -> RegistryResult<()>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let session = match self.session(repository, id) {
            Ok(session) => session,
            Err(error) => {
                if self.storage.layer_linked(repository, expected).await?
                    && self.storage.blob_exists(expected).await?
                {
                    tracing::debug!(%id, "Upload already completed");
                    return Ok(());
                }
                return Err(error);
            }
        };

        let mut offset = session.offset.lock().await;
        let key = id.to_string();
        let data = upload_path(&key);
        self.write_chunk(id, &mut offset, reader).await?;

        let mut hasher = DigestWriter::new();
        self.storage.inner().download(&data, &mut hasher).await?;
        let actual = hasher.finish();

        if &actual != expected {
            tracing::warn!(%expected, %actual, size = *offset, "Digest mismatch, discarding upload");
            drop(offset);
            self.discard(id).await;
            return Err(RegistryError::DigestMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        {
            let _references = self.storage.referencing().await;
            self.storage.commit_blob(&data, expected).await?;
            self.storage.link_layer(repository, expected).await?;
        }

        tracing::info!(%repository, digest = %expected, size = *offset, "Blob committed");
        drop(offset);
        self.discard(id).await;
        Ok(())
    }

    /// Abandon a session and reclaim its storage.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, repository: &str, id: &Uuid) -> RegistryResult<()> {
        let session = self.session(repository, id)?;
        let _offset = session.offset.lock().await;
        self.discard(id).await;
        Ok(())
    }

    async fn discard(&self, id: &Uuid) {
        self.sessions.remove(id);
        if let Err(error) = self
            .storage
            .inner()
            .delete_dir(&upload_dir(&id.to_string()))
            .await
        {
            tracing::warn!(%id, %error, "Failed to remove upload data");
        }
    }

    /// Link a blob from `from` into `repository` without uploading it again.
    ///
    /// Falls back to starting a fresh session when `from` does not link the
    /// blob or the blob data is gone.
    #[tracing::instrument(skip(self))]
    pub async fn mount(
        &self,
        repository: &str,
        digest: &Digest,
        from: &str,
    ) -> RegistryResult<Mount> {
        {
            let _references = self.storage.referencing().await;
            if self.storage.layer_linked(from, digest).await?
                && self.storage.blob_exists(digest).await?
            {
                self.storage.link_layer(repository, digest).await?;
                tracing::debug!(%from, "Blob mounted");
                return Ok(Mount::Mounted(digest.clone()));
            }
        }
        Ok(Mount::Started(self.initiate(repository).await?))
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use storage::{LocalDriver, MemoryStorage};
    use tokio::io::{AsyncRead, AsyncReadExt as _, BufReader, ReadBuf};

    use super::*;

    /// A request body whose client goes away before the end.
    struct Disconnected;

    impl AsyncRead for Disconnected {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("client disconnected")))
        }
    }

    fn sessions() -> (RegistryStorage, UploadSessions) {
        let storage = RegistryStorage::new(MemoryStorage::new().into());
        (storage.clone(), UploadSessions::new(storage))
    }

    #[tokio::test]
    async fn chunked_upload_commits() {
        let (storage, uploads) = sessions();
        let id = uploads.initiate("app").await.unwrap();
        assert_eq!(uploads.offset("app", &id).await.unwrap(), 0);

        for chunk in [&b"one "[..], b"two ", b"three"] {
            let mut chunk = chunk;
            uploads.append("app", &id, None, &mut chunk).await.unwrap();
        }
        assert_eq!(uploads.offset("app", &id).await.unwrap(), 13);

        let digest = Digest::of(b"one two three");
        uploads
            .complete("app", &id, &digest, &mut &b""[..])
            .await
            .unwrap();

        assert!(uploads.is_empty());
        assert!(storage.layer_linked("app", &digest).await.unwrap());
        assert_eq!(storage.blob_metadata(&digest).await.unwrap().size, 13);

        uploads
            .complete("app", &id, &digest, &mut &b""[..])
            .await
            .expect("retry after completion succeeds");
    }

    #[tokio::test]
    async fn mismatch_commits_nothing() {
        let (storage, uploads) = sessions();
        let id = uploads.initiate("app").await.unwrap();
        let claimed = Digest::of(b"something else");

        let result = uploads
            .complete("app", &id, &claimed, &mut &b"payload"[..])
            .await;
        assert!(matches!(result, Err(RegistryError::DigestMismatch { .. })));
        assert!(!storage.blob_exists(&claimed).await.unwrap());
        assert!(!storage.blob_exists(&Digest::of(b"payload")).await.unwrap());
        assert!(uploads.is_empty());
        assert!(matches!(
            uploads.offset("app", &id).await,
            Err(RegistryError::BlobUploadUnknown(_))
        ));
    }

    #[tokio::test]
    async fn sessions_are_scoped_to_repository() {
        let (_, uploads) = sessions();
        let id = uploads.initiate("app").await.unwrap();
        assert!(matches!(
            uploads.append("other", &id, None, &mut &b"x"[..]).await,
            Err(RegistryError::BlobUploadUnknown(_))
        ));
    }

    #[tokio::test]
    async fn out_of_order_chunk_rejected() {
        let (_, uploads) = sessions();
        let id = uploads.initiate("app").await.unwrap();
        uploads
            .append("app", &id, Some(0), &mut &b"abc"[..])
            .await
            .unwrap();
        assert!(matches!(
            uploads.append("app", &id, Some(0), &mut &b"abc"[..]).await,
            Err(RegistryError::RangeNotSatisfiable)
        ));
        assert_eq!(
            uploads
                .append("app", &id, Some(3), &mut &b"def"[..])
                .await
                .unwrap(),
            6
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_chunks_are_serialized() {
        let (storage, uploads) = sessions();
        let id = uploads.initiate("app").await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let uploads = uploads.clone();
            tasks.push(tokio::spawn(async move {
                uploads
                    .append("app", &id, None, &mut &[7u8; 1024][..])
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(uploads.offset("app", &id).await.unwrap(), 16 * 1024);
        let digest = Digest::of(&[7u8; 16 * 1024]);
        uploads
            .complete("app", &id, &digest, &mut &b""[..])
            .await
            .unwrap();
        assert!(storage.blob_exists(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_reclaims_data() {
        let (storage, uploads) = sessions();
        let id = uploads.initiate("app").await.unwrap();
        uploads
            .append("app", &id, None, &mut &b"partial"[..])
            .await
            .unwrap();
        uploads.cancel("app", &id).await.unwrap();

        assert!(uploads.is_empty());
        assert!(!storage
            .inner()
            .exists(&upload_path(&id.to_string()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn mount_links_or_starts_session() {
        let (storage, uploads) = sessions();
        let id = uploads.initiate("source").await.unwrap();
        let digest = Digest::of(b"shared");
        uploads
            .complete("source", &id, &digest, &mut &b"shared"[..])
            .await
            .unwrap();

        assert_eq!(
            uploads.mount("target", &digest, "source").await.unwrap(),
            Mount::Mounted(digest.clone())
        );
        assert!(storage.layer_linked("target", &digest).await.unwrap());

        let missing = Digest::of(b"missing");
        assert!(matches!(
            uploads.mount("target", &missing, "source").await.unwrap(),
            Mount::Started(_)
        ));
        assert_eq!(uploads.len(), 1);
    }

    #[tokio::test]
    async fn interrupted_chunk_reports_bytes_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let storage = RegistryStorage::new(LocalDriver::new(root).into());
        let uploads = UploadSessions::new(storage.clone());
        let id = uploads.initiate("app").await.unwrap();

        let payload: Vec<u8> = (0..96 * 1024).map(|i| (i % 251) as u8).collect();
        let mut broken = BufReader::new((&payload[..64 * 1024]).chain(Disconnected));
        assert!(uploads.append("app", &id, Some(0), &mut broken).await.is_err());

        let offset = uploads.offset("app", &id).await.unwrap();
        let on_disk = storage
            .inner()
            .metadata(&upload_path(&id.to_string()))
            .await
            .unwrap()
            .size;
        assert_eq!(offset, on_disk);

        let start = usize::try_from(offset).unwrap();
        uploads
            .append("app", &id, Some(offset), &mut &payload[start..])
            .await
            .unwrap();
        let digest = Digest::of(&payload);
        uploads
            .complete("app", &id, &digest, &mut &b""[..])
            .await
            .unwrap();
        assert!(storage.blob_exists(&digest).await.unwrap());
    }
}
