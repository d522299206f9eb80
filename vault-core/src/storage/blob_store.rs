use crate::error::{Result, VaultError};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use ulid::Ulid;

/// Buffer size for spooling an incoming payload to disk.
const SPOOL_BUF_SIZE: usize = 64 * 1024;

/// A payload spooled to disk but not yet part of any owner's namespace.
/// Produced by [`BlobStore::stage`] and consumed exactly once, by
/// `commit` or `discard`.
#[derive(Debug)]
pub struct StagedBlob {
    pub fingerprint: Fingerprint,
    pub size: i64,
    spool_handle: String,
}

/// Physical payload storage. Handles are opaque to the rest of the core;
/// only the blob store interprets them. Committed payloads live in a
/// per-owner namespace: one owner releasing content they share byte-for-
/// byte with another owner never touches the other owner's payload.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Spool a payload stream to temporary storage, hashing and counting
    /// it as it streams. Only a fixed-size buffer is held in memory; a
    /// read failure removes the partial spool and yields nothing.
    async fn stage(&self, payload: &mut (dyn AsyncRead + Send + Unpin)) -> Result<StagedBlob>;

    /// Move a staged payload into `owner_id`'s namespace, returning its
    /// handle. Committing bytes the owner already holds reuses the
    /// existing payload. On failure the staged spool is removed; the
    /// caller never retries a consumed stage.
    async fn commit(&self, staged: StagedBlob, owner_id: &str) -> Result<String>;

    /// Drop a staged payload without publishing it.
    async fn discard(&self, staged: StagedBlob) -> Result<()>;

    /// Read back a committed payload by handle.
    async fn read(&self, handle: &str) -> Result<Bytes>;

    /// Delete a committed payload. Failures here are value-level so the
    /// release path can log and continue (metadata stays the source of
    /// truth).
    async fn delete(&self, handle: &str) -> Result<()>;
}

/// Filesystem blob store: committed payloads live under
/// `{base}/blobs/{owner_id}/{fp[0..2]}/{fingerprint}`, spooled to a
/// uniquely named file under `{base}/staging/` and renamed into place so
/// a dropped upload task leaves no partial payload at a final path.
pub struct FsBlobStore {
    base_path: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_path.join("blobs"))?;
        std::fs::create_dir_all(base_path.join("staging"))?;
        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    fn object_handle(owner_id: &str, fingerprint: &Fingerprint) -> String {
        // First 2 hex chars as subdirectory to avoid one huge directory.
        format!(
            "blobs/{}/{}/{}",
            owner_id,
            fingerprint.shard_prefix(),
            fingerprint.as_str()
        )
    }

    fn resolve(&self, handle: &str) -> Result<PathBuf> {
        let path = Path::new(handle);
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(VaultError::InvalidRequest(format!(
                "invalid blob handle: {}",
                handle
            )));
        }
        Ok(self.base_path.join(path))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn stage(&self, payload: &mut (dyn AsyncRead + Send + Unpin)) -> Result<StagedBlob> {
        let spool_handle = format!("staging/{}.spool", Ulid::new());
        let spool_path = self.resolve(&spool_handle)?;

        let mut file = fs::File::create(&spool_path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; SPOOL_BUF_SIZE];
        let mut size: i64 = 0;

        loop {
            let n = match payload.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(error) => {
                    drop(file);
                    let _ = fs::remove_file(&spool_path).await;
                    return Err(error.into());
                }
            };
            hasher.update(&buf[..n]);
            if let Err(error) = file.write_all(&buf[..n]).await {
                drop(file);
                let _ = fs::remove_file(&spool_path).await;
                return Err(error.into());
            }
            size += n as i64;
        }

        if let Err(error) = file.sync_all().await {
            drop(file);
            let _ = fs::remove_file(&spool_path).await;
            return Err(error.into());
        }

        let fingerprint = Fingerprint::from_digest(&hasher.finalize());
        tracing::debug!("staged payload {} ({} bytes)", fingerprint, size);
        Ok(StagedBlob {
            fingerprint,
            size,
            spool_handle,
        })
    }

    async fn commit(&self, staged: StagedBlob, owner_id: &str) -> Result<String> {
        let handle = Self::object_handle(owner_id, &staged.fingerprint);
        let blob_path = self.resolve(&handle)?;
        let spool_path = self.resolve(&staged.spool_handle)?;

        // A payload may already sit here from an earlier upload that was
        // interrupted between commit and its metadata insert; the bytes
        // are identical by construction, so reuse it.
        if fs::try_exists(&blob_path).await? {
            fs::remove_file(&spool_path).await?;
            return Ok(handle);
        }

        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if let Err(error) = fs::rename(&spool_path, &blob_path).await {
            let _ = fs::remove_file(&spool_path).await;
            return Err(error.into());
        }

        tracing::debug!(
            "committed blob {} for owner {} ({} bytes)",
            staged.fingerprint,
            owner_id,
            staged.size
        );
        Ok(handle)
    }

    async fn discard(&self, staged: StagedBlob) -> Result<()> {
        let spool_path = self.resolve(&staged.spool_handle)?;
        if fs::try_exists(&spool_path).await? {
            fs::remove_file(&spool_path).await?;
        }
        Ok(())
    }

    async fn read(&self, handle: &str) -> Result<Bytes> {
        let path = self.resolve(handle)?;
        if !fs::try_exists(&path).await? {
            return Err(VaultError::NotFound);
        }
        let data = fs::read(&path).await?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, handle: &str) -> Result<()> {
        let path = self.resolve(handle)?;
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint_bytes;

    fn spool_count(dir: &Path) -> usize {
        std::fs::read_dir(dir.join("staging")).unwrap().count()
    }

    #[tokio::test]
    async fn test_stage_commit_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();

        let data = b"payload bytes";
        let mut reader: &[u8] = data;
        let staged = store.stage(&mut reader).await.unwrap();
        assert_eq!(staged.fingerprint, fingerprint_bytes(data));
        assert_eq!(staged.size, data.len() as i64);

        let handle = store.commit(staged, "owner-a").await.unwrap();
        assert!(handle.starts_with("blobs/owner-a/"));
        assert_eq!(spool_count(dir.path()), 0);

        let read_back = store.read(&handle).await.unwrap();
        assert_eq!(read_back, Bytes::from_static(data));

        store.delete(&handle).await.unwrap();
        assert!(matches!(
            store.read(&handle).await,
            Err(VaultError::NotFound)
        ));

        // Deleting an already-missing payload stays non-fatal.
        store.delete(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_committed_payloads_are_owner_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        let data = b"bytes both owners hold";

        let mut reader: &[u8] = data;
        let a = store.commit(store.stage(&mut reader).await.unwrap(), "owner-a").await.unwrap();
        let mut reader: &[u8] = data;
        let b = store.commit(store.stage(&mut reader).await.unwrap(), "owner-b").await.unwrap();

        // Identical content, distinct physical payloads: deleting one
        // owner's leaves the other's readable.
        assert_ne!(a, b);
        store.delete(&a).await.unwrap();
        assert_eq!(store.read(&b).await.unwrap(), Bytes::from_static(data));
    }

    #[tokio::test]
    async fn test_commit_reuses_existing_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        let data = b"same content twice";

        let mut reader: &[u8] = data;
        let first = store.commit(store.stage(&mut reader).await.unwrap(), "owner-a").await.unwrap();
        let mut reader: &[u8] = data;
        let second = store.commit(store.stage(&mut reader).await.unwrap(), "owner-a").await.unwrap();

        assert_eq!(first, second);
        // The second spool was cleaned up, not abandoned.
        assert_eq!(spool_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_discard_removes_spool() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();

        let mut reader: &[u8] = b"never published";
        let staged = store.stage(&mut reader).await.unwrap();
        assert_eq!(spool_count(dir.path()), 1);

        store.discard(staged).await.unwrap();
        assert_eq!(spool_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_stage_larger_than_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();

        // Forces multiple read/write iterations through the spool buffer.
        let data = vec![0x5au8; SPOOL_BUF_SIZE * 2 + 33];
        let mut reader: &[u8] = &data;
        let staged = store.stage(&mut reader).await.unwrap();
        assert_eq!(staged.size, data.len() as i64);
        assert_eq!(staged.fingerprint, fingerprint_bytes(&data));

        let handle = store.commit(staged, "owner-a").await.unwrap();
        assert_eq!(store.read(&handle).await.unwrap(), Bytes::from(data));
    }

    #[tokio::test]
    async fn test_traversal_handle_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();

        assert!(matches!(
            store.read("../outside").await,
            Err(VaultError::InvalidRequest(_))
        ));
        assert!(matches!(
            store.read("/etc/passwd").await,
            Err(VaultError::InvalidRequest(_))
        ));
    }
}
