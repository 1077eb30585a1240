//! Local filesystem blob store.

use crate::error::{StoreError, StoreResult};
use crate::traits::BlobStore;
use async_trait::async_trait;
use bytes::Bytes;
use gantry_core::UploadId;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Staging namespace for received chunks.
const CHUNKS_DIR: &str = "chunks";

/// Final namespace for assembled objects.
const FINAL_DIR: &str = "final";

/// Free space kept in reserve; writes that would dip below this margin are
/// refused so the volume never fills completely.
const FREE_SPACE_MARGIN: u64 = 64 * 1024 * 1024;

/// Filesystem-backed blob store.
///
/// Layout under the root: `chunks/<handle>-<index>` for staging,
/// `final/<sanitized-name>` for assembled objects. Temp files carry a UUID
/// suffix so concurrent writers never collide.
pub struct FilesystemStore {
    root: PathBuf,
    chunks: PathBuf,
    finals: PathBuf,
}

impl FilesystemStore {
    /// Create a new filesystem store rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        let chunks = root.join(CHUNKS_DIR);
        let finals = root.join(FINAL_DIR);
        fs::create_dir_all(&chunks).await?;
        fs::create_dir_all(&finals).await?;
        Ok(Self {
            root,
            chunks,
            finals,
        })
    }

    /// Deterministic staging path for `(handle, index)`.
    fn chunk_path(&self, handle: UploadId, index: u32) -> PathBuf {
        self.chunks.join(format!("{handle}-{index}"))
    }

    /// Final-namespace path for a sanitized name.
    ///
    /// The name must be a single normal path component; sanitization happens
    /// upstream, this is the last line of defense.
    fn final_path(&self, name: &str) -> StoreResult<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(std::path::Component::Normal(_)), None) => {}
            _ => {
                return Err(StoreError::InvalidName(format!(
                    "not a single path component: {name}"
                )));
            }
        }
        Ok(self.finals.join(name))
    }

    /// Write `data` to `path` via a uniquely-named temp file, fsync, rename.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> StoreResult<()> {
        let temp_path = path.with_file_name(format!(
            "{}.tmp.{}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Uuid::new_v4()
        ));
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            // Durability before acknowledgement.
            file.sync_all().await?;
        }
        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Fail with `Exhausted` when the volume cannot take `needed` more bytes
    /// while keeping the reserve margin.
    fn probe_space(&self, needed: u64) -> StoreResult<()> {
        let Some(available) = self.available_space() else {
            return Ok(());
        };
        if available < needed {
            return Err(StoreError::Exhausted { needed, available });
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FilesystemStore {
    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn write_chunk(&self, handle: UploadId, index: u32, data: Bytes) -> StoreResult<()> {
        self.probe_space(data.len() as u64)?;
        let path = self.chunk_path(handle, index);
        self.write_atomic(&path, &data).await
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn read_chunk(&self, handle: UploadId, index: u32) -> StoreResult<Bytes> {
        let path = self.chunk_path(handle, index);
        let data = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(format!("chunk {handle}-{index}"))
            } else {
                StoreError::Io(e)
            }
        })?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn chunk_exists(&self, handle: UploadId, index: u32) -> StoreResult<bool> {
        let path = self.chunk_path(handle, index);
        fs::try_exists(&path).await.map_err(StoreError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn chunk_len(&self, handle: UploadId, index: u32) -> StoreResult<u64> {
        let path = self.chunk_path(handle, index);
        let metadata = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(format!("chunk {handle}-{index}"))
            } else {
                StoreError::Io(e)
            }
        })?;
        Ok(metadata.len())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn assemble(
        &self,
        handle: UploadId,
        total_chunks: u32,
        out_name: &str,
    ) -> StoreResult<(PathBuf, u64)> {
        let final_path = self.final_path(out_name)?;
        let temp_path = self
            .finals
            .join(format!(".assemble.{handle}.{}", Uuid::new_v4()));

        let result = self
            .assemble_into(handle, total_chunks, &temp_path)
            .await;

        let bytes_written = match result {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok((final_path, bytes_written))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete_chunk(&self, handle: UploadId, index: u32) -> StoreResult<()> {
        let path = self.chunk_path(handle, index);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete_session_artifacts(
        &self,
        handle: UploadId,
        final_name: Option<&str>,
    ) -> StoreResult<u64> {
        let prefix = format!("{handle}-");
        let mut removed = 0u64;

        let mut entries = fs::read_dir(&self.chunks).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&prefix) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        handle = %handle,
                        path = %entry.path().display(),
                        error = %e,
                        "failed to remove staging chunk"
                    );
                }
            }
        }

        if let Some(name) = final_name {
            match self.final_path(name) {
                Ok(path) => {
                    if let Err(e) = fs::remove_file(&path).await
                        && e.kind() != std::io::ErrorKind::NotFound
                    {
                        tracing::warn!(handle = %handle, name = %name, error = %e,
                            "failed to remove final object");
                    }
                }
                Err(e) => {
                    tracing::warn!(handle = %handle, name = %name, error = %e,
                        "refusing to delete final object with invalid name");
                }
            }
        }

        Ok(removed)
    }

    fn available_space(&self) -> Option<u64> {
        available_free_space(&self.root).map(|avail| avail.saturating_sub(FREE_SPACE_MARGIN))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StoreResult<()> {
        for dir in [&self.chunks, &self.finals] {
            let metadata = fs::metadata(dir).await.map_err(|e| {
                StoreError::Io(std::io::Error::new(
                    e.kind(),
                    format!("storage namespace not accessible: {e}"),
                ))
            })?;
            if !metadata.is_dir() {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotADirectory,
                    format!("storage namespace is not a directory: {}", dir.display()),
                )));
            }
        }
        Ok(())
    }
}

impl FilesystemStore {
    /// Stream chunks into `temp_path`, one chunk buffered at a time.
    async fn assemble_into(
        &self,
        handle: UploadId,
        total_chunks: u32,
        temp_path: &Path,
    ) -> StoreResult<u64> {
        let mut out = fs::File::create(temp_path).await?;
        let mut bytes_written = 0u64;

        for index in 0..total_chunks {
            let chunk = self.read_chunk(handle, index).await?;
            out.write_all(&chunk).await?;
            bytes_written += chunk.len() as u64;
        }

        out.sync_all().await?;
        Ok(bytes_written)
    }
}

/// Available bytes on the volume holding `path` (Unix: statvfs).
#[cfg(unix)]
fn available_free_space(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        tracing::debug!("statvfs failed: {}", std::io::Error::last_os_error());
        return None;
    }

    // Casts needed for cross-platform: types vary between Linux and macOS.
    #[allow(clippy::unnecessary_cast)]
    (stat.f_bavail as u64).checked_mul(stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn available_free_space(_path: &Path) -> Option<u64> {
    None
}
