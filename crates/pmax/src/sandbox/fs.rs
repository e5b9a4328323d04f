//! Per-instance filesystem
//!
//! Each sandbox instance gets a private scratch directory that the guest
//! sees as `/`. Only the two logical entries `input` and `output` are ever
//! created in it.

use std::fmt;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::sandbox::SandboxError;

/// Guest-side mount point of the instance filesystem
pub const GUEST_ROOT: &str = "/";

/// Fixed logical paths shared with the compute module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtualPath {
    Input,
    Output,
}

impl VirtualPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            VirtualPath::Input => "input",
            VirtualPath::Output => "output",
        }
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A private directory backing one sandbox instance
///
/// The directory is removed by [`close()`](Self::close), or on drop.
#[derive(Debug)]
pub struct VirtualFs {
    dir: TempDir,
}

impl VirtualFs {
    /// Create an empty filesystem under `scratch_root`
    pub async fn create(scratch_root: &Path) -> Result<Self, SandboxError> {
        let scratch_root = scratch_root.to_path_buf();
        let scratch = |path: &Path, source| SandboxError::Scratch {
            path: path.to_path_buf(),
            source,
        };

        tokio::fs::create_dir_all(&scratch_root)
            .await
            .map_err(|e| scratch(&scratch_root, e))?;

        let dir = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix("pmax-")
                .tempdir_in(&scratch_root)
                .map_err(|e| scratch(&scratch_root, e))
        })
        .await
        .map_err(|e| SandboxError::Join(e.to_string()))??;

        debug!(root = %dir.path().display(), "created instance filesystem");
        Ok(Self { dir })
    }

    /// Host directory preopened for the guest
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Host path of a logical entry
    pub fn host_path(&self, path: VirtualPath) -> PathBuf {
        self.dir.path().join(path.as_str())
    }

    /// Create (or truncate) an entry opened for reading and writing
    pub async fn create_file(&self, path: VirtualPath) -> Result<VirtualFile, SandboxError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.host_path(path))
            .await?;
        Ok(VirtualFile { path, file })
    }

    /// Open an existing entry read-only, `None` if it does not exist
    pub async fn open_file(&self, path: VirtualPath) -> Result<Option<VirtualFile>, SandboxError> {
        match File::open(self.host_path(path)).await {
            Ok(file) => Ok(Some(VirtualFile { path, file })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an entry, returning whether it existed
    #[instrument(skip(self))]
    pub async fn remove(&self, path: VirtualPath) -> Result<bool, SandboxError> {
        match tokio::fs::remove_file(self.host_path(path)).await {
            Ok(()) => {
                debug!("removed file");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Check if an entry exists
    pub async fn exists(&self, path: VirtualPath) -> Result<bool, SandboxError> {
        Ok(tokio::fs::try_exists(self.host_path(path)).await?)
    }

    /// Names of everything currently in the filesystem, sorted
    pub async fn entries(&self) -> Result<Vec<String>, SandboxError> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(self.root()).await?;
        while let Some(entry) = dir.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort_unstable();
        Ok(names)
    }

    /// Remove the directory and everything in it
    pub async fn close(self) -> Result<(), SandboxError> {
        tokio::task::spawn_blocking(move || self.close_blocking())
            .await
            .map_err(|e| SandboxError::Join(e.to_string()))?
    }

    /// Same as [`close()`](Self::close), on the calling thread
    pub(crate) fn close_blocking(self) -> Result<(), SandboxError> {
        let root = self.dir.path().to_path_buf();
        self.dir.close()?;
        debug!(root = %root.display(), "removed instance filesystem");
        Ok(())
    }
}

/// An open entry of a [`VirtualFs`]
#[derive(Debug)]
pub struct VirtualFile {
    path: VirtualPath,
    file: File,
}

impl VirtualFile {
    /// Logical path of this entry
    pub fn path(&self) -> VirtualPath {
        self.path
    }

    /// Write the whole buffer and flush it to the host file
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), SandboxError> {
        self.file.write_all(data).await?;
        self.file.flush().await?;
        Ok(())
    }

    /// Move the cursor back to the first byte
    pub async fn rewind(&mut self) -> Result<(), SandboxError> {
        self.file.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }

    /// Current size in bytes
    pub async fn len(&self) -> Result<u64, SandboxError> {
        Ok(self.file.metadata().await?.len())
    }

    /// Read the rest of the file, refusing files larger than `limit` bytes
    pub async fn read_to_end(&mut self, limit: Option<u64>) -> Result<Vec<u8>, SandboxError> {
        let size = self.len().await?;
        if let Some(limit) = limit
            && size > limit
        {
            return Err(SandboxError::FileTooLarge {
                path: self.path,
                size,
                limit,
            });
        }

        let mut buf = Vec::with_capacity(usize::try_from(size).unwrap_or_default());
        self.file.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}
