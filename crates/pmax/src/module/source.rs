//! Where module blobs come from
//!
//! A source only hands back raw bytes. Size checks and compilation happen in
//! the cache.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::module::ModuleError;

/// A provider of compute-module bytes
#[async_trait]
pub trait ModuleSource: Send + Sync + fmt::Debug {
    /// Fetch the raw module blob (binary wasm or WAT text)
    async fn fetch(&self) -> Result<Vec<u8>, ModuleError>;

    /// Human-readable origin, used in logs and errors
    fn describe(&self) -> String;
}

/// Module read from a file on the host
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the module file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ModuleSource for FileSource {
    async fn fetch(&self) -> Result<Vec<u8>, ModuleError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| ModuleError::Fetch {
                origin: self.describe(),
                message: e.to_string(),
            })?;
        debug!(path = %self.path.display(), len = bytes.len(), "read module file");
        Ok(bytes)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Module held in memory
#[derive(Clone)]
pub struct BytesSource {
    name: String,
    bytes: Arc<[u8]>,
}

impl BytesSource {
    pub fn new(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

impl fmt::Debug for BytesSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytesSource")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[async_trait]
impl ModuleSource for BytesSource {
    async fn fetch(&self) -> Result<Vec<u8>, ModuleError> {
        Ok(self.bytes.to_vec())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
