//! Sandbox instances
//!
//! A [`SandboxInstance`] is created for exactly one call: it owns a private
//! [`VirtualFs`], the argument vector and the execution limits, and is
//! released when the call ends.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

pub use crate::sandbox::fs::{GUEST_ROOT, VirtualFile, VirtualFs, VirtualPath};
pub(crate) use crate::sandbox::runtime::SandboxState;
use crate::module::CompiledModule;
use crate::types::{ExecutionResult, ResourceLimits};

mod capture;
mod fs;
mod runtime;

/// Errors that occur while provisioning or driving a sandbox instance
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create instance filesystem under {path}: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to configure WASI context: {0}")]
    Wasi(String),

    #[error("failed to instantiate module: {0}")]
    Instantiate(String),

    #[error("`{path}` is {size} bytes, over the {limit} byte limit")]
    FileTooLarge {
        path: VirtualPath,
        size: u64,
        limit: u64,
    },

    #[error("execution task failed: {0}")]
    Join(String),

    #[error("instance {0} has already been released")]
    Released(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One throwaway execution context
///
/// # Cleanup
///
/// Call [`release()`](Self::release) when done. Dropping an unreleased
/// instance still removes its filesystem, but logs a warning.
#[derive(Debug)]
pub struct SandboxInstance {
    /// Instance ID (unique per bridge)
    id: u64,

    /// Shared compiled module
    module: Arc<CompiledModule>,

    /// Private filesystem; `None` once released or while the guest runs
    fs: Option<VirtualFs>,

    /// Argument vector, including argv[0]
    args: Vec<String>,

    /// Limits for this call
    limits: ResourceLimits,
}

impl SandboxInstance {
    /// Provision a new instance with an empty filesystem under `scratch_root`
    #[instrument(skip(module, scratch_root, limits), fields(scratch_root = %scratch_root.as_ref().display()))]
    pub async fn create(
        id: u64,
        module: Arc<CompiledModule>,
        scratch_root: impl AsRef<std::path::Path>,
        args: Vec<String>,
        limits: ResourceLimits,
    ) -> Result<Self, SandboxError> {
        let fs = VirtualFs::create(scratch_root.as_ref()).await?;
        debug!(root = %fs.root().display(), "instance created");

        Ok(Self {
            id,
            module,
            fs: Some(fs),
            args,
            limits,
        })
    }

    /// Get the instance ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Argument vector handed to the guest
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Limits applied to this instance
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// The instance filesystem
    pub fn fs(&self) -> Result<&VirtualFs, SandboxError> {
        self.fs.as_ref().ok_or(SandboxError::Released(self.id))
    }

    /// Whether the instance still holds its resources
    pub fn is_live(&self) -> bool {
        self.fs.is_some()
    }

    /// Create `input`, write the whole buffer and rewind it for the guest
    #[instrument(skip(self, data), fields(id = self.id, len = data.len()))]
    pub async fn write_input(&self, data: &[u8]) -> Result<(), SandboxError> {
        let mut file = self.fs()?.create_file(VirtualPath::Input).await?;
        file.write_all(data).await?;
        file.rewind().await?;
        debug!("wrote input");
        Ok(())
    }

    /// Run the guest to completion
    ///
    /// The guest runs on a blocking thread and cannot be interrupted. If the
    /// caller stops waiting, the thread keeps the filesystem alive until the
    /// guest finishes and then drops it.
    #[instrument(skip(self), fields(id = self.id))]
    pub async fn execute(&mut self) -> Result<ExecutionResult, SandboxError> {
        let fs = self.fs.take().ok_or(SandboxError::Released(self.id))?;
        let module = Arc::clone(&self.module);
        let args = self.args.clone();
        let limits = self.limits.clone();

        let task = tokio::task::spawn_blocking(move || {
            let result = runtime::run_guest(&module, fs.root(), &args, &limits);
            (fs, result)
        });

        let (fs, result) = task.await.map_err(|e| SandboxError::Join(e.to_string()))?;
        self.fs = Some(fs);
        result
    }

    /// Read `output` and remove it, `None` if the guest never created it
    #[instrument(skip(self), fields(id = self.id))]
    pub async fn take_output(&self) -> Result<Option<Vec<u8>>, SandboxError> {
        let fs = self.fs()?;
        let Some(mut file) = fs.open_file(VirtualPath::Output).await? else {
            return Ok(None);
        };

        let data = file.read_to_end(self.limits.max_output).await?;
        drop(file);
        fs.remove(VirtualPath::Output).await?;

        debug!(len = data.len(), "read output");
        Ok(Some(data))
    }

    /// Remove a single entry from the filesystem
    pub async fn remove(&self, path: VirtualPath) -> Result<bool, SandboxError> {
        self.fs()?.remove(path).await
    }

    /// Release the instance and everything it holds
    ///
    /// Releasing twice is a no-op.
    #[instrument(skip(self), fields(id = self.id))]
    pub async fn release(&mut self) -> Result<(), SandboxError> {
        let Some(fs) = self.fs.take() else {
            return Ok(());
        };

        fs.close().await?;
        debug!("instance released");
        Ok(())
    }
}

impl Drop for SandboxInstance {
    fn drop(&mut self) {
        if let Some(fs) = self.fs.take() {
            warn!(
                id = self.id,
                root = %fs.root().display(),
                "SandboxInstance dropped without release(); removing its filesystem"
            );
            let id = self.id;
            let close = move || {
                if let Err(e) = fs.close_blocking() {
                    warn!(id, error = %e, "failed to remove instance filesystem");
                }
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(close);
                }
                Err(_) => close(),
            }
        }
    }
}
