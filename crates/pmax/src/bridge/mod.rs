//! Invocation bridge
//!
//! Turns one `(input, parameters)` pair into one output buffer by running the
//! shared compiled module in a fresh sandbox instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::instrument;

use crate::config::{Config, ConfigError};
use crate::module::{ModuleCache, ModuleError, ModuleSource, build_engine};
use crate::sandbox::SandboxError;
use crate::types::{ExecutionResult, InvocationParameters, ParameterError, ResourceLimits};

mod invoke;

/// Errors surfaced by [`Bridge::run`]
///
/// A failure is never reported as an empty buffer.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("compute module unavailable: {0}")]
    ModuleUnavailable(#[from] ModuleError),

    #[error("invalid parameters: {0}")]
    InvalidParameters(#[from] ParameterError),

    #[error("module exited with status {exit_code}: {diagnostics}")]
    ExecutionFailed { exit_code: i32, diagnostics: String },

    #[error("module trapped: {trap}")]
    Trapped {
        trap: String,
        fuel_exhausted: bool,
        diagnostics: String,
    },

    #[error("module exited with status 0 but did not write `output`")]
    OutputMissing { diagnostics: String },

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

impl RunError {
    /// Exit status reported by the module, if it exited
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunError::ExecutionFailed { exit_code, .. } => Some(*exit_code),
            RunError::OutputMissing { .. } => Some(0),
            _ => None,
        }
    }

    /// Diagnostic text the module wrote before failing
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            RunError::ExecutionFailed { diagnostics, .. }
            | RunError::Trapped { diagnostics, .. }
            | RunError::OutputMissing { diagnostics } => Some(diagnostics),
            _ => None,
        }
    }

    /// Whether the same call may succeed if issued again
    ///
    /// Module and host I/O failures are transient: the cache does not keep
    /// failed compilations. Anything the guest decided on its own
    /// (exit status, trap, missing output) will repeat for the same input, as
    /// will rejected parameters.
    pub fn is_retryable(&self) -> bool {
        match self {
            RunError::ModuleUnavailable(_) => true,
            RunError::Sandbox(SandboxError::FileTooLarge { .. }) => false,
            RunError::Sandbox(_) => true,
            RunError::InvalidParameters(_)
            | RunError::ExecutionFailed { .. }
            | RunError::Trapped { .. }
            | RunError::OutputMissing { .. } => false,
        }
    }
}

/// Output of a successful call together with its execution report
#[derive(Debug, Clone)]
pub struct InvocationOutput {
    /// Contents of `output`
    pub output: Vec<u8>,

    /// How the module ran
    pub execution: ExecutionResult,
}

/// Entry point for running the compute module
///
/// Holds the module cache; share one bridge (e.g. behind an `Arc`) so every
/// call reuses the same compiled artifact.
#[derive(Debug)]
pub struct Bridge {
    config: Config,
    cache: ModuleCache,
    next_id: AtomicU64,
}

impl Bridge {
    /// Create a bridge that compiles the module from `source` on first use
    pub fn new(config: Config, source: Arc<dyn ModuleSource>) -> Result<Self, ConfigError> {
        let engine = build_engine(config.optimize).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let cache = ModuleCache::new(engine, source, config.max_module_size);

        Ok(Self {
            config,
            cache,
            next_id: AtomicU64::new(0),
        })
    }

    /// Create a bridge for the module file named in the configuration
    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        let source = config.module_source()?;
        Self::new(config, Arc::new(source))
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the module cache
    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    /// Compile the module now instead of on the first call
    #[instrument(skip(self))]
    pub async fn warm_up(&self) -> Result<(), RunError> {
        self.cache.get().await?;
        Ok(())
    }

    /// Run one input through the module
    pub async fn run(
        &self,
        input: &[u8],
        params: &InvocationParameters,
    ) -> Result<Vec<u8>, RunError> {
        self.run_with_report(input, params, None)
            .await
            .map(|report| report.output)
    }

    /// Run one input through the module with the configured default parameters
    pub async fn run_with_defaults(&self, input: &[u8]) -> Result<Vec<u8>, RunError> {
        let params = self.config.defaults;
        self.run(input, &params).await
    }

    /// Run one input and return the output with its execution report
    ///
    /// `limits` override the configured limits for this call only.
    pub async fn run_with_report(
        &self,
        input: &[u8],
        params: &InvocationParameters,
        limits: Option<&ResourceLimits>,
    ) -> Result<InvocationOutput, RunError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        invoke::invoke(self, id, input, params, limits).await
    }
}
