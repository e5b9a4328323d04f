use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::module::FileSource;
use crate::types::{InvocationParameters, ResourceLimits};

mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../pmax.example.toml");

/// Default upper bound on the size of a module blob (256 MiB)
pub const DEFAULT_MAX_MODULE_SIZE: u64 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("no module path configured (set `module_path` or pass --module)")]
    MissingModulePath,

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for pmax
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path to the compiled compute module
    #[serde(default)]
    pub module_path: Option<PathBuf>,

    /// argv[0] passed to the module
    #[serde(default = "default_program_name")]
    pub program_name: String,

    /// Root under which per-call filesystems are created (OS temp dir if unset)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Largest module blob accepted for compilation, in bytes
    #[serde(default = "default_max_module_size")]
    pub max_module_size: u64,

    /// Compile with cranelift speed optimisations
    #[serde(default = "default_optimize")]
    pub optimize: bool,

    /// Execution limits applied to every call.
    /// Per-call overrides take precedence.
    #[serde(default)]
    pub limits: ResourceLimits,

    /// Parameters used when a caller does not supply its own
    #[serde(default)]
    pub defaults: InvocationParameters,
}

impl Config {
    /// Create a new config from the embedded example
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the given module path
    pub fn with_module_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.module_path = Some(path.into());
        self
    }

    /// Use the given scratch root for per-call filesystems
    pub fn with_scratch_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(path.into());
        self
    }

    /// Directory under which per-call filesystems are created
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Build a source for the configured module file
    pub fn module_source(&self) -> Result<FileSource, ConfigError> {
        self.module_path
            .as_ref()
            .map(FileSource::new)
            .ok_or(ConfigError::MissingModulePath)
    }

    /// Merge resource limits with defaults
    pub fn effective_limits(&self, overrides: Option<&ResourceLimits>) -> ResourceLimits {
        let base = ResourceLimits::default().with_overrides(&self.limits);
        match overrides {
            Some(limits) => base.with_overrides(limits),
            None => base,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_program_name() -> String {
    "pmax".to_string()
}

fn default_max_module_size() -> u64 {
    DEFAULT_MAX_MODULE_SIZE
}

fn default_optimize() -> bool {
    true
}
