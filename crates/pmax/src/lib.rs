//! A host-side bridge for a sandboxed image recompression module.
//!
//! pmax runs a WebAssembly (WASI preview1) compute module on wasmtime. The
//! module is compiled once and shared; every call gets a fresh instance with
//! a private filesystem, receives its parameters as an argument vector, reads
//! `/input` and writes `/output`.
//!
//! # Features
//!
//! - **Single-flight compilation**: concurrent first calls wait on one compilation; failures are retried on the next call.
//! - **Per-call isolation**: each call owns its instance and filesystem, released on every path.
//! - **Explicit failures**: nonzero exits, traps and missing output are distinct errors carrying the module's diagnostics.
//! - **Resource limits**: fuel, linear memory, captured diagnostics and output size.
//! - **TOML configuration**: module path, argv[0], scratch root, limits and default parameters.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use pmax::{Bridge, Config, InvocationParameters};
//!
//! let config = Config::default().with_module_path("pmax.wasm");
//! let bridge = Bridge::from_config(config)?;
//!
//! let image = std::fs::read("photo.jpg")?;
//! let params = InvocationParameters::new(80.0, 1600);
//! let compressed = bridge.run(&image, &params).await?;
//! # Ok(())
//! # }
//! ```

pub use bridge::{Bridge, InvocationOutput, RunError};
pub use config::{Config, ConfigError, EXAMPLE_CONFIG};
pub use module::{
    BytesSource, CompiledModule, FileSource, ModuleCache, ModuleError, ModuleSource,
    build_engine,
};
pub use sandbox::{SandboxError, SandboxInstance, VirtualFile, VirtualFs, VirtualPath};
pub use types::{
    ExecutionResult, ExecutionStatus, InvocationParameters, ParameterError, ResourceLimits,
};

pub mod bridge;
pub mod config;
pub mod module;
pub mod sandbox;
pub mod types;
