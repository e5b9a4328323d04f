//! Compiled compute module
//!
//! The module is compiled once against a shared wasmtime [`Engine`] and
//! pre-linked against WASI preview1, so every call only pays for
//! instantiation.

use std::fmt;

use thiserror::Error;
use wasmtime::{Engine, ExternType, InstancePre, Linker, Module, OptLevel};
use wasmtime_wasi::{I32Exit, preview1};

pub use crate::module::cache::ModuleCache;
pub use crate::module::source::{BytesSource, FileSource, ModuleSource};
use crate::sandbox::SandboxState;

mod cache;
mod source;

/// Name of the WASI command entry point
pub const ENTRY_POINT: &str = "_start";

/// Import module name of WASI preview1
const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// Errors that leave the compiled module unavailable
///
/// Cloneable so one failed compilation can be handed to every caller that
/// was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum ModuleError {
    #[error("failed to fetch module from {origin}: {message}")]
    Fetch { origin: String, message: String },

    #[error("module from {origin} is {size} bytes, over the {limit} byte limit")]
    TooLarge { origin: String, size: u64, limit: u64 },

    #[error("failed to create engine: {0}")]
    Engine(String),

    #[error("failed to compile module from {origin}: {message}")]
    Compile { origin: String, message: String },

    #[error("failed to link module from {origin}: {message}")]
    Link { origin: String, message: String },

    #[error("module from {origin} does not export `_start`")]
    NotCommand { origin: String },

    #[error("compilation did not complete: {0}")]
    Aborted(String),
}

/// Build the engine shared by every compilation and instance
///
/// Fuel metering is always on so per-call fuel limits can be applied without
/// recompiling. Stores that have no limit get `u64::MAX`.
pub fn build_engine(optimize: bool) -> Result<Engine, ModuleError> {
    let mut config = wasmtime::Config::new();
    config.cranelift_opt_level(if optimize {
        OptLevel::Speed
    } else {
        OptLevel::None
    });
    config.consume_fuel(true);
    config.wasm_memory64(false);

    Engine::new(&config).map_err(|e| ModuleError::Engine(e.to_string()))
}

/// A compiled, WASI-linked module ready to be instantiated
pub struct CompiledModule {
    engine: Engine,
    pre: InstancePre<SandboxState>,
    origin: String,
    size: usize,
}

impl CompiledModule {
    /// Compile and link a module blob
    ///
    /// CPU-bound; callers on an async runtime should run this on a blocking
    /// thread.
    pub fn compile(engine: &Engine, bytes: &[u8], origin: &str) -> Result<Self, ModuleError> {
        let module = Module::new(engine, bytes).map_err(|e| ModuleError::Compile {
            origin: origin.to_string(),
            message: format!("{e:#}"),
        })?;

        let has_entry = module
            .exports()
            .any(|e| e.name() == ENTRY_POINT && matches!(e.ty(), ExternType::Func(_)));
        if !has_entry {
            return Err(ModuleError::NotCommand {
                origin: origin.to_string(),
            });
        }

        let mut linker: Linker<SandboxState> = Linker::new(engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut SandboxState| state.wasi())
            .map_err(|e| ModuleError::Link {
                origin: origin.to_string(),
                message: e.to_string(),
            })?;

        // wasmtime-wasi refuses statuses >= 126; the bridge reports any status as-is
        linker.allow_shadowing(true);
        linker
            .func_wrap(WASI_MODULE, "proc_exit", |code: i32| -> anyhow::Result<()> {
                Err(I32Exit(code).into())
            })
            .map_err(|e| ModuleError::Link {
                origin: origin.to_string(),
                message: e.to_string(),
            })?;

        let pre = linker
            .instantiate_pre(&module)
            .map_err(|e| ModuleError::Link {
                origin: origin.to_string(),
                message: format!("{e:#}"),
            })?;

        Ok(Self {
            engine: engine.clone(),
            pre,
            origin: origin.to_string(),
            size: bytes.len(),
        })
    }

    /// Engine the module was compiled with
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The underlying wasmtime module
    pub fn module(&self) -> &Module {
        self.pre.module()
    }

    pub(crate) fn instance_pre(&self) -> &InstancePre<SandboxState> {
        &self.pre
    }

    /// Where the module blob came from
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Size of the module blob in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Exported function names
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.module().exports().filter_map(|e| {
            if matches!(e.ty(), ExternType::Func(_)) {
                Some(e.name())
            } else {
                None
            }
        })
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("origin", &self.origin)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
