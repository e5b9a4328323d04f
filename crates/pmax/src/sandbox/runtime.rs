//! Guest execution on wasmtime
//!
//! Uses wasmtime-wasi preview1, which is what `wasm32-wasip1` command
//! modules import.

use std::path::Path;
use std::time::Instant;

use tracing::debug;
use wasmtime::{Store, StoreLimits, StoreLimitsBuilder, Trap};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use crate::module::{CompiledModule, ENTRY_POINT};
use crate::sandbox::SandboxError;
use crate::sandbox::capture::CapturePipe;
use crate::sandbox::fs::GUEST_ROOT;
use crate::types::{ExecutionResult, ExecutionStatus, ResourceLimits};

/// Bytes kept from stdout/stderr when no limit is configured
const DEFAULT_PIPE_CAPACITY: usize = 1024 * 1024;

/// Host state stored in each instance's [`Store`]
pub struct SandboxState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

impl SandboxState {
    pub(crate) fn wasi(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }
}

/// Instantiate the module over `root` and run `_start` to completion
///
/// Blocks the calling thread until the guest returns, exits or traps.
pub(crate) fn run_guest(
    module: &CompiledModule,
    root: &Path,
    args: &[String],
    limits: &ResourceLimits,
) -> Result<ExecutionResult, SandboxError> {
    let pipe_capacity = limits.max_diagnostics.unwrap_or(DEFAULT_PIPE_CAPACITY);
    let stdout = CapturePipe::new(pipe_capacity);
    let stderr = CapturePipe::new(pipe_capacity);

    let mut builder = WasiCtxBuilder::new();
    builder
        .args(args)
        .stdout(stdout.clone())
        .stderr(stderr.clone());
    builder
        .preopened_dir(root, GUEST_ROOT, DirPerms::all(), FilePerms::all())
        .map_err(|e| SandboxError::Wasi(format!("failed to preopen {}: {e}", root.display())))?;

    let state = SandboxState {
        wasi: builder.build_p1(),
        limits: store_limits(limits),
    };

    let mut store = Store::new(module.engine(), state);
    store.limiter(|state| &mut state.limits);

    let fuel = limits.fuel.unwrap_or(u64::MAX);
    store
        .set_fuel(fuel)
        .map_err(|e| SandboxError::Instantiate(format!("fuel setup failed: {e}")))?;

    let instance = module
        .instance_pre()
        .instantiate(&mut store)
        .map_err(|e| SandboxError::Instantiate(format!("{e:#}")))?;
    let entry = instance
        .get_typed_func::<(), ()>(&mut store, ENTRY_POINT)
        .map_err(|e| SandboxError::Instantiate(format!("{e:#}")))?;

    debug!(?args, fuel = limits.fuel, "starting guest");

    let start = Instant::now();
    let outcome = entry.call(&mut store, ());
    let wall_time = start.elapsed().as_secs_f64();

    let fuel_consumed = limits
        .fuel
        .and_then(|_| store.get_fuel().ok())
        .map(|remaining| fuel - remaining);

    // Dropping the store closes every descriptor the guest still holds
    drop(store);

    let (status, exit_code, trap) = classify(outcome);

    debug!(?status, exit_code, wall_time, "guest finished");

    Ok(ExecutionResult {
        status,
        exit_code,
        trap,
        fuel_consumed,
        wall_time,
        stdout: stdout.contents(),
        stderr: stderr.contents(),
        stdout_truncated: stdout.is_truncated(),
        stderr_truncated: stderr.is_truncated(),
    })
}

fn store_limits(limits: &ResourceLimits) -> StoreLimits {
    let mut builder = StoreLimitsBuilder::new();
    if let Some(bytes) = limits.max_memory {
        builder = builder.memory_size(bytes);
    }
    builder.build()
}

/// Map the result of `_start` onto an execution status
///
/// A normal return counts as exit status 0, as does `proc_exit(0)`.
fn classify(outcome: anyhow::Result<()>) -> (ExecutionStatus, Option<i32>, Option<String>) {
    let err = match outcome {
        Ok(()) => return (ExecutionStatus::Ok, Some(0), None),
        Err(err) => err,
    };

    if let Some(exit) = err.downcast_ref::<I32Exit>() {
        return (ExecutionStatus::from_exit_code(exit.0), Some(exit.0), None);
    }

    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => (
            ExecutionStatus::FuelExhausted,
            None,
            Some(Trap::OutOfFuel.to_string()),
        ),
        Some(trap) => (ExecutionStatus::Trapped, None, Some(trap.to_string())),
        None => (ExecutionStatus::Trapped, None, Some(format!("{err:#}"))),
    }
}
