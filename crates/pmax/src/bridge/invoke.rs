//! One call through the bridge
//!
//! `Created → ModuleReady → InputWritten → Executed → {Succeeded, Failed}`.
//! The instance is released on every path before the result is returned.

use std::fmt;

use tracing::{debug, info, instrument, warn};

use crate::bridge::{Bridge, InvocationOutput, RunError};
use crate::sandbox::{SandboxInstance, VirtualPath};
use crate::types::{ExecutionResult, ExecutionStatus, InvocationParameters, ResourceLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    ModuleReady,
    InputWritten,
    Executed,
    Succeeded,
    Failed,
}

impl Phase {
    fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Created, ModuleReady)
                | (ModuleReady, InputWritten)
                | (InputWritten, Executed)
                | (Executed, Succeeded)
                | (_, Failed)
        ) && !matches!(self, Succeeded | Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Created => "created",
            Phase::ModuleReady => "module_ready",
            Phase::InputWritten => "input_written",
            Phase::Executed => "executed",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-call progress tracker
struct Call {
    id: u64,
    phase: Phase,
}

impl Call {
    fn new(id: u64) -> Self {
        debug!(id, phase = %Phase::Created, "call started");
        Self {
            id,
            phase: Phase::Created,
        }
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "invalid transition {} -> {}",
            self.phase,
            next
        );
        debug!(id = self.id, from = %self.phase, to = %next, "call advanced");
        self.phase = next;
    }
}

#[instrument(skip(bridge, input, limits), fields(input_len = input.len()))]
pub(super) async fn invoke(
    bridge: &Bridge,
    id: u64,
    input: &[u8],
    params: &InvocationParameters,
    limits: Option<&ResourceLimits>,
) -> Result<InvocationOutput, RunError> {
    let mut call = Call::new(id);

    let result = prepare_and_drive(bridge, &mut call, input, params, limits).await;

    match &result {
        Ok(_) => call.advance(Phase::Succeeded),
        Err(e) => {
            debug!(id, error = %e, "call failed");
            call.advance(Phase::Failed);
        }
    }
    result
}

async fn prepare_and_drive(
    bridge: &Bridge,
    call: &mut Call,
    input: &[u8],
    params: &InvocationParameters,
    limits: Option<&ResourceLimits>,
) -> Result<InvocationOutput, RunError> {
    params.validate()?;

    let module = bridge.cache().get().await?;
    call.advance(Phase::ModuleReady);

    let config = bridge.config();
    let mut instance = SandboxInstance::create(
        call.id,
        module,
        config.scratch_root(),
        params.to_args(&config.program_name),
        config.effective_limits(limits),
    )
    .await?;

    let result = drive(&mut instance, call, input).await;

    match (result, instance.release().await) {
        (Ok(output), Ok(())) => Ok(output),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), released) => {
            if let Err(release_err) = released {
                warn!(id = call.id, error = %release_err, "failed to release instance");
            }
            Err(e)
        }
    }
}

async fn drive(
    instance: &mut SandboxInstance,
    call: &mut Call,
    input: &[u8],
) -> Result<InvocationOutput, RunError> {
    instance.write_input(input).await?;
    call.advance(Phase::InputWritten);

    let execution = instance.execute().await?;
    call.advance(Phase::Executed);

    log_diagnostics(call.id, &execution);

    // Best effort: release removes whatever is left
    if let Err(e) = instance.remove(VirtualPath::Input).await {
        warn!(id = call.id, error = %e, "failed to remove input");
    }

    match execution.status {
        ExecutionStatus::Ok => match instance.take_output().await? {
            Some(output) => Ok(InvocationOutput { output, execution }),
            None => Err(RunError::OutputMissing {
                diagnostics: execution.diagnostics(),
            }),
        },
        ExecutionStatus::RuntimeError => Err(RunError::ExecutionFailed {
            exit_code: execution.exit_code.unwrap_or(-1),
            diagnostics: execution.diagnostics(),
        }),
        ExecutionStatus::Trapped | ExecutionStatus::FuelExhausted => Err(RunError::Trapped {
            trap: execution.trap.clone().unwrap_or_default(),
            fuel_exhausted: execution.status == ExecutionStatus::FuelExhausted,
            diagnostics: execution.diagnostics(),
        }),
    }
}

/// Log the module's diagnostic text alongside how it ended
fn log_diagnostics(id: u64, execution: &ExecutionResult) {
    let diagnostics = execution.diagnostics();
    let diagnostics = diagnostics.trim_end();

    if execution.is_success() {
        info!(
            id,
            exit_code = execution.exit_code,
            wall_time = execution.wall_time,
            diagnostics,
            truncated = execution.stderr_truncated,
            "module finished"
        );
    } else {
        warn!(
            id,
            status = ?execution.status,
            exit_code = execution.exit_code,
            trap = execution.trap.as_deref(),
            diagnostics,
            truncated = execution.stderr_truncated,
            "module failed"
        );
    }
}
