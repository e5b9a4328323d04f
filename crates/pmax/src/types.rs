use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tuning parameters forwarded to the compute module
///
/// The module only understands positional string arguments, so these values
/// travel as `[program, quality, size, delete_exif, denoise]`. The order is
/// part of the module's calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InvocationParameters {
    /// JPEG quality factor (0-100)
    #[serde(default = "default_quality")]
    pub quality: f32,

    /// Maximum edge length of the output image in pixels
    #[serde(default = "default_size")]
    pub size: u32,

    /// Drop EXIF and other metadata markers from the output
    #[serde(default = "default_delete_exif")]
    pub delete_exif: bool,

    /// Apply denoising before encoding
    #[serde(default)]
    pub denoise: bool,
}

/// Errors for parameters the compute module cannot accept
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("quality must be a finite number between 0 and 100, got {0}")]
    QualityOutOfRange(f32),

    #[error("size must be greater than zero")]
    ZeroSize,
}

impl InvocationParameters {
    /// Create parameters with the given quality and size, keeping the other defaults
    pub fn new(quality: f32, size: u32) -> Self {
        Self {
            quality,
            size,
            ..Default::default()
        }
    }

    /// Set whether metadata markers are stripped
    pub fn with_delete_exif(mut self, delete_exif: bool) -> Self {
        self.delete_exif = delete_exif;
        self
    }

    /// Set whether denoising is applied
    pub fn with_denoise(mut self, denoise: bool) -> Self {
        self.denoise = denoise;
        self
    }

    /// Check the parameters against the ranges the module accepts
    pub fn validate(&self) -> Result<(), ParameterError> {
        if !self.quality.is_finite() || !(0.0..=100.0).contains(&self.quality) {
            return Err(ParameterError::QualityOutOfRange(self.quality));
        }
        if self.size == 0 {
            return Err(ParameterError::ZeroSize);
        }
        Ok(())
    }

    /// Serialize into the module's argument vector
    ///
    /// Values use their canonical `Display` form: `80`, `82.5`, `1600`,
    /// `true`, `false`.
    pub fn to_args(&self, program_name: &str) -> Vec<String> {
        vec![
            program_name.to_string(),
            self.quality.to_string(),
            self.size.to_string(),
            self.delete_exif.to_string(),
            self.denoise.to_string(),
        ]
    }
}

impl Default for InvocationParameters {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            size: default_size(),
            delete_exif: default_delete_exif(),
            denoise: false,
        }
    }
}

fn default_quality() -> f32 {
    80.0
}

fn default_size() -> u32 {
    1600
}

fn default_delete_exif() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Fuel available to one execution (roughly one unit per instruction)
    #[serde(default)]
    pub fuel: Option<u64>,

    /// Maximum linear memory size in bytes
    #[serde(default)]
    pub max_memory: Option<usize>,

    /// Maximum bytes of diagnostic text kept from stderr (later output is
    /// accepted from the guest and dropped)
    #[serde(default)]
    pub max_diagnostics: Option<usize>,

    /// Maximum size in bytes of the output file read back from the sandbox
    #[serde(default)]
    pub max_output: Option<u64>,
}

impl ResourceLimits {
    /// 1 kilobyte in bytes
    pub const KB: usize = 1024;
    /// 1 megabyte in bytes
    pub const MB: usize = 1024 * 1024;

    /// Create new resource limits with the default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create resource limits with every field unset
    ///
    /// Useful as a base for overrides that should only touch a few fields.
    pub fn empty() -> Self {
        Self {
            fuel: None,
            max_memory: None,
            max_diagnostics: None,
            max_output: None,
        }
    }

    /// Set the fuel limit
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = Some(fuel);
        self
    }

    /// Set the linear memory limit in bytes
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    /// Set the diagnostic capture limit in bytes
    pub fn with_max_diagnostics(mut self, bytes: usize) -> Self {
        self.max_diagnostics = Some(bytes);
        self
    }

    /// Set the output size limit in bytes
    pub fn with_max_output(mut self, bytes: u64) -> Self {
        self.max_output = Some(bytes);
        self
    }

    /// Apply overrides from another ResourceLimits, preferring values from `overrides`
    pub fn with_overrides(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            fuel: overrides.fuel.or(self.fuel),
            max_memory: overrides.max_memory.or(self.max_memory),
            max_diagnostics: overrides.max_diagnostics.or(self.max_diagnostics),
            max_output: overrides.max_output.or(self.max_output),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            fuel: None,
            max_memory: Some(512 * Self::MB),
            max_diagnostics: Some(64 * Self::KB),
            max_output: Some(64 * Self::MB as u64),
        }
    }
}

/// Result of one execution of the compute module
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// How the execution ended
    pub status: ExecutionStatus,

    /// Exit status if the module exited (normal return counts as 0)
    pub exit_code: Option<i32>,

    /// Trap description if the module trapped
    pub trap: Option<String>,

    /// Fuel consumed, when fuel metering was active
    pub fuel_consumed: Option<u64>,

    /// Wall clock time spent executing, in seconds
    pub wall_time: f64,

    /// Captured standard output
    pub stdout: Vec<u8>,

    /// Captured standard error (diagnostic text)
    pub stderr: Vec<u8>,

    /// Standard output went past the capture limit and was cut short
    pub stdout_truncated: bool,

    /// Standard error went past the capture limit and was cut short
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    /// Check if the execution was successful (exited with code 0)
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Ok) && self.exit_code == Some(0)
    }

    /// Diagnostic text written to stderr, lossily decoded
    pub fn diagnostics(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self {
            status: ExecutionStatus::Ok,
            exit_code: None,
            trap: None,
            fuel_consumed: None,
            wall_time: 0.0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }
}

/// How an execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Module exited with status 0
    Ok,

    /// Module exited with a nonzero status
    RuntimeError,

    /// Module trapped (unreachable, out-of-bounds access, stack overflow, ...)
    Trapped,

    /// Fuel limit exhausted
    FuelExhausted,
}

impl ExecutionStatus {
    /// Status for a module that exited with `code`
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            ExecutionStatus::Ok
        } else {
            ExecutionStatus::RuntimeError
        }
    }
}
