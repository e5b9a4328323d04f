//! pmax CLI
//!
//! A command-line tool for recompressing images through the sandboxed
//! compute module.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pmax::{Bridge, Config, EXAMPLE_CONFIG, InvocationParameters, ResourceLimits, RunError};
use tracing::{Level, debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pmax")]
#[command(about = "Recompress images with a sandboxed WebAssembly module")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the compute module (overrides `module_path`)
    #[arg(short, long, global = true)]
    module: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: pmax.toml)
        #[arg(short, long, default_value = "pmax.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Recompress one image
    Compress {
        /// Image to recompress
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Output path (default: FILE with `.min` before the extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// JPEG quality (0-100)
        #[arg(short, long)]
        quality: Option<f32>,

        /// Maximum edge length in pixels
        #[arg(short, long)]
        size: Option<u32>,

        /// Keep EXIF and other metadata
        #[arg(long)]
        keep_exif: bool,

        /// Denoise before encoding
        #[arg(long)]
        denoise: bool,

        /// Fuel available to the module
        #[arg(long)]
        fuel: Option<u64>,
    },

    /// Compile the module and list its exports
    Check,

    /// Show effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::default()
    };

    if let Some(module) = cli.module {
        config = config.with_module_path(module);
    }

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Compress {
            input,
            output,
            quality,
            size,
            keep_exif,
            denoise,
            fuel,
        } => {
            let mut params = config.defaults;
            if let Some(quality) = quality {
                params.quality = quality;
            }
            if let Some(size) = size {
                params.size = size;
            }
            if keep_exif {
                params.delete_exif = false;
            }
            if denoise {
                params.denoise = true;
            }

            let output = output.unwrap_or_else(|| default_output_path(&input));
            run_compress(config, &input, &output, &params, fuel).await
        }
        Commands::Check => run_check(config).await,
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

async fn run_compress(
    config: Config,
    input: &Path,
    output: &Path,
    params: &InvocationParameters,
    fuel: Option<u64>,
) -> Result<()> {
    let image = tokio::fs::read(input)
        .await
        .with_context(|| format!("failed to read '{}'", input.display()))?;

    let bridge = Bridge::from_config(config).context("failed to set up bridge")?;

    let overrides = fuel.map(|fuel| ResourceLimits::empty().with_fuel(fuel));

    info!(input = %input.display(), len = image.len(), ?params, "compressing");
    let report = match bridge
        .run_with_report(&image, params, overrides.as_ref())
        .await
    {
        Ok(report) => report,
        Err(RunError::ExecutionFailed {
            exit_code,
            diagnostics,
        }) => {
            eprintln!("Module exited with status {exit_code}");
            if !diagnostics.is_empty() {
                eprintln!("{}", diagnostics.trim_end());
            }
            std::process::exit(exit_code);
        }
        Err(e) => return Err(e).context("compression failed"),
    };

    tokio::fs::write(output, &report.output)
        .await
        .with_context(|| format!("failed to write '{}'", output.display()))?;

    info!(
        output = %output.display(),
        before = image.len(),
        after = report.output.len(),
        wall_time = format_args!("{:.3}s", report.execution.wall_time),
        fuel_consumed = report.execution.fuel_consumed,
        "compressed"
    );
    println!(
        "{} -> {} ({} -> {} bytes)",
        input.display(),
        output.display(),
        image.len(),
        report.output.len()
    );

    Ok(())
}

async fn run_check(config: Config) -> Result<()> {
    let bridge = Bridge::from_config(config).context("failed to set up bridge")?;
    let module = bridge
        .cache()
        .get()
        .await
        .context("failed to compile module")?;

    println!("Module: {}", module.origin());
    println!("Size: {} bytes", module.size());
    println!("Exports:");
    let mut exports: Vec<_> = module.exports().collect();
    exports.sort_unstable();
    for name in exports {
        println!("  {name}");
    }

    Ok(())
}

fn show_config(config: &Config) {
    let limits = config.effective_limits(None);

    match &config.module_path {
        Some(path) => println!("Module: {}", path.display()),
        None => println!("Module: (not set)"),
    }
    println!("Program name: {:?}", config.program_name);
    println!("Scratch root: {}", config.scratch_root().display());
    println!("Max module size: {} bytes", config.max_module_size);
    println!("Optimize: {}", config.optimize);
    println!();
    println!("Resource limits:");
    println!("  Fuel: {:?}", limits.fuel);
    println!("  Max memory: {:?} bytes", limits.max_memory);
    println!("  Max diagnostics: {:?} bytes", limits.max_diagnostics);
    println!("  Max output: {:?} bytes", limits.max_output);
    println!();
    println!("Default parameters:");
    println!("  Quality: {}", config.defaults.quality);
    println!("  Size: {}", config.defaults.size);
    println!("  Delete EXIF: {}", config.defaults.delete_exif);
    println!("  Denoise: {}", config.defaults.denoise);
}

fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = match input.extension() {
        Some(ext) => format!("{stem}.min.{}", ext.to_string_lossy()),
        None => format!("{stem}.min"),
    };
    input.with_file_name(name)
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
