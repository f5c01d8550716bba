//! voxq - dispatch voxel jobs onto compute devices
//!
//! Discovers the devices of one backend, starts a worker thread per device
//! and feeds every worker the same stream of voxel jobs.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use voxq_compute::{Backend, Extent};

mod commands;

#[derive(Parser)]
#[command(name = "voxq")]
#[command(author, version, about = "Per-device voxel job dispatch")]
#[command(long_about = "
Runs voxel jobs on every compute device of a backend, one worker thread
per device. Each worker builds its buffer and kernel on the first job
and processes jobs in submission order.

Examples:
  voxq devices                          # List backends and devices
  voxq run                              # 1 job of 64x64x64 on the best backend
  voxq run -b host -e 128x128x32 -n 50  # 50 jobs per device
  voxq run -b cuda --device 0 --device 2
  voxq run -b wgpu -k my_kernel.wgsl
  RUST_LOG=voxq_compute=trace voxq run
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Number of host threads (0 = auto)
    #[arg(short = 'j', long, global = true, default_value = "0")]
    threads: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// List backends and discovered devices
    #[command(visible_alias = "d")]
    Devices(DevicesArgs),

    /// Dispatch voxel jobs on every selected device
    #[command(visible_alias = "r")]
    Run(RunArgs),
}

#[derive(Args)]
struct DevicesArgs {
    /// Only list devices of this backend
    #[arg(short, long)]
    backend: Option<Backend>,
}

#[derive(Args)]
struct RunArgs {
    /// Backend: auto, host, wgpu, cuda
    #[arg(short, long, default_value = "auto")]
    backend: Backend,

    /// Voxel grid extent (WxHxD, or N for a cube)
    #[arg(short, long, default_value = "64x64x64")]
    extent: Extent,

    /// Jobs submitted to each device
    #[arg(short = 'n', long, default_value = "1")]
    jobs: usize,

    /// Kernel source file (defaults to the built-in kernel)
    #[arg(short, long)]
    kernel: Option<PathBuf>,

    /// Device index to use (repeatable, default: all)
    #[arg(short, long = "device")]
    devices: Vec<usize>,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Configure thread pool
    if cli.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(cli.threads)
            .build_global()
            .context("Failed to configure thread pool")?;
    }

    match cli.command {
        Commands::Devices(args) => commands::devices::run(args).map(|()| ExitCode::SUCCESS),
        Commands::Run(args) => commands::run::run(args),
    }
}
