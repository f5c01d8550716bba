//! Voxel job dispatch command.

use crate::RunArgs;
use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use voxq_compute::{
    Backend, ComputeDevice, Fleet, HostDevice, KernelSource, WorkerConfig, WorkerEvent, WorkerOutcome,
};

/// Runs the job stream on every selected device of the chosen backend.
///
/// Exits with failure if any worker stopped on an error.
pub fn run(args: RunArgs) -> Result<ExitCode> {
    let backend = args.backend.resolve();
    if !backend.is_available() {
        bail!("Backend '{}' is not available", backend);
    }

    let mut config = WorkerConfig::default();
    if let Some(path) = &args.kernel {
        let source = KernelSource::from_file(path)
            .with_context(|| format!("Failed to load kernel: {}", path.display()))?;
        config = config.with_kernel(source);
    }

    info!(backend = %backend, extent = %args.extent, jobs = args.jobs, "Starting run");

    let (outcomes, timings) = match backend {
        Backend::Host => dispatch(HostDevice::discover().context("Host discovery failed")?, &args, config)?,
        #[cfg(feature = "wgpu")]
        Backend::Wgpu => dispatch(
            voxq_compute::WgpuDevice::discover().context("wgpu discovery failed")?,
            &args,
            config,
        )?,
        #[cfg(feature = "cuda")]
        Backend::Cuda => dispatch(
            voxq_compute::CudaDevice::discover().context("CUDA discovery failed")?,
            &args,
            config,
        )?,
        other => bail!("Backend '{}' is not compiled in (enable the `{}` feature)", other, other.name()),
    };

    Ok(print_report(&outcomes, &timings))
}

/// Per-worker job count and total kernel time.
type Timings = HashMap<String, (u64, Duration)>;

fn dispatch<D: ComputeDevice>(
    all: Vec<D>,
    args: &RunArgs,
    config: WorkerConfig,
) -> Result<(Vec<WorkerOutcome>, Timings)> {
    let devices = super::select_devices(all, &args.devices)?;
    if devices.is_empty() {
        bail!("No devices found");
    }
    for (index, device) in devices.iter().enumerate() {
        info!(index, device = %device.info(), "Using device");
    }

    let (tx, rx) = mpsc::channel();
    let fleet = Fleet::launch_with_events(devices, config, tx).context("Failed to launch workers")?;

    let start = Instant::now();
    for _ in 0..args.jobs {
        fleet.broadcast(args.extent);
    }
    debug!(workers = fleet.len(), jobs = args.jobs, "Jobs queued");

    let left = fleet.drain();
    if left > 0 {
        warn!(left, "Jobs left unprocessed by stopped workers");
    }
    let outcomes = fleet.shutdown();
    info!(elapsed = ?start.elapsed(), "Run complete");

    // All senders are gone once the fleet has shut down.
    let mut timings = Timings::new();
    for event in rx {
        trace!(?event, "worker event");
        if let WorkerEvent::JobCompleted { worker, elapsed, .. } = event {
            let entry = timings.entry(worker).or_default();
            entry.0 += 1;
            entry.1 += elapsed;
        }
    }

    Ok((outcomes, timings))
}

fn print_report(outcomes: &[WorkerOutcome], timings: &Timings) -> ExitCode {
    let mut failed = 0;
    for outcome in outcomes {
        match &outcome.result {
            Ok(report) => {
                let per_job = timings
                    .get(&outcome.name)
                    .filter(|(n, _)| *n > 0)
                    .map(|(n, total)| total.as_secs_f64() * 1000.0 / *n as f64);
                match per_job {
                    Some(ms) => println!("{report} ({ms:.3} ms/job)"),
                    None => println!("{report}"),
                }
            }
            Err(e) => {
                failed += 1;
                println!("{}: FAILED: {}", outcome.name, e);
                if let Some(log) = e.build_log() {
                    println!("{log}");
                }
            }
        }
    }

    if failed > 0 {
        eprintln!("{} of {} workers failed", failed, outcomes.len());
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
