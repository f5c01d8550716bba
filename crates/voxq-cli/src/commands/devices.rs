//! Device listing command.

use crate::DevicesArgs;
use anyhow::Result;
use tracing::debug;
use voxq_compute::{Backend, best_backend, describe_backends, detect_backends};

/// Prints every compiled-in backend with the devices its discovery found.
pub fn run(args: DevicesArgs) -> Result<()> {
    let mut backends = detect_backends();
    debug!(backends = backends.len(), "backends probed");

    let best = best_backend(&backends);
    if let Some(only) = args.backend.filter(|b| *b != Backend::Auto) {
        backends.retain(|b| b.backend == only);
    }

    print!("{}", describe_backends(&backends));
    println!();
    println!("auto selects: {best}");
    Ok(())
}
