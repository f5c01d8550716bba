//! CLI command implementations

pub mod devices;
pub mod run;

use anyhow::{Result, bail};

/// Pick devices by index, keeping the requested order. Empty selects all.
pub fn select_devices<D: Clone>(all: Vec<D>, indices: &[usize]) -> Result<Vec<D>> {
    if indices.is_empty() {
        return Ok(all);
    }
    let mut picked = Vec::with_capacity(indices.len());
    for &index in indices {
        match all.get(index) {
            Some(device) => picked.push(device.clone()),
            None => bail!("device index {} out of range ({} found)", index, all.len()),
        }
    }
    Ok(picked)
}
