//! Backend probing by device discovery.
//!
//! A backend counts as available when its discovery returns at least one
//! device. Probing opens every device once; callers keep the returned list
//! instead of probing again.

use super::{Backend, ComputeDevice, DeviceInfo, HostDevice};
use crate::ComputeResult;

/// Outcome of probing one compiled-in backend.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub backend: Backend,
    /// Devices found, in discovery order.
    pub devices: Vec<DeviceInfo>,
    /// Discovery failure, if any.
    pub error: Option<String>,
}

impl BackendInfo {
    fn probe<D: ComputeDevice>(backend: Backend, found: ComputeResult<Vec<D>>) -> Self {
        match found {
            Ok(devices) => Self {
                backend,
                devices: devices.iter().map(|d| d.info().clone()).collect(),
                error: None,
            },
            Err(e) => {
                tracing::debug!(backend = %backend, error = %e, "discovery failed");
                Self { backend, devices: Vec::new(), error: Some(e.to_string()) }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        !self.devices.is_empty()
    }

    /// Auto-selection rank; dedicated GPU runtimes win over the host.
    pub fn rank(&self) -> u8 {
        match self.backend {
            Backend::Cuda => 3,
            Backend::Wgpu => 2,
            Backend::Host => 1,
            Backend::Auto => 0,
        }
    }
}

/// Discover the devices of every compiled-in backend, best first.
pub fn detect_backends() -> Vec<BackendInfo> {
    let mut backends = vec![BackendInfo::probe(Backend::Host, HostDevice::discover())];

    #[cfg(feature = "wgpu")]
    backends.push(BackendInfo::probe(Backend::Wgpu, super::WgpuDevice::discover()));

    #[cfg(feature = "cuda")]
    backends.push(BackendInfo::probe(Backend::Cuda, super::CudaDevice::discover()));

    backends.sort_by_key(|b| std::cmp::Reverse((b.is_available(), b.rank())));
    backends
}

/// Best backend in an already probed list, falling back to the host.
pub fn best_backend(backends: &[BackendInfo]) -> Backend {
    backends
        .iter()
        .filter(|b| b.is_available())
        .max_by_key(|b| b.rank())
        .map(|b| b.backend)
        .unwrap_or(Backend::Host)
}

/// Probe and pick the best backend.
pub fn select_best_backend() -> Backend {
    best_backend(&detect_backends())
}

/// One line per backend followed by its devices.
pub fn describe_backends(backends: &[BackendInfo]) -> String {
    let mut desc = String::new();
    for info in backends {
        match (&info.error, info.devices.len()) {
            (Some(e), _) => desc.push_str(&format!("{}: discovery failed: {e}\n", info.backend)),
            (None, 0) => desc.push_str(&format!("{}: no devices\n", info.backend)),
            (None, n) => desc.push_str(&format!("{}: {n} device(s)\n", info.backend)),
        }
        for (index, device) in info.devices.iter().enumerate() {
            desc.push_str(&format!("  [{index}] {device}\n"));
        }
    }
    desc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(backend: Backend, names: &[&str]) -> BackendInfo {
        BackendInfo {
            backend,
            devices: names
                .iter()
                .map(|n| DeviceInfo { name: n.to_string(), backend, memory_bytes: None })
                .collect(),
            error: None,
        }
    }

    #[test]
    fn test_host_always_found() {
        let backends = detect_backends();
        let host = backends.iter().find(|b| b.backend == Backend::Host).unwrap();
        assert_eq!(host.devices.len(), 1);
        assert!(host.is_available());
    }

    #[test]
    fn test_best_backend_skips_empty() {
        let probed = [fake(Backend::Cuda, &[]), fake(Backend::Wgpu, &["gpu"]), fake(Backend::Host, &["cpu"])];
        assert_eq!(best_backend(&probed), Backend::Wgpu);
        assert_eq!(best_backend(&[fake(Backend::Cuda, &[])]), Backend::Host);
    }

    #[test]
    fn test_describe_lists_devices() {
        let mut failed = fake(Backend::Cuda, &[]);
        failed.error = Some("no driver".into());
        let desc = describe_backends(&[fake(Backend::Wgpu, &["a", "b"]), failed]);

        assert!(desc.contains("wgpu: 2 device(s)"));
        assert!(desc.contains("  [1] b [wgpu]"));
        assert!(desc.contains("cuda: discovery failed: no driver"));
    }
}
