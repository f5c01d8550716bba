//! Compute device backends.
//!
//! Provides host (rayon), wgpu and CUDA devices behind one trait.
//!
//! # Architecture
//!
//! ```text
//! ComputeResource<D: ComputeDevice>
//!     +-- HostDevice (rayon, always available)
//!     +-- WgpuDevice (Vulkan/Metal/DX12)
//!     +-- CudaDevice (NVIDIA CUDA + NVRTC)
//! ```
//!
//! A device mirrors the primitives a voxel resource needs: allocate a
//! buffer, build a program, resolve an entry point, bind positional
//! arguments, enqueue a 3D range and wait for the queue to finish.

mod detect;
mod host;

#[cfg(feature = "wgpu")]
mod wgpu_backend;

#[cfg(feature = "cuda")]
mod cuda_backend;

use std::fmt;
use std::str::FromStr;

pub use detect::{BackendInfo, best_backend, describe_backends, detect_backends, select_best_backend};
pub use host::{HostBuffer, HostConfig, HostDevice, HostKernel, HostProgram};

#[cfg(feature = "wgpu")]
pub use wgpu_backend::{WgpuBuffer, WgpuConfig, WgpuDevice, WgpuKernel, WgpuProgram};

#[cfg(feature = "cuda")]
pub use cuda_backend::{CudaBuffer, CudaConfig, CudaDevice, CudaKernel, CudaProgram};

use crate::kernels::KernelSource;
use crate::{ComputeError, ComputeResult};

/// Available compute backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Auto-select best available (CUDA > wgpu > host).
    #[default]
    Auto,
    /// Host CPU using rayon.
    Host,
    /// wgpu backend (Vulkan/Metal/DX12).
    Wgpu,
    /// NVIDIA CUDA backend.
    Cuda,
}

impl Backend {
    /// Check if this backend is available on current system.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Auto => true,
            Self::Host => true,
            #[cfg(feature = "wgpu")]
            Self::Wgpu => WgpuDevice::is_available(),
            #[cfg(not(feature = "wgpu"))]
            Self::Wgpu => false,
            #[cfg(feature = "cuda")]
            Self::Cuda => CudaDevice::is_available(),
            #[cfg(not(feature = "cuda"))]
            Self::Cuda => false,
        }
    }

    /// Get human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Host => "host",
            Self::Wgpu => "wgpu",
            Self::Cuda => "cuda",
        }
    }

    /// Resolve `Auto` to a concrete backend.
    pub fn resolve(self) -> Backend {
        match self {
            Self::Auto => select_best_backend(),
            other => other,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "host" | "cpu" => Ok(Self::Host),
            "wgpu" | "gpu" => Ok(Self::Wgpu),
            "cuda" => Ok(Self::Cuda),
            other => Err(ComputeError::BackendNotAvailable(format!("unknown backend '{other}'"))),
        }
    }
}

/// Description of a discovered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device name as reported by the runtime.
    pub name: String,
    /// Backend driving the device.
    pub backend: Backend,
    /// Device memory in bytes, if known.
    pub memory_bytes: Option<u64>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.backend)?;
        if let Some(bytes) = self.memory_bytes {
            write!(f, " {} MB", bytes / (1024 * 1024))?;
        }
        Ok(())
    }
}

/// Argument value for [`ComputeDevice::set_arg`].
#[derive(Debug)]
pub enum KernelArg<'a, B> {
    /// Device buffer argument.
    Buffer(&'a B),
    /// 32-bit signed scalar.
    Int(i32),
}

impl<B> KernelArg<'_, B> {
    /// Short type name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Buffer(_) => "buffer",
            Self::Int(_) => "int",
        }
    }
}

/// Device runtime primitives used by a compute resource.
///
/// Handles are cheap to clone (reference counted), so a resource keeps its
/// own clone of the device. A device and everything created from it are
/// used by a single worker thread.
pub trait ComputeDevice: Clone + Send + 'static {
    /// Device-resident `i32` buffer.
    type Buffer: Send + 'static;
    /// Compiled program.
    type Program: Send + 'static;
    /// Entry point with bound arguments.
    type Kernel: Send + 'static;

    /// Device description.
    fn info(&self) -> &DeviceInfo;

    /// Device name.
    fn name(&self) -> &str {
        &self.info().name
    }

    /// Allocate a read-write buffer of `cells` `i32` values.
    fn create_buffer(&self, cells: usize) -> ComputeResult<Self::Buffer>;

    /// Compile program text for this device.
    ///
    /// Build failures carry the compiler log.
    fn build_program(&self, source: &KernelSource) -> ComputeResult<Self::Program>;

    /// Resolve an entry point of a built program.
    fn create_kernel(&self, program: &Self::Program, entry_point: &str) -> ComputeResult<Self::Kernel>;

    /// Bind argument `index` of a kernel.
    fn set_arg(&self, kernel: &mut Self::Kernel, index: u32, arg: KernelArg<'_, Self::Buffer>) -> ComputeResult<()>;

    /// Enqueue a kernel over a 3D global range, one work item per element.
    fn enqueue(&self, kernel: &Self::Kernel, global: [usize; 3]) -> ComputeResult<()>;

    /// Block until all enqueued work has completed.
    fn finish(&self) -> ComputeResult<()>;
}
