//! Per-device voxel job dispatch.
//!
//! Each compute device gets one [`DeviceWorker`]: a FIFO of pending voxel
//! jobs drained by a dedicated thread. The worker lazily builds a single
//! [`ComputeResource`] (device buffer, compiled program, bound kernel) on
//! its first job and runs every job against it, blocking until the device
//! reports completion.
//!
//! # Architecture
//!
//! ```text
//! Fleet (one thread per device)
//!     └── DeviceWorker<D: ComputeDevice>
//!             ├── job queue (Mutex + Condvar)
//!             └── ComputeResource<D>
//!                     ├── HostDevice (rayon)
//!                     ├── WgpuDevice (compute shaders)
//!                     └── CudaDevice (NVRTC kernels)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use voxq_compute::{DeviceWorker, Extent, HostDevice, WorkerConfig};
//!
//! let device = HostDevice::discover()?.remove(0);
//! let worker = DeviceWorker::new(device, WorkerConfig::default()).spawn()?;
//!
//! worker.handle().submit(Extent::new(64, 64, 64)?);
//! worker.handle().wait_until_idle();
//! let report = worker.shutdown()?;
//! ```

pub mod backend;
pub mod extent;
pub mod fleet;
pub mod kernels;
pub mod resource;
pub mod worker;

pub use backend::{
    Backend, BackendInfo, ComputeDevice, DeviceInfo, HostConfig, HostDevice, KernelArg,
    best_backend, describe_backends, detect_backends, select_best_backend,
};
#[cfg(feature = "wgpu")]
pub use backend::{WgpuConfig, WgpuDevice};
#[cfg(feature = "cuda")]
pub use backend::{CudaConfig, CudaDevice};
pub use extent::Extent;
pub use fleet::{Fleet, WorkerOutcome};
pub use kernels::{ENTRY_POINT, KernelSource};
pub use resource::ComputeResource;
pub use worker::{
    DeviceWorker, RunReport, WorkerConfig, WorkerEvent, WorkerHandle, WorkerState, WorkerThread,
};

use std::fmt;

use thiserror::Error;

/// Setup step of a [`ComputeResource`] that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStage {
    /// Device buffer allocation.
    Buffer,
    /// Program load or compilation.
    Program,
    /// Entry point (kernel) resolution.
    Kernel,
}

impl fmt::Display for ResourceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer => write!(f, "buffer"),
            Self::Program => write!(f, "program"),
            Self::Kernel => write!(f, "kernel"),
        }
    }
}

/// Compute errors
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("Failed to create {stage} on {device}: {message}")]
    ResourceCreation {
        stage: ResourceStage,
        device: String,
        message: String,
        /// Compiler diagnostics, present for build failures.
        build_log: Option<String>,
    },

    #[error("Failed to bind kernel argument {index}: {message}")]
    ArgumentBinding { index: u32, message: String },

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Invalid extent: {0}")]
    InvalidExtent(String),

    #[error("No suitable compute device found")]
    NoDevice,

    #[error("Backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("Failed to create device: {0}")]
    DeviceCreation(String),

    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(String),

    #[error("Worker thread panicked: {0}")]
    WorkerPanicked(String),
}

impl ComputeError {
    /// Shorthand for a [`ComputeError::ResourceCreation`] without a build log.
    pub fn resource(stage: ResourceStage, device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceCreation {
            stage,
            device: device.into(),
            message: message.into(),
            build_log: None,
        }
    }

    /// Program build failure carrying the compiler log.
    pub fn build_failed(device: impl Into<String>, message: impl Into<String>, log: impl Into<String>) -> Self {
        Self::ResourceCreation {
            stage: ResourceStage::Program,
            device: device.into(),
            message: message.into(),
            build_log: Some(log.into()),
        }
    }

    /// Compiler log attached to a build failure, if any.
    pub fn build_log(&self) -> Option<&str> {
        match self {
            Self::ResourceCreation { build_log, .. } => build_log.as_deref(),
            _ => None,
        }
    }
}

pub type ComputeResult<T> = Result<T, ComputeError>;
