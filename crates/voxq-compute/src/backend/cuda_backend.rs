//! CUDA compute backend.
//!
//! Requires the `cuda` feature and NVIDIA GPU with CUDA support. Programs
//! are compiled at runtime via NVRTC; the NVRTC log is surfaced on build
//! failure.

use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, LaunchConfig, PushKernelArg};
use cudarc::nvrtc::CompileError;
use tracing::{error, warn};

use super::{Backend, ComputeDevice, DeviceInfo, KernelArg};
use crate::kernels::KernelSource;
use crate::{ComputeError, ComputeResult, ResourceStage};

/// Maximum grid size along y and z.
const MAX_GRID_YZ: usize = 65_535;

/// CUDA device configuration.
#[derive(Debug, Clone)]
pub struct CudaConfig {
    /// Thread block shape used for 3D launches.
    pub block_dim: [u32; 3],
}

impl Default for CudaConfig {
    fn default() -> Self {
        // 512 threads per block
        Self { block_dim: [8, 8, 8] }
    }
}

impl CudaConfig {
    pub fn with_block_dim(mut self, block_dim: [u32; 3]) -> Self {
        self.block_dim = block_dim;
        self
    }
}

/// Device-side `i32` cells. Memory is freed when the last clone is dropped.
#[derive(Clone)]
pub struct CudaBuffer {
    slice: Arc<CudaSlice<i32>>,
    cells: usize,
}

impl CudaBuffer {
    pub fn cells(&self) -> usize { self.cells }
}

/// Loaded PTX module.
pub struct CudaProgram {
    module: Arc<CudaModule>,
    label: String,
}

enum CudaArg {
    Buffer(Arc<CudaSlice<i32>>),
    Int(i32),
}

/// Kernel function with bound arguments.
pub struct CudaKernel {
    function: CudaFunction,
    args: [Option<CudaArg>; 4],
}

/// CUDA device with its own stream.
#[derive(Clone)]
pub struct CudaDevice {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    info: DeviceInfo,
    config: CudaConfig,
}

impl CudaDevice {
    /// Check if CUDA is available.
    pub fn is_available() -> bool {
        CudaContext::new(0).is_ok()
    }

    /// Open device `ordinal`.
    pub fn new(ordinal: usize, config: CudaConfig) -> ComputeResult<Self> {
        let ctx = CudaContext::new(ordinal).map_err(|e| {
            ComputeError::DeviceCreation(format!("CUDA device {ordinal} init failed: {e:?}"))
        })?;
        let stream = ctx.new_stream().map_err(|e| {
            ComputeError::DeviceCreation(format!("CUDA device {ordinal} stream: {e:?}"))
        })?;

        let name = ctx.name().unwrap_or_else(|_| format!("cuda:{ordinal}"));
        let memory_bytes = ctx
            .bind_to_thread()
            .ok()
            .and_then(|_| cudarc::driver::result::mem_get_info().ok())
            .map(|(_free, total)| total as u64);

        Ok(Self {
            ctx,
            stream,
            info: DeviceInfo {
                name: format!("{name} (cuda:{ordinal})"),
                backend: Backend::Cuda,
                memory_bytes,
            },
            config,
        })
    }

    /// Open every CUDA device.
    pub fn discover() -> ComputeResult<Vec<Self>> {
        Self::discover_with(CudaConfig::default())
    }

    pub fn discover_with(config: CudaConfig) -> ComputeResult<Vec<Self>> {
        let count = CudaContext::device_count()
            .map_err(|e| ComputeError::DeviceCreation(format!("CUDA device count: {e:?}")))?;

        let mut devices = Vec::new();
        for ordinal in 0..count.max(0) as usize {
            match Self::new(ordinal, config.clone()) {
                Ok(device) => devices.push(device),
                Err(e) => warn!(ordinal, error = %e, "skipping CUDA device"),
            }
        }
        Ok(devices)
    }

    /// Launch config covering `global` with the configured block shape.
    fn launch_3d(&self, global: [usize; 3]) -> ComputeResult<LaunchConfig> {
        let block = self.config.block_dim.map(|b| b.max(1));
        let mut grid = [0u32; 3];
        for axis in 0..3 {
            let n = global[axis].div_ceil(block[axis] as usize);
            let limit = if axis == 0 { i32::MAX as usize } else { MAX_GRID_YZ };
            if n > limit {
                return Err(ComputeError::Dispatch(format!(
                    "{n} blocks on axis {axis} exceeds CUDA limit {limit}"
                )));
            }
            grid[axis] = n as u32;
        }

        Ok(LaunchConfig {
            grid_dim: (grid[0], grid[1], grid[2]),
            block_dim: (block[0], block[1], block[2]),
            shared_mem_bytes: 0,
        })
    }
}

impl ComputeDevice for CudaDevice {
    type Buffer = CudaBuffer;
    type Program = CudaProgram;
    type Kernel = CudaKernel;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer(&self, cells: usize) -> ComputeResult<Self::Buffer> {
        let slice: CudaSlice<i32> = self.stream.alloc_zeros(cells).map_err(|e| {
            ComputeError::resource(ResourceStage::Buffer, &self.info.name, format!("alloc {cells} cells: {e:?}"))
        })?;
        Ok(CudaBuffer { slice: Arc::new(slice), cells })
    }

    fn build_program(&self, source: &KernelSource) -> ComputeResult<Self::Program> {
        let message = format!("failed to build {}", source.label());

        let ptx = cudarc::nvrtc::compile_ptx(source.text()).map_err(|e| {
            let log = match e {
                CompileError::CompileError { log, .. } => log.to_string_lossy().into_owned(),
                other => format!("{other:?}"),
            };
            error!(device = %self.info.name, source = source.label(), "program build failed:\n{log}");
            ComputeError::build_failed(&self.info.name, message, log)
        })?;

        let module = self.ctx.load_module(ptx).map_err(|e| {
            ComputeError::resource(ResourceStage::Program, &self.info.name, format!("module load failed: {e:?}"))
        })?;

        Ok(CudaProgram { module, label: source.label().to_string() })
    }

    fn create_kernel(&self, program: &Self::Program, entry_point: &str) -> ComputeResult<Self::Kernel> {
        let function = program.module.load_function(entry_point).map_err(|e| {
            ComputeError::resource(
                ResourceStage::Kernel,
                &self.info.name,
                format!("entry point '{entry_point}' in {}: {e:?}", program.label),
            )
        })?;
        Ok(CudaKernel { function, args: [None, None, None, None] })
    }

    fn set_arg(&self, kernel: &mut Self::Kernel, index: u32, arg: KernelArg<'_, Self::Buffer>) -> ComputeResult<()> {
        let value = match (index, arg) {
            (0, KernelArg::Buffer(buf)) => CudaArg::Buffer(Arc::clone(&buf.slice)),
            (1..=3, KernelArg::Int(v)) => CudaArg::Int(v),
            (0..=3, arg) => {
                let expected = if index == 0 { "buffer" } else { "int" };
                return Err(ComputeError::ArgumentBinding {
                    index,
                    message: format!("expected {expected}, got {}", arg.kind()),
                });
            }
            _ => {
                return Err(ComputeError::ArgumentBinding {
                    index,
                    message: "kernel takes 4 arguments".into(),
                });
            }
        };
        kernel.args[index as usize] = Some(value);
        Ok(())
    }

    fn enqueue(&self, kernel: &Self::Kernel, global: [usize; 3]) -> ComputeResult<()> {
        let cfg = self.launch_3d(global)?;

        let mut builder = self.stream.launch_builder(&kernel.function);
        for (i, arg) in kernel.args.iter().enumerate() {
            match arg {
                Some(CudaArg::Buffer(slice)) => {
                    builder.arg(&**slice);
                }
                Some(CudaArg::Int(v)) => {
                    builder.arg(v);
                }
                None => return Err(ComputeError::Dispatch(format!("kernel argument {i} not set"))),
            }
        }

        #[allow(unsafe_code)]
        unsafe { builder.launch(cfg) }.map_err(|e| {
            ComputeError::Dispatch(format!("launch failed: {e:?}"))
        })?;
        Ok(())
    }

    fn finish(&self) -> ComputeResult<()> {
        self.stream
            .synchronize()
            .map_err(|e| ComputeError::Dispatch(format!("synchronize failed: {e:?}")))
    }
}
