//! wgpu backend implementation.
//!
//! One `WgpuDevice` per adapter. Resource creation runs inside wgpu error
//! scopes so validation failures come back as errors instead of reaching
//! the uncaptured error handler.

use std::sync::{Arc, mpsc};

use bytemuck::{Pod, Zeroable};
use tracing::{debug, error, warn};

use super::{Backend, ComputeDevice, DeviceInfo, KernelArg};
use crate::kernels::KernelSource;
use crate::{ComputeError, ComputeResult, ResourceStage};

// =============================================================================
// Uniform Buffers
// =============================================================================

/// Grid dimensions uniform: [width, height, depth, pad]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct DimsUniform {
    dims: [i32; 4],
}

// =============================================================================
// Config
// =============================================================================

/// wgpu device configuration.
#[derive(Debug, Clone)]
pub struct WgpuConfig {
    /// Workgroup size the kernel source declares with `@workgroup_size`.
    pub workgroup_size: [u32; 3],
    /// Adapter preference for `WgpuDevice::new`.
    pub power_preference: wgpu::PowerPreference,
    /// Keep software adapters (llvmpipe, WARP) during discovery.
    pub include_software: bool,
}

impl Default for WgpuConfig {
    fn default() -> Self {
        Self {
            workgroup_size: [4, 4, 4],
            power_preference: wgpu::PowerPreference::HighPerformance,
            include_software: false,
        }
    }
}

impl WgpuConfig {
    pub fn with_workgroup_size(mut self, size: [u32; 3]) -> Self {
        self.workgroup_size = size;
        self
    }

    pub fn with_power_preference(mut self, preference: wgpu::PowerPreference) -> Self {
        self.power_preference = preference;
        self
    }

    pub fn with_software_adapters(mut self, include: bool) -> Self {
        self.include_software = include;
        self
    }
}

// =============================================================================
// Handles
// =============================================================================

/// GPU storage buffer of `i32` cells.
#[derive(Debug, Clone)]
pub struct WgpuBuffer {
    buffer: Arc<wgpu::Buffer>,
    cells: usize,
}

impl WgpuBuffer {
    pub fn cells(&self) -> usize { self.cells }
    pub fn raw(&self) -> &wgpu::Buffer { &self.buffer }
}

/// Compiled WGSL module.
#[derive(Debug)]
pub struct WgpuProgram {
    module: wgpu::ShaderModule,
    label: String,
}

/// Compute pipeline with its argument state.
///
/// Argument 0 is the storage buffer (binding 0); arguments 1-3 are packed
/// into the dims uniform (binding 1).
#[derive(Debug)]
pub struct WgpuKernel {
    pipeline: wgpu::ComputePipeline,
    params: wgpu::Buffer,
    dims: DimsUniform,
    bound: [bool; 4],
    bind_group: Option<wgpu::BindGroup>,
}

// =============================================================================
// WgpuDevice
// =============================================================================

/// wgpu compute device.
#[derive(Clone)]
pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    info: DeviceInfo,
    limits: wgpu::Limits,
    config: WgpuConfig,
}

fn new_instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    })
}

impl WgpuDevice {
    /// Check if wgpu is available.
    pub fn is_available() -> bool {
        pollster::block_on(async {
            new_instance()
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .is_some()
        })
    }

    /// Open the preferred adapter.
    pub fn new(config: WgpuConfig) -> ComputeResult<Self> {
        let adapter = pollster::block_on(new_instance().request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: config.power_preference,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(ComputeError::NoDevice)?;

        Self::from_adapter(&adapter, config)
    }

    /// Open every usable adapter.
    pub fn discover() -> ComputeResult<Vec<Self>> {
        Self::discover_with(WgpuConfig::default())
    }

    pub fn discover_with(config: WgpuConfig) -> ComputeResult<Vec<Self>> {
        let mut devices = Vec::new();

        for adapter in new_instance().enumerate_adapters(wgpu::Backends::all()) {
            let info = adapter.get_info();
            if info.device_type == wgpu::DeviceType::Cpu && !config.include_software {
                debug!(adapter = %info.name, "skipping software adapter");
                continue;
            }
            match Self::from_adapter(&adapter, config.clone()) {
                Ok(device) => devices.push(device),
                Err(e) => warn!(adapter = %info.name, error = %e, "skipping adapter"),
            }
        }

        Ok(devices)
    }

    fn from_adapter(adapter: &wgpu::Adapter, config: WgpuConfig) -> ComputeResult<Self> {
        let adapter_info = adapter.get_info();
        let limits = adapter.limits();

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("voxq_device"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| ComputeError::DeviceCreation(format!("{}: {e}", adapter_info.name)))?;

        let name = adapter_info.name.clone();
        device.on_uncaptured_error(Box::new(move |e| {
            error!(device = %name, "uncaptured wgpu error: {e}");
        }));

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            info: DeviceInfo {
                name: format!("{} ({:?})", adapter_info.name, adapter_info.backend),
                backend: Backend::Wgpu,
                memory_bytes: None,
            },
            limits,
            config,
        })
    }

    fn resource_err(&self, stage: ResourceStage, message: impl Into<String>) -> ComputeError {
        ComputeError::resource(stage, &self.info.name, message)
    }

    fn pop_scope(&self) -> Option<wgpu::Error> {
        pollster::block_on(self.device.pop_error_scope())
    }

    fn write_dims(&self, kernel: &WgpuKernel) {
        self.queue.write_buffer(&kernel.params, 0, bytemuck::bytes_of(&kernel.dims));
    }
}

/// Format compiler messages as `label:line:col: kind: message`.
fn format_compilation_log(label: &str, info: &wgpu::CompilationInfo) -> String {
    info.messages
        .iter()
        .map(|m| {
            let kind = match m.message_type {
                wgpu::CompilationMessageType::Error => "error",
                wgpu::CompilationMessageType::Warning => "warning",
                _ => "info",
            };
            match &m.location {
                Some(loc) => format!("{label}:{}:{}: {kind}: {}", loc.line_number, loc.line_position, m.message),
                None => format!("{label}: {kind}: {}", m.message),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl ComputeDevice for WgpuDevice {
    type Buffer = WgpuBuffer;
    type Program = WgpuProgram;
    type Kernel = WgpuKernel;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer(&self, cells: usize) -> ComputeResult<Self::Buffer> {
        let size = (cells as u64).saturating_mul(4);
        let max = self.limits.max_buffer_size.min(self.limits.max_storage_buffer_binding_size as u64);
        if size > max {
            return Err(self.resource_err(
                ResourceStage::Buffer,
                format!("{size} bytes exceeds the device limit of {max}"),
            ));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("voxel_buffer"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(e) = self.pop_scope() {
            return Err(self.resource_err(ResourceStage::Buffer, e.to_string()));
        }

        Ok(WgpuBuffer { buffer: Arc::new(buffer), cells })
    }

    fn build_program(&self, source: &KernelSource) -> ComputeResult<Self::Program> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(source.label()),
            source: wgpu::ShaderSource::Wgsl(source.text().into()),
        });
        let info = pollster::block_on(module.get_compilation_info());
        let scope_err = self.pop_scope();

        let log = format_compilation_log(source.label(), &info);
        let has_errors = info
            .messages
            .iter()
            .any(|m| matches!(m.message_type, wgpu::CompilationMessageType::Error));

        if has_errors || scope_err.is_some() {
            let log = match (log.is_empty(), scope_err) {
                (true, Some(e)) => e.to_string(),
                _ => log,
            };
            error!(device = %self.info.name, source = source.label(), "program build failed:\n{log}");
            return Err(ComputeError::build_failed(
                &self.info.name,
                format!("failed to build {}", source.label()),
                log,
            ));
        }
        if !log.is_empty() {
            debug!(device = %self.info.name, "compiler messages:\n{log}");
        }

        Ok(WgpuProgram { module, label: source.label().to_string() })
    }

    fn create_kernel(&self, program: &Self::Program, entry_point: &str) -> ComputeResult<Self::Kernel> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry_point),
            layout: None, // Auto layout
            module: &program.module,
            entry_point: Some(entry_point),
            compilation_options: Default::default(),
            cache: None,
        });
        if let Some(e) = self.pop_scope() {
            return Err(self.resource_err(
                ResourceStage::Kernel,
                format!("entry point '{entry_point}' in {}: {e}", program.label),
            ));
        }

        let params = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("voxel_dims"),
            size: std::mem::size_of::<DimsUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(WgpuKernel {
            pipeline,
            params,
            dims: DimsUniform::default(),
            bound: [false; 4],
            bind_group: None,
        })
    }

    fn set_arg(&self, kernel: &mut Self::Kernel, index: u32, arg: KernelArg<'_, Self::Buffer>) -> ComputeResult<()> {
        let bind_err = |message: String| ComputeError::ArgumentBinding { index, message };

        match (index, arg) {
            (0, KernelArg::Buffer(buf)) => {
                self.device.push_error_scope(wgpu::ErrorFilter::Validation);
                let layout = kernel.pipeline.get_bind_group_layout(0);
                let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("voxel_bind_group"),
                    layout: &layout,
                    entries: &[
                        wgpu::BindGroupEntry { binding: 0, resource: buf.buffer.as_entire_binding() },
                        wgpu::BindGroupEntry { binding: 1, resource: kernel.params.as_entire_binding() },
                    ],
                });
                if let Some(e) = self.pop_scope() {
                    return Err(bind_err(e.to_string()));
                }
                kernel.bind_group = Some(bind_group);
            }
            (1..=3, KernelArg::Int(value)) => {
                kernel.dims.dims[index as usize - 1] = value;
                self.write_dims(kernel);
            }
            (0..=3, arg) => {
                let expected = if index == 0 { "buffer" } else { "int" };
                return Err(bind_err(format!("expected {expected}, got {}", arg.kind())));
            }
            _ => return Err(bind_err("kernel takes 4 arguments".into())),
        }

        kernel.bound[index as usize] = true;
        Ok(())
    }

    fn enqueue(&self, kernel: &Self::Kernel, global: [usize; 3]) -> ComputeResult<()> {
        if let Some(i) = kernel.bound.iter().position(|b| !b) {
            return Err(ComputeError::Dispatch(format!("kernel argument {i} not set")));
        }
        let bind_group = kernel
            .bind_group
            .as_ref()
            .ok_or_else(|| ComputeError::Dispatch("no bind group".into()))?;

        let max_groups = self.limits.max_compute_workgroups_per_dimension;
        let mut groups = [0u32; 3];
        for axis in 0..3 {
            let size = self.config.workgroup_size[axis].max(1) as usize;
            let n = global[axis].div_ceil(size);
            groups[axis] = u32::try_from(n)
                .ok()
                .filter(|&n| n <= max_groups)
                .ok_or_else(|| {
                    ComputeError::Dispatch(format!(
                        "{n} workgroups on axis {axis} exceeds device limit {max_groups}"
                    ))
                })?;
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("voxel_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("voxel_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        if let Some(e) = self.pop_scope() {
            return Err(ComputeError::Dispatch(e.to_string()));
        }
        Ok(())
    }

    fn finish(&self) -> ComputeResult<()> {
        let (tx, rx) = mpsc::channel();
        self.queue.on_submitted_work_done(move || {
            let _ = tx.send(());
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);

        rx.try_recv()
            .map_err(|_| ComputeError::Dispatch("device did not confirm completion".into()))
    }
}
