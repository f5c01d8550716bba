//! Device-resident voxel buffer with its compiled kernel.

use std::fmt;

use tracing::{debug, info};

use crate::backend::{ComputeDevice, KernelArg};
use crate::extent::Extent;
use crate::kernels::{ENTRY_POINT, KernelSource};
use crate::{ComputeError, ComputeResult};

/// One voxel grid on one device, ready to dispatch.
///
/// Owns a buffer of `extent.cells()` `i32` values, the program built from
/// the kernel source and the kernel whose arguments are bound to
/// `(buffer, width, height, depth)`. The extent is fixed at construction.
///
/// Dropping the resource releases kernel, program and buffer, in that
/// order.
pub struct ComputeResource<D: ComputeDevice> {
    // Field order is release order.
    kernel: D::Kernel,
    program: D::Program,
    buffer: D::Buffer,
    device: D,
    extent: Extent,
    dispatches: u64,
}

impl<D: ComputeDevice> ComputeResource<D> {
    /// Allocate the buffer, build the program, resolve [`ENTRY_POINT`] and
    /// bind its arguments.
    pub fn new(device: D, extent: Extent, source: &KernelSource) -> ComputeResult<Self> {
        let buffer = device.create_buffer(extent.cells_usize()?)?;
        let program = device.build_program(source)?;
        let mut kernel = device.create_kernel(&program, ENTRY_POINT)?;
        bind_arguments(&device, &mut kernel, &buffer, extent)?;

        info!(
            device = %device.name(),
            extent = %extent,
            bytes = extent.size_bytes(),
            source = source.label(),
            "Created voxel resource"
        );

        Ok(Self {
            kernel,
            program,
            buffer,
            device,
            extent,
            dispatches: 0,
        })
    }

    /// Dispatch the kernel over one work item per voxel and wait for the
    /// device to finish.
    ///
    /// Each call reprocesses the same buffer; nothing is read back.
    pub fn process(&mut self) -> ComputeResult<()> {
        self.device.enqueue(&self.kernel, self.extent.global_size())?;
        self.device.finish()?;
        self.dispatches += 1;
        Ok(())
    }

    /// Grid extent fixed at construction.
    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Completed `process` calls.
    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Device buffer holding the voxels.
    pub fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }

    /// Built program.
    pub fn program(&self) -> &D::Program {
        &self.program
    }
}

/// Bind `(buffer, width, height, depth)` in positional order.
///
/// Any failure is reported as [`ComputeError::ArgumentBinding`] carrying the
/// rejected index.
fn bind_arguments<D: ComputeDevice>(
    device: &D,
    kernel: &mut D::Kernel,
    buffer: &D::Buffer,
    extent: Extent,
) -> ComputeResult<()> {
    let [w, h, d] = extent.as_kernel_args();
    let args = [
        KernelArg::Buffer(buffer),
        KernelArg::Int(w),
        KernelArg::Int(h),
        KernelArg::Int(d),
    ];

    for (index, arg) in (0u32..).zip(args) {
        device.set_arg(kernel, index, arg).map_err(|e| match e {
            e @ ComputeError::ArgumentBinding { .. } => e,
            other => ComputeError::ArgumentBinding { index, message: other.to_string() },
        })?;
    }
    Ok(())
}

impl<D: ComputeDevice> Drop for ComputeResource<D> {
    fn drop(&mut self) {
        debug!(
            device = %self.device.name(),
            extent = %self.extent,
            dispatches = self.dispatches,
            "Releasing voxel resource"
        );
    }
}

impl<D: ComputeDevice> fmt::Debug for ComputeResource<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeResource")
            .field("device", &self.device.name())
            .field("extent", &self.extent)
            .field("dispatches", &self.dispatches)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, HostConfig, HostDevice};
    use crate::ResourceStage;

    fn host() -> HostDevice {
        HostDevice::new(HostConfig::default()).unwrap()
    }

    #[test]
    fn test_process_increments_every_voxel() {
        let extent = Extent::new(5, 3, 2).unwrap();
        let mut res = ComputeResource::new(host(), extent, &KernelSource::builtin(Backend::Host)).unwrap();

        assert!(res.buffer().to_vec().iter().all(|&v| v == 0));
        res.process().unwrap();
        res.process().unwrap();
        res.process().unwrap();

        assert_eq!(res.dispatches(), 3);
        assert_eq!(res.buffer().len(), 30);
        assert!(res.buffer().to_vec().iter().all(|&v| v == 3));
    }

    #[test]
    fn test_build_failure_carries_log() {
        let src = KernelSource::from_text("broken.cl", "void increment_voxels(int* v) {");
        let err = ComputeResource::new(host(), Extent::cube(2).unwrap(), &src).unwrap_err();

        match err {
            ComputeError::ResourceCreation { stage, build_log, .. } => {
                assert_eq!(stage, ResourceStage::Program);
                assert!(build_log.unwrap().contains("unclosed '{'"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_buffer_failure() {
        let dev = HostDevice::new(HostConfig::default().with_max_buffer_bytes(16)).unwrap();
        let err = ComputeResource::new(dev, Extent::cube(4).unwrap(), &KernelSource::builtin(Backend::Host))
            .unwrap_err();
        assert!(matches!(err, ComputeError::ResourceCreation { stage: ResourceStage::Buffer, .. }));
    }
}
