//! Host backend using rayon for parallelization.
//!
//! Programs are "built" by a light syntax check of the source text; entry
//! points declared in the source resolve to native Rust implementations.
//! Work runs to completion inside `enqueue`, so `finish` is a barrier that
//! never waits.

use std::sync::{Arc, Mutex, PoisonError};

use rayon::prelude::*;
use tracing::{debug, error};

use super::{Backend, ComputeDevice, DeviceInfo, KernelArg};
use crate::kernels::{ENTRY_POINT, KernelSource};
use crate::{ComputeError, ComputeResult, ResourceStage};

/// Host device configuration.
#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    /// Worker threads for kernel execution (0 = rayon global pool).
    pub threads: usize,
    /// Allocation cap for a single buffer (None = unlimited).
    pub max_buffer_bytes: Option<u64>,
}

impl HostConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_max_buffer_bytes(mut self, bytes: u64) -> Self {
        self.max_buffer_bytes = Some(bytes);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgKind {
    Buffer,
    Int,
}

impl ArgKind {
    fn name(self) -> &'static str {
        match self {
            Self::Buffer => "buffer",
            Self::Int => "int",
        }
    }
}

type NativeFn = fn(&mut [i32], &[i32], [usize; 3]) -> Result<(), String>;

struct NativeKernel {
    name: &'static str,
    signature: &'static [ArgKind],
    func: NativeFn,
}

const NATIVE_KERNELS: &[NativeKernel] = &[NativeKernel {
    name: ENTRY_POINT,
    signature: &[ArgKind::Buffer, ArgKind::Int, ArgKind::Int, ArgKind::Int],
    func: increment_voxels,
}];

/// Add one to every cell of a `width x height x depth` grid covered by
/// the global range.
fn increment_voxels(cells: &mut [i32], dims: &[i32], global: [usize; 3]) -> Result<(), String> {
    let [w, h, d] = [dims[0], dims[1], dims[2]].map(|v| v.max(0) as usize);
    let needed = w
        .checked_mul(h)
        .and_then(|wh| wh.checked_mul(d))
        .ok_or_else(|| format!("grid {w}x{h}x{d} overflows"))?;
    if cells.len() < needed {
        return Err(format!(
            "kernel addresses {needed} cells but buffer holds {}",
            cells.len()
        ));
    }

    let plane = w * h;
    if plane == 0 {
        return Ok(());
    }
    let (gx, gy, gz) = (global[0].min(w), global[1].min(h), global[2].min(d));

    cells[..needed]
        .par_chunks_mut(plane)
        .take(gz)
        .for_each(|slice| {
            for y in 0..gy {
                for v in &mut slice[y * w..y * w + gx] {
                    *v = v.wrapping_add(1);
                }
            }
        });
    Ok(())
}

/// Host buffer. Clones share the same cells.
#[derive(Debug, Clone)]
pub struct HostBuffer {
    cells: Arc<Mutex<Vec<i32>>>,
}

impl HostBuffer {
    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current contents.
    pub fn to_vec(&self) -> Vec<i32> {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Host program: the native entry points declared by its source.
#[derive(Debug)]
pub struct HostProgram {
    label: String,
    entries: Vec<&'static str>,
}

impl HostProgram {
    /// Entry points resolved from the source.
    pub fn entries(&self) -> &[&'static str] {
        &self.entries
    }
}

#[derive(Debug)]
enum HostArg {
    Buffer(HostBuffer),
    Int(i32),
}

/// Host kernel with its bound arguments.
pub struct HostKernel {
    native: &'static NativeKernel,
    args: Vec<Option<HostArg>>,
}

impl std::fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostKernel")
            .field("name", &self.native.name)
            .field("args", &self.args)
            .finish()
    }
}

/// Host CPU device.
#[derive(Clone)]
pub struct HostDevice {
    info: DeviceInfo,
    pool: Option<Arc<rayon::ThreadPool>>,
    max_buffer_bytes: Option<u64>,
}

impl HostDevice {
    /// Create a host device.
    pub fn new(config: HostConfig) -> ComputeResult<Self> {
        let pool = if config.threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.threads)
                .thread_name(|i| format!("voxq-host-{i}"))
                .build()
                .map_err(|e| ComputeError::DeviceCreation(format!("host thread pool: {e}")))?;
            Some(Arc::new(pool))
        } else {
            None
        };

        let threads = pool
            .as_ref()
            .map(|p| p.current_num_threads())
            .unwrap_or_else(rayon::current_num_threads);

        // Total system RAM, in KB from sys_info
        let memory_bytes = sys_info::mem_info().ok().map(|m| m.total * 1024);

        Ok(Self {
            info: DeviceInfo {
                name: format!("host ({threads} threads)"),
                backend: Backend::Host,
                memory_bytes,
            },
            pool,
            max_buffer_bytes: config.max_buffer_bytes,
        })
    }

    /// The host exposes a single device.
    pub fn discover() -> ComputeResult<Vec<Self>> {
        Self::discover_with(HostConfig::default())
    }

    pub fn discover_with(config: HostConfig) -> ComputeResult<Vec<Self>> {
        Ok(vec![Self::new(config)?])
    }

    fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }
}

impl ComputeDevice for HostDevice {
    type Buffer = HostBuffer;
    type Program = HostProgram;
    type Kernel = HostKernel;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer(&self, cells: usize) -> ComputeResult<Self::Buffer> {
        let bytes = (cells as u64).saturating_mul(4);
        if let Some(limit) = self.max_buffer_bytes {
            if bytes > limit {
                return Err(ComputeError::resource(
                    ResourceStage::Buffer,
                    &self.info.name,
                    format!("{bytes} bytes exceeds the {limit} byte buffer limit"),
                ));
            }
        }

        let mut data = Vec::new();
        data.try_reserve_exact(cells).map_err(|e| {
            ComputeError::resource(ResourceStage::Buffer, &self.info.name, format!("{bytes} bytes: {e}"))
        })?;
        data.resize(cells, 0);

        debug!(device = %self.info.name, cells, "host buffer allocated");
        Ok(HostBuffer { cells: Arc::new(Mutex::new(data)) })
    }

    fn build_program(&self, source: &KernelSource) -> ComputeResult<Self::Program> {
        let log = check_syntax(source);
        if !log.is_empty() {
            let log = log.join("\n");
            error!(device = %self.info.name, source = source.label(), "program build failed:\n{log}");
            return Err(ComputeError::build_failed(
                &self.info.name,
                format!("failed to build {}", source.label()),
                log,
            ));
        }

        let entries = NATIVE_KERNELS
            .iter()
            .filter(|k| source.declares(k.name))
            .map(|k| k.name)
            .collect();

        Ok(HostProgram { label: source.label().to_string(), entries })
    }

    fn create_kernel(&self, program: &Self::Program, entry_point: &str) -> ComputeResult<Self::Kernel> {
        let native = program
            .entries
            .iter()
            .find(|name| **name == entry_point)
            .and_then(|name| NATIVE_KERNELS.iter().find(|k| k.name == *name))
            .ok_or_else(|| {
                ComputeError::resource(
                    ResourceStage::Kernel,
                    &self.info.name,
                    format!("entry point '{entry_point}' not found in {}", program.label),
                )
            })?;

        Ok(HostKernel {
            native,
            args: (0..native.signature.len()).map(|_| None).collect(),
        })
    }

    fn set_arg(&self, kernel: &mut Self::Kernel, index: u32, arg: KernelArg<'_, Self::Buffer>) -> ComputeResult<()> {
        let signature = kernel.native.signature;
        let expected = signature.get(index as usize).ok_or_else(|| ComputeError::ArgumentBinding {
            index,
            message: format!("'{}' takes {} arguments", kernel.native.name, signature.len()),
        })?;

        let value = match (expected, arg) {
            (ArgKind::Buffer, KernelArg::Buffer(buf)) => HostArg::Buffer(buf.clone()),
            (ArgKind::Int, KernelArg::Int(v)) => HostArg::Int(v),
            (expected, arg) => {
                return Err(ComputeError::ArgumentBinding {
                    index,
                    message: format!("expected {}, got {}", expected.name(), arg.kind()),
                });
            }
        };
        kernel.args[index as usize] = Some(value);
        Ok(())
    }

    fn enqueue(&self, kernel: &Self::Kernel, global: [usize; 3]) -> ComputeResult<()> {
        let mut buffer = None;
        let mut ints = Vec::with_capacity(kernel.args.len());
        for (i, arg) in kernel.args.iter().enumerate() {
            match arg {
                Some(HostArg::Buffer(b)) if buffer.is_none() => buffer = Some(b),
                Some(HostArg::Buffer(_)) => {
                    return Err(ComputeError::Dispatch("host kernels take a single buffer".into()));
                }
                Some(HostArg::Int(v)) => ints.push(*v),
                None => return Err(ComputeError::Dispatch(format!("kernel argument {i} not set"))),
            }
        }
        let buffer = buffer.ok_or_else(|| ComputeError::Dispatch("no buffer bound".into()))?;

        let mut guard = buffer.cells.lock().unwrap_or_else(PoisonError::into_inner);
        let cells: &mut [i32] = &mut guard;
        let func = kernel.native.func;
        self.install(|| func(cells, &ints, global))
            .map_err(|e| ComputeError::Dispatch(format!("{}: {e}", kernel.native.name)))
    }

    fn finish(&self) -> ComputeResult<()> {
        Ok(())
    }
}

/// Minimal delimiter check standing in for a compiler front end.
///
/// Returns diagnostics in `label:line:col: error: ...` form.
fn check_syntax(source: &KernelSource) -> Vec<String> {
    let label = source.label();
    let mut log = Vec::new();

    if source.text().trim().is_empty() {
        log.push(format!("{label}:1:1: error: empty program source"));
        return log;
    }

    let mut open: Vec<(char, usize, usize)> = Vec::new();
    for (line_no, line) in source.text().lines().enumerate() {
        let code = line.split("//").next().unwrap_or("");
        for (col, ch) in code.chars().enumerate() {
            let (line_no, col) = (line_no + 1, col + 1);
            match ch {
                '(' | '{' | '[' => open.push((ch, line_no, col)),
                ')' | '}' | ']' => {
                    let want = match ch {
                        ')' => '(',
                        '}' => '{',
                        _ => '[',
                    };
                    match open.pop() {
                        Some((got, ..)) if got == want => {}
                        _ => log.push(format!("{label}:{line_no}:{col}: error: unmatched '{ch}'")),
                    }
                }
                _ => {}
            }
        }
    }
    for (ch, line_no, col) in open {
        log.push(format!("{label}:{line_no}:{col}: error: unclosed '{ch}'"));
    }
    log
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Extent;

    fn device() -> HostDevice {
        HostDevice::new(HostConfig::default().with_threads(2)).unwrap()
    }

    fn bound_kernel(dev: &HostDevice, extent: Extent) -> (HostBuffer, HostKernel) {
        let buf = dev.create_buffer(extent.cells_usize().unwrap()).unwrap();
        let program = dev.build_program(&KernelSource::builtin(Backend::Host)).unwrap();
        let mut kernel = dev.create_kernel(&program, ENTRY_POINT).unwrap();
        dev.set_arg(&mut kernel, 0, KernelArg::Buffer(&buf)).unwrap();
        for (i, v) in extent.as_kernel_args().into_iter().enumerate() {
            dev.set_arg(&mut kernel, i as u32 + 1, KernelArg::Int(v)).unwrap();
        }
        (buf, kernel)
    }

    #[test]
    fn test_buffer_zeroed() {
        let buf = device().create_buffer(27).unwrap();
        assert_eq!(buf.len(), 27);
        assert!(buf.to_vec().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_buffer_limit() {
        let dev = HostDevice::new(HostConfig::default().with_max_buffer_bytes(64)).unwrap();
        assert!(dev.create_buffer(16).is_ok());
        let err = dev.create_buffer(17).unwrap_err();
        assert!(matches!(err, ComputeError::ResourceCreation { stage: ResourceStage::Buffer, .. }));
    }

    #[test]
    fn test_increment() {
        let dev = device();
        let extent = Extent::new(3, 4, 5).unwrap();
        let (buf, kernel) = bound_kernel(&dev, extent);

        dev.enqueue(&kernel, extent.global_size()).unwrap();
        dev.enqueue(&kernel, extent.global_size()).unwrap();
        dev.finish().unwrap();

        assert!(buf.to_vec().iter().all(|&v| v == 2));
    }

    #[test]
    fn test_partial_range_touches_subgrid() {
        let dev = device();
        let extent = Extent::new(4, 4, 4).unwrap();
        let (buf, kernel) = bound_kernel(&dev, extent);

        dev.enqueue(&kernel, [2, 2, 2]).unwrap();

        let cells = buf.to_vec();
        assert_eq!(cells.iter().filter(|&&v| v == 1).count(), 8);
        assert_eq!(cells[0], 1);
        assert_eq!(cells[63], 0);
    }

    #[test]
    fn test_build_log_reports_position() {
        let src = KernelSource::from_text("bad.cl", "void increment_voxels(int* v {\n}\n");
        let err = device().build_program(&src).unwrap_err();
        let log = err.build_log().unwrap();
        assert!(log.contains("bad.cl:"), "{log}");
        assert!(log.contains("error"), "{log}");
    }

    #[test]
    fn test_empty_source() {
        let src = KernelSource::from_text("empty.cl", "   \n");
        let err = device().build_program(&src).unwrap_err();
        assert!(err.build_log().unwrap().contains("empty program source"));
    }

    #[test]
    fn test_missing_entry_point() {
        let dev = device();
        let src = KernelSource::from_text("other.cl", "void other(int* v) {}");
        let program = dev.build_program(&src).unwrap();
        let err = dev.create_kernel(&program, ENTRY_POINT).unwrap_err();
        assert!(matches!(err, ComputeError::ResourceCreation { stage: ResourceStage::Kernel, .. }));
    }

    #[test]
    fn test_argument_errors() {
        let dev = device();
        let buf = dev.create_buffer(1).unwrap();
        let program = dev.build_program(&KernelSource::builtin(Backend::Host)).unwrap();
        let mut kernel = dev.create_kernel(&program, ENTRY_POINT).unwrap();

        let err = dev.set_arg(&mut kernel, 0, KernelArg::Int(1)).unwrap_err();
        assert!(matches!(err, ComputeError::ArgumentBinding { index: 0, .. }));

        let err = dev.set_arg(&mut kernel, 2, KernelArg::Buffer(&buf)).unwrap_err();
        assert!(matches!(err, ComputeError::ArgumentBinding { index: 2, .. }));

        let err = dev.set_arg(&mut kernel, 4, KernelArg::Int(1)).unwrap_err();
        assert!(matches!(err, ComputeError::ArgumentBinding { index: 4, .. }));
    }

    #[test]
    fn test_unbound_dispatch_fails() {
        let dev = device();
        let program = dev.build_program(&KernelSource::builtin(Backend::Host)).unwrap();
        let kernel = dev.create_kernel(&program, ENTRY_POINT).unwrap();
        assert!(matches!(dev.enqueue(&kernel, [1, 1, 1]), Err(ComputeError::Dispatch(_))));
    }
}
