//! Recording mock device for worker tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use voxq_compute::{
    Backend, ComputeDevice, ComputeError, ComputeResult, DeviceInfo, KernelArg, KernelSource,
    ResourceStage,
};

/// Stage at which the mock fails.
#[derive(Debug, Clone)]
pub enum Fault {
    Buffer,
    Build(&'static str),
    Kernel,
    Arg(u32),
    Dispatch,
}

/// Everything the mock observed.
#[derive(Default)]
pub struct Journal {
    pub buffers: Mutex<Vec<usize>>,
    pub dispatches: Mutex<Vec<[usize; 3]>>,
    pub args: Mutex<Vec<(u32, String)>>,
    pub released: AtomicUsize,
}

impl Journal {
    pub fn dispatches(&self) -> Vec<[usize; 3]> {
        self.dispatches.lock().unwrap().clone()
    }

    pub fn buffers(&self) -> Vec<usize> {
        self.buffers.lock().unwrap().clone()
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// Blocks `enqueue` until a permit is available.
#[derive(Default)]
pub struct Gate {
    permits: Mutex<usize>,
    cond: Condvar,
    entered: AtomicUsize,
}

impl Gate {
    pub fn release(&self, n: usize) {
        *self.permits.lock().unwrap() += n;
        self.cond.notify_all();
    }

    /// Number of dispatches that reached the gate.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Spin until `n` dispatches have reached the gate.
    pub fn wait_entered(&self, n: usize) {
        while self.entered() < n {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut permits = self.cond.wait_while(self.permits.lock().unwrap(), |p| *p == 0).unwrap();
        *permits -= 1;
    }
}

/// Handle counted on drop.
pub struct Tracked(Arc<Journal>);

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockKernel {
    _tracked: Tracked,
    bound: [bool; 4],
}

#[derive(Clone)]
pub struct MockDevice {
    info: DeviceInfo,
    pub journal: Arc<Journal>,
    fault: Option<Fault>,
    gate: Option<Arc<Gate>>,
}

impl MockDevice {
    pub fn new(name: &str) -> Self {
        Self {
            info: DeviceInfo {
                name: name.to_string(),
                backend: Backend::Host,
                memory_bytes: None,
            },
            journal: Arc::new(Journal::default()),
            fault: None,
            gate: None,
        }
    }

    pub fn failing(name: &str, fault: Fault) -> Self {
        Self { fault: Some(fault), ..Self::new(name) }
    }

    pub fn gated(name: &str) -> (Self, Arc<Gate>) {
        let gate = Arc::new(Gate::default());
        (Self { gate: Some(Arc::clone(&gate)), ..Self::new(name) }, gate)
    }

    fn track(&self) -> Tracked {
        Tracked(Arc::clone(&self.journal))
    }
}

impl ComputeDevice for MockDevice {
    type Buffer = Tracked;
    type Program = Tracked;
    type Kernel = MockKernel;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer(&self, cells: usize) -> ComputeResult<Self::Buffer> {
        if let Some(Fault::Buffer) = self.fault {
            return Err(ComputeError::resource(ResourceStage::Buffer, &self.info.name, "out of memory"));
        }
        self.journal.buffers.lock().unwrap().push(cells);
        Ok(self.track())
    }

    fn build_program(&self, source: &KernelSource) -> ComputeResult<Self::Program> {
        if let Some(Fault::Build(log)) = self.fault {
            return Err(ComputeError::build_failed(&self.info.name, format!("failed to build {}", source.label()), log));
        }
        Ok(self.track())
    }

    fn create_kernel(&self, _program: &Self::Program, entry_point: &str) -> ComputeResult<Self::Kernel> {
        if let Some(Fault::Kernel) = self.fault {
            return Err(ComputeError::resource(
                ResourceStage::Kernel,
                &self.info.name,
                format!("no entry point '{entry_point}'"),
            ));
        }
        Ok(MockKernel { _tracked: self.track(), bound: [false; 4] })
    }

    fn set_arg(&self, kernel: &mut Self::Kernel, index: u32, arg: KernelArg<'_, Self::Buffer>) -> ComputeResult<()> {
        if let Some(Fault::Arg(bad)) = self.fault {
            if bad == index {
                return Err(ComputeError::Dispatch("rejected".into()));
            }
        }
        let value = match arg {
            KernelArg::Buffer(_) => "buffer".to_string(),
            KernelArg::Int(v) => v.to_string(),
        };
        self.journal.args.lock().unwrap().push((index, value));
        kernel.bound[index as usize] = true;
        Ok(())
    }

    fn enqueue(&self, kernel: &Self::Kernel, global: [usize; 3]) -> ComputeResult<()> {
        assert!(kernel.bound.iter().all(|b| *b), "dispatch with unbound arguments");
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        if let Some(Fault::Dispatch) = self.fault {
            return Err(ComputeError::Dispatch("device lost".into()));
        }
        self.journal.dispatches.lock().unwrap().push(global);
        Ok(())
    }

    fn finish(&self) -> ComputeResult<()> {
        Ok(())
    }
}
