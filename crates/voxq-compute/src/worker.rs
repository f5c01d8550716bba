//! Per-device job queue and run loop.
//!
//! A [`DeviceWorker`] owns one device and at most one [`ComputeResource`].
//! Jobs are pushed through a [`WorkerHandle`] and processed strictly in
//! submission order by [`DeviceWorker::run`], normally on a dedicated
//! thread started with [`DeviceWorker::spawn`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::backend::ComputeDevice;
use crate::extent::Extent;
use crate::kernels::KernelSource;
use crate::resource::ComputeResource;
use crate::{ComputeError, ComputeResult};

/// Worker configuration.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Worker and thread name. Defaults to the device name.
    pub name: Option<String>,
    /// Kernel source. Defaults to the built-in source for the device backend.
    pub kernel: Option<KernelSource>,
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_kernel(mut self, kernel: KernelSource) -> Self {
        self.kernel = Some(kernel);
        self
    }
}

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Constructed, `run` not entered yet.
    Created,
    /// Run loop active.
    Running,
    /// Run loop exited after `terminate`.
    Terminated,
    /// Run loop exited on an error.
    Failed,
}

impl WorkerState {
    /// True once the run loop has exited.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Event emitted by a running worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Run loop entered.
    Started { worker: String },

    /// Resource built for the first job.
    ResourceCreated { worker: String, extent: Extent },

    /// One job processed.
    JobCompleted {
        worker: String,
        /// Submission sequence number, starting at 0.
        seq: u64,
        /// Extent the job asked for.
        requested: Extent,
        /// Extent actually dispatched.
        dispatched: Extent,
        elapsed: Duration,
    },

    /// Fatal error; the worker stops.
    Failed { worker: String, error: String },

    /// Run loop exited.
    Stopped { worker: String, abandoned: usize },
}

impl WorkerEvent {
    /// Name of the emitting worker.
    pub fn worker(&self) -> &str {
        match self {
            Self::Started { worker }
            | Self::ResourceCreated { worker, .. }
            | Self::JobCompleted { worker, .. }
            | Self::Failed { worker, .. }
            | Self::Stopped { worker, .. } => worker,
        }
    }
}

/// Summary of a finished run loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub worker: String,
    /// Jobs processed by this run.
    pub processed: u64,
    /// Jobs still queued when the loop exited.
    pub abandoned: usize,
    /// Extent of the resource, if one was built.
    pub extent: Option<Extent>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} processed, {} abandoned", self.worker, self.processed, self.abandoned)?;
        if let Some(extent) = self.extent {
            write!(f, ", extent {extent}")?;
        }
        Ok(())
    }
}

struct QueueState {
    jobs: VecDeque<(u64, Extent)>,
    running: bool,
    state: WorkerState,
    next_seq: u64,
    completed: u64,
}

impl QueueState {
    /// Idle waiters keep blocking while this holds.
    fn busy(&self) -> bool {
        !self.jobs.is_empty() && self.running && !self.state.is_terminal()
    }
}

struct Shared {
    name: String,
    queue: Mutex<QueueState>,
    /// Signalled on submit and terminate.
    available: Condvar,
    /// Signalled when the queue empties or the worker stops.
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop the run loop and release every waiter. An existing terminal
    /// state is kept. Returns the queued job count.
    fn stop(&self, state: WorkerState) -> usize {
        let abandoned = {
            let mut q = self.lock();
            q.running = false;
            if !q.state.is_terminal() {
                q.state = state;
            }
            q.jobs.len()
        };
        self.available.notify_all();
        self.idle.notify_all();
        abandoned
    }
}

/// Cloneable, thread-safe view of a worker's queue.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Append a job to the queue tail. Returns its sequence number.
    ///
    /// Jobs submitted after termination stay queued and are never processed.
    pub fn submit(&self, extent: Extent) -> u64 {
        let seq = {
            let mut q = self.shared.lock();
            let seq = q.next_seq;
            q.next_seq += 1;
            q.jobs.push_back((seq, extent));
            seq
        };
        trace!(worker = %self.shared.name, seq, extent = %extent, "job queued");
        self.shared.available.notify_one();
        seq
    }

    /// Ask the run loop to exit before its next job. Idempotent.
    ///
    /// A job already executing finishes; queued jobs are abandoned.
    pub fn terminate(&self) {
        let was_running = {
            let mut q = self.shared.lock();
            std::mem::replace(&mut q.running, false)
        };
        if was_running {
            debug!(worker = %self.shared.name, "terminate requested");
        }
        self.shared.available.notify_all();
        self.shared.idle.notify_all();
    }

    /// Block until the queue is empty or the worker has stopped.
    ///
    /// Returns the number of jobs still queued, `0` once drained. May return
    /// while the last popped job is still executing.
    pub fn wait_until_idle(&self) -> usize {
        let q = self
            .shared
            .idle
            .wait_while(self.shared.lock(), |q| q.busy())
            .unwrap_or_else(PoisonError::into_inner);
        q.jobs.len()
    }

    /// [`wait_until_idle`](Self::wait_until_idle) with a deadline. `None` on
    /// timeout.
    pub fn wait_until_idle_timeout(&self, timeout: Duration) -> Option<usize> {
        let (q, result) = self
            .shared
            .idle
            .wait_timeout_while(self.shared.lock(), timeout, |q| q.busy())
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() && q.busy() {
            None
        } else {
            Some(q.jobs.len())
        }
    }

    /// Remove every queued job, oldest first.
    pub fn drain_pending(&self) -> Vec<Extent> {
        let drained: Vec<Extent> = {
            let mut q = self.shared.lock();
            q.jobs.drain(..).map(|(_, extent)| extent).collect()
        };
        if !drained.is_empty() {
            debug!(worker = %self.shared.name, count = drained.len(), "drained pending jobs");
            self.shared.idle.notify_all();
        }
        drained
    }

    /// Queued job count.
    pub fn pending(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    pub fn state(&self) -> WorkerState {
        self.shared.lock().state
    }

    /// Jobs processed so far.
    pub fn completed(&self) -> u64 {
        self.shared.lock().completed
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = self.shared.lock();
        f.debug_struct("WorkerHandle")
            .field("name", &self.shared.name)
            .field("state", &q.state)
            .field("pending", &q.jobs.len())
            .field("completed", &q.completed)
            .finish()
    }
}

/// Serializes voxel jobs onto a single device.
pub struct DeviceWorker<D: ComputeDevice> {
    device: D,
    kernel: KernelSource,
    resource: Option<ComputeResource<D>>,
    shared: Arc<Shared>,
    events: Option<Sender<WorkerEvent>>,
}

impl<D: ComputeDevice> DeviceWorker<D> {
    pub fn new(device: D, config: WorkerConfig) -> Self {
        let name = config.name.unwrap_or_else(|| device.name().to_string());
        let kernel = config
            .kernel
            .unwrap_or_else(|| KernelSource::builtin(device.info().backend));

        Self {
            device,
            kernel,
            resource: None,
            shared: Arc::new(Shared {
                name,
                queue: Mutex::new(QueueState {
                    jobs: VecDeque::new(),
                    running: true,
                    state: WorkerState::Created,
                    next_seq: 0,
                    completed: 0,
                }),
                available: Condvar::new(),
                idle: Condvar::new(),
            }),
            events: None,
        }
    }

    /// Report lifecycle events on `tx`. Send failures are ignored.
    pub fn with_events(mut self, tx: Sender<WorkerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle { shared: Arc::clone(&self.shared) }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Resource built by the first job, if any.
    pub fn resource(&self) -> Option<&ComputeResource<D>> {
        self.resource.as_ref()
    }

    /// Process jobs until terminated or until an error.
    ///
    /// The first job builds the resource and fixes its extent; later jobs
    /// with a different extent are dispatched over the fixed extent. Any
    /// error is fatal: it is logged, the worker enters
    /// [`WorkerState::Failed`] and the queue is left untouched. Calling `run`
    /// again on a stopped worker returns an empty report and leaves its
    /// state as it was.
    pub fn run(&mut self) -> ComputeResult<RunReport> {
        {
            let mut q = self.shared.lock();
            if q.state.is_terminal() {
                debug!(worker = %self.shared.name, state = %q.state, "run called on a stopped worker");
                return Ok(RunReport {
                    worker: self.shared.name.clone(),
                    processed: 0,
                    abandoned: q.jobs.len(),
                    extent: self.resource.as_ref().map(|r| r.extent()),
                });
            }
            if !q.running {
                drop(q);
                return Ok(self.stopped(0));
            }
            q.state = WorkerState::Running;
        }
        info!(worker = %self.shared.name, device = %self.device.name(), "worker started");
        self.emit(WorkerEvent::Started { worker: self.shared.name.clone() });

        let mut processed = 0u64;
        while let Some((seq, requested)) = self.next_job() {
            if let Err(e) = self.process_job(seq, requested) {
                error!(worker = %self.shared.name, seq, error = %e, "worker failed");
                if let Some(log) = e.build_log() {
                    error!(worker = %self.shared.name, "build log:\n{log}");
                }
                self.emit(WorkerEvent::Failed {
                    worker: self.shared.name.clone(),
                    error: e.to_string(),
                });
                let abandoned = self.shared.stop(WorkerState::Failed);
                self.emit(WorkerEvent::Stopped { worker: self.shared.name.clone(), abandoned });
                return Err(e);
            }
            processed += 1;
        }

        Ok(self.stopped(processed))
    }

    /// Move the worker onto a named thread running [`run`](Self::run).
    pub fn spawn(mut self) -> ComputeResult<WorkerThread> {
        let handle = self.handle();
        let guard_handle = handle.clone();
        let join = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || {
                let _guard = PanicGuard { handle: guard_handle };
                self.run()
            })
            .map_err(|e| ComputeError::WorkerSpawn(format!("{}: {e}", handle.name())))?;

        Ok(WorkerThread { handle, join })
    }

    /// Pop the next job, blocking while the queue is empty. `None` once
    /// terminated.
    fn next_job(&self) -> Option<(u64, Extent)> {
        let mut q = self
            .shared
            .available
            .wait_while(self.shared.lock(), |q| q.running && q.jobs.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        if !q.running {
            return None;
        }
        let job = q.jobs.pop_front();
        if q.jobs.is_empty() {
            self.shared.idle.notify_all();
        }
        job
    }

    fn process_job(&mut self, seq: u64, requested: Extent) -> ComputeResult<()> {
        let start = Instant::now();

        let mut resource = match self.resource.take() {
            Some(resource) => resource,
            None => {
                let resource = ComputeResource::new(self.device.clone(), requested, &self.kernel)?;
                self.emit(WorkerEvent::ResourceCreated {
                    worker: self.shared.name.clone(),
                    extent: requested,
                });
                resource
            }
        };

        let dispatched = resource.extent();
        if dispatched != requested {
            warn!(
                worker = %self.shared.name,
                seq,
                requested = %requested,
                dispatched = %dispatched,
                "job extent differs from resource extent"
            );
        }

        let dispatch = resource.process();
        self.resource = Some(resource);
        dispatch?;

        self.shared.lock().completed += 1;
        let elapsed = start.elapsed();
        trace!(worker = %self.shared.name, seq, ?elapsed, "job done");
        self.emit(WorkerEvent::JobCompleted {
            worker: self.shared.name.clone(),
            seq,
            requested,
            dispatched,
            elapsed,
        });
        Ok(())
    }

    fn stopped(&self, processed: u64) -> RunReport {
        let abandoned = self.shared.stop(WorkerState::Terminated);
        info!(worker = %self.shared.name, processed, abandoned, "worker stopped");
        self.emit(WorkerEvent::Stopped { worker: self.shared.name.clone(), abandoned });
        RunReport {
            worker: self.shared.name.clone(),
            processed,
            abandoned,
            extent: self.resource.as_ref().map(|r| r.extent()),
        }
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

impl<D: ComputeDevice> fmt::Debug for DeviceWorker<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceWorker")
            .field("name", &self.shared.name)
            .field("device", &self.device.name())
            .field("kernel", &self.kernel.label())
            .field("resource", &self.resource)
            .finish()
    }
}

/// Marks the worker failed if its thread unwinds, so idle waiters wake.
struct PanicGuard {
    handle: WorkerHandle,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.handle.shared.stop(WorkerState::Failed);
        }
    }
}

/// A worker running on its own thread.
#[derive(Debug)]
pub struct WorkerThread {
    handle: WorkerHandle,
    join: JoinHandle<ComputeResult<RunReport>>,
}

impl WorkerThread {
    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run loop to exit.
    pub fn join(self) -> ComputeResult<RunReport> {
        let name = self.handle.name().to_string();
        self.join.join().map_err(|payload| {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            ComputeError::WorkerPanicked(format!("{name}: {msg}"))
        })?
    }

    /// Terminate, then join.
    pub fn shutdown(self) -> ComputeResult<RunReport> {
        self.handle.terminate();
        self.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostConfig, HostDevice};
    use std::sync::mpsc;

    fn host() -> HostDevice {
        HostDevice::new(HostConfig::default().with_threads(2)).unwrap()
    }

    fn cube(n: u32) -> Extent {
        Extent::cube(n).unwrap()
    }

    #[test]
    fn test_terminate_before_run() {
        let mut worker = DeviceWorker::new(host(), WorkerConfig::default().with_name("early"));
        let handle = worker.handle();
        handle.submit(cube(2));
        handle.submit(cube(2));
        handle.terminate();
        handle.terminate();

        let report = worker.run().unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.abandoned, 2);
        assert_eq!(report.extent, None);
        assert_eq!(handle.state(), WorkerState::Terminated);
        assert!(worker.resource().is_none());
    }

    #[test]
    fn test_spawned_worker_processes_jobs() {
        let (tx, rx) = mpsc::channel();
        let worker = DeviceWorker::new(host(), WorkerConfig::default().with_name("w0"))
            .with_events(tx)
            .spawn()
            .unwrap();

        for _ in 0..5 {
            worker.handle().submit(cube(4));
        }
        let mut seen = Vec::new();
        while seen.len() < 5 {
            if let WorkerEvent::JobCompleted { seq, .. } = rx.recv().unwrap() {
                seen.push(seq);
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(worker.handle().wait_until_idle(), 0);

        let report = worker.shutdown().unwrap();
        assert_eq!(report.worker, "w0");
        assert_eq!(report.processed, 5);
        assert_eq!(report.abandoned, 0);
        assert_eq!(report.extent, Some(cube(4)));
    }

    #[test]
    fn test_submit_after_terminate_stays_queued() {
        let worker = DeviceWorker::new(host(), WorkerConfig::default()).spawn().unwrap();
        let handle = worker.handle().clone();
        let report = worker.shutdown().unwrap();
        assert_eq!(report.processed, 0);

        handle.submit(cube(2));
        assert_eq!(handle.pending(), 1);
        assert_eq!(handle.wait_until_idle(), 1);
        assert_eq!(handle.drain_pending(), vec![cube(2)]);
        assert_eq!(handle.pending(), 0);
    }

    #[test]
    fn test_idle_timeout_on_unstarted_worker() {
        let worker = DeviceWorker::new(host(), WorkerConfig::default());
        let handle = worker.handle();
        assert_eq!(handle.wait_until_idle_timeout(Duration::from_millis(1)), Some(0));

        handle.submit(cube(2));
        assert_eq!(handle.wait_until_idle_timeout(Duration::from_millis(20)), None);
        assert_eq!(handle.state(), WorkerState::Created);
    }

    #[test]
    fn test_default_name_is_device_name() {
        let device = host();
        let expected = device.name().to_string();
        let worker = DeviceWorker::new(device, WorkerConfig::default());
        assert_eq!(worker.name(), expected);
        assert_eq!(worker.handle().name(), expected);
    }

    #[test]
    fn test_event_worker_name() {
        let ev = WorkerEvent::Stopped { worker: "gpu0".into(), abandoned: 3 };
        assert_eq!(ev.worker(), "gpu0");
        assert!(WorkerState::Failed.is_terminal());
        assert!(!WorkerState::Running.is_terminal());
    }
}
