//! One worker thread per device.

use std::sync::mpsc::Sender;

use tracing::{error, info};

use crate::backend::ComputeDevice;
use crate::extent::Extent;
use crate::worker::{DeviceWorker, RunReport, WorkerConfig, WorkerEvent, WorkerHandle, WorkerThread};
use crate::{ComputeError, ComputeResult};

/// Final result of one worker.
#[derive(Debug)]
pub struct WorkerOutcome {
    pub name: String,
    pub result: ComputeResult<RunReport>,
}

impl WorkerOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// A set of spawned workers, indexed in device order.
///
/// Workers are independent: a failing worker stops alone and the others
/// keep processing their queues.
#[derive(Debug)]
pub struct Fleet {
    workers: Vec<WorkerThread>,
}

impl Fleet {
    /// Spawn one worker per device on threads named `voxq-worker-<index>`.
    pub fn launch<D: ComputeDevice>(devices: Vec<D>, config: WorkerConfig) -> ComputeResult<Self> {
        Self::spawn_all(devices, config, None)
    }

    /// Like [`launch`](Self::launch), with every worker reporting on `events`.
    pub fn launch_with_events<D: ComputeDevice>(
        devices: Vec<D>,
        config: WorkerConfig,
        events: Sender<WorkerEvent>,
    ) -> ComputeResult<Self> {
        Self::spawn_all(devices, config, Some(events))
    }

    fn spawn_all<D: ComputeDevice>(
        devices: Vec<D>,
        config: WorkerConfig,
        events: Option<Sender<WorkerEvent>>,
    ) -> ComputeResult<Self> {
        if devices.is_empty() {
            return Err(ComputeError::NoDevice);
        }

        let mut workers = Vec::with_capacity(devices.len());
        for (index, device) in devices.into_iter().enumerate() {
            let device_name = device.name().to_string();
            let cfg = config.clone().with_name(format!("voxq-worker-{index}"));
            let mut worker = DeviceWorker::new(device, cfg);
            if let Some(tx) = &events {
                worker = worker.with_events(tx.clone());
            }

            match worker.spawn() {
                Ok(thread) => {
                    info!(worker = thread.name(), device = %device_name, "worker launched");
                    workers.push(thread);
                }
                Err(e) => {
                    error!(index, device = %device_name, error = %e, "failed to launch worker");
                    Self { workers }.shutdown();
                    return Err(e);
                }
            }
        }

        Ok(Self { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Queue a job on worker `index`. `None` if there is no such worker.
    pub fn submit_to(&self, index: usize, extent: Extent) -> Option<u64> {
        self.workers.get(index).map(|w| w.handle().submit(extent))
    }

    /// Queue one copy of the job on every worker.
    pub fn broadcast(&self, extent: Extent) {
        for worker in &self.workers {
            worker.handle().submit(extent);
        }
    }

    pub fn handles(&self) -> Vec<WorkerHandle> {
        self.workers.iter().map(|w| w.handle().clone()).collect()
    }

    /// Wait until every worker is idle or stopped. Returns the total number
    /// of jobs left in stopped workers' queues.
    pub fn drain(&self) -> usize {
        self.workers.iter().map(|w| w.handle().wait_until_idle()).sum()
    }

    /// Terminate all workers, then join them in index order.
    pub fn shutdown(self) -> Vec<WorkerOutcome> {
        for worker in &self.workers {
            worker.handle().terminate();
        }

        self.workers
            .into_iter()
            .map(|worker| {
                let name = worker.name().to_string();
                let result = worker.join();
                if let Err(e) = &result {
                    error!(worker = %name, error = %e, "worker ended with error");
                }
                WorkerOutcome { name, result }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostConfig, HostDevice};

    fn hosts(n: usize) -> Vec<HostDevice> {
        (0..n)
            .map(|_| HostDevice::new(HostConfig::default().with_threads(1)).unwrap())
            .collect()
    }

    #[test]
    fn test_empty_fleet_rejected() {
        let err = Fleet::launch(Vec::<HostDevice>::new(), WorkerConfig::default()).unwrap_err();
        assert!(matches!(err, ComputeError::NoDevice));
    }

    #[test]
    fn test_broadcast_and_shutdown() {
        let fleet = Fleet::launch(hosts(2), WorkerConfig::default()).unwrap();
        assert_eq!(fleet.len(), 2);

        let extent = Extent::cube(3).unwrap();
        for _ in 0..4 {
            fleet.broadcast(extent);
        }
        assert_eq!(fleet.submit_to(1, extent), Some(4));
        assert_eq!(fleet.submit_to(2, extent), None);
        assert_eq!(fleet.drain(), 0);

        let names: Vec<String> = fleet.handles().iter().map(|h| h.name().to_string()).collect();
        assert_eq!(names, ["voxq-worker-0", "voxq-worker-1"]);

        let outcomes = fleet.shutdown();
        assert!(outcomes.iter().all(WorkerOutcome::is_ok));
        let processed: Vec<u64> = outcomes
            .iter()
            .map(|o| o.result.as_ref().unwrap().processed)
            .collect();
        assert_eq!(processed, [4, 5]);
    }
}
