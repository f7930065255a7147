//! Sizing and worker configuration.
//!
//! A [`MemoryConfig`] describes one category of per-process IPC memory
//! (client, private). `plan()` derives the concrete split of the region
//! into queue storage and request storage and rejects infeasible sizings
//! up front, before any shared memory is created.

use crate::error::{Error, Result};
use crate::queue_pair::QueuePair;
use crate::region::align_up;

/// Sizing for one category of IPC memory.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Total bytes of the per-process region.
    pub region_size: usize,
    /// Usable payload bytes per request slot.
    pub request_unit: u32,
    /// Minimum bytes that must remain for request storage after the
    /// queues are carved out.
    pub min_request_region: usize,
    pub queue_depth: u32,
    pub num_queues: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            region_size: 4 << 20,
            request_unit: 256,
            min_request_region: 64 << 10,
            queue_depth: 256,
            num_queues: 4,
        }
    }
}

/// Concrete split of a region, derived from a [`MemoryConfig`].
#[derive(Debug, Clone, Copy)]
pub struct MemoryPlan {
    pub region_size: usize,
    /// Bytes for the request allocator, at the front of the region.
    pub request_region_size: usize,
    /// Bytes for queue-pair storage, at the back of the region.
    pub queue_region_size: usize,
    pub request_unit: u32,
    pub queue_depth: u32,
    pub num_queues: u32,
}

impl MemoryConfig {
    pub fn plan(&self) -> Result<MemoryPlan> {
        if self.num_queues == 0 || self.queue_depth == 0 {
            return Err(Error::Config(
                "queue count and depth must be non-zero".into(),
            ));
        }
        if self.request_unit == 0 || self.request_unit % 8 != 0 {
            return Err(Error::Config(format!(
                "request unit {} must be a non-zero multiple of 8",
                self.request_unit
            )));
        }
        let queue_region_size =
            self.num_queues as usize * align_up(QueuePair::region_size(self.queue_depth));
        if queue_region_size >= self.region_size {
            return Err(Error::Config(format!(
                "{} queues of depth {} need {} bytes, leaving no request memory in a {}-byte region",
                self.num_queues, self.queue_depth, queue_region_size, self.region_size
            )));
        }
        let request_region_size = self.region_size - queue_region_size;
        if request_region_size < self.min_request_region {
            return Err(Error::Config(format!(
                "request region of {} bytes is under the configured minimum {}",
                request_region_size, self.min_request_region
            )));
        }
        Ok(MemoryPlan {
            region_size: self.region_size,
            request_region_size,
            queue_region_size,
            request_unit: self.request_unit,
            queue_depth: self.queue_depth,
            num_queues: self.num_queues,
        })
    }
}

/// One worker thread of the orchestrator.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: u32,
    /// Core to pin the thread to; `None` leaves scheduling to the OS.
    pub cpu_id: Option<usize>,
}

/// Work orchestrator sizing.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on queue pairs a worker services per loop iteration.
    pub work_queue_depth: u32,
    pub workers: Vec<WorkerConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            work_queue_depth: 64,
            workers: vec![
                WorkerConfig {
                    worker_id: 0,
                    cpu_id: None,
                },
                WorkerConfig {
                    worker_id: 1,
                    cpu_id: None,
                },
            ],
        }
    }
}
