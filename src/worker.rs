//! Worker threads and the orchestrator that feeds them queue pairs.
//!
//! Each worker owns a dedicated OS thread that busy-polls its assigned
//! queue pairs round robin. Assignments arrive over a channel the
//! orchestrator writes once per pair; after that the pair stays with its
//! worker for life, so the hot loop touches no shared scheduling state.
//!
//! Per iteration a worker services at most `work_queue_depth` pairs, and
//! drains each pair only up to the depth it had when the pass started —
//! a queue being refilled as fast as it is drained cannot starve the
//! worker's other pairs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, trace, warn};

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::manager::IpcManager;
use crate::module::{Namespace, ProcessOutcome};
use crate::queue_pair::QueuePair;
use crate::request::{Credentials, CODE_DISPATCH_FAILED};
use crate::spin::SpinWait;

/// A queue pair handed to a worker, with the identity of its submitter.
struct Assignment {
    qp: Arc<QueuePair>,
    creds: Credentials,
}

struct Worker {
    id: u32,
    work_queue_depth: u32,
    rx: Receiver<Assignment>,
    pairs: VecDeque<Assignment>,
    ipc: Arc<IpcManager>,
    namespace: Arc<Namespace>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    fn run(mut self) {
        debug!(worker = self.id, "worker started");
        let mut idle = SpinWait::new();
        while !self.shutdown.load(Ordering::Acquire) {
            loop {
                match self.rx.try_recv() {
                    Ok(a) => {
                        debug!(worker = self.id, qid = ?a.qp.qid(), "queue pair assigned");
                        self.pairs.push_back(a);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            let mut processed = 0u32;
            let pass = (self.pairs.len() as u32).min(self.work_queue_depth);
            for _ in 0..pass {
                let a = match self.pairs.pop_front() {
                    Some(a) => a,
                    None => break,
                };
                // Bound the drain by the depth observed up front.
                let burst = a.qp.depth();
                for _ in 0..burst {
                    match a.qp.dequeue() {
                        Ok(req) => {
                            self.dispatch(&a, req);
                            processed += 1;
                        }
                        Err(Error::Empty) => break,
                        Err(e) => {
                            warn!(worker = self.id, error = %e, "dequeue failed");
                            break;
                        }
                    }
                }
                self.pairs.push_back(a);
            }

            if processed == 0 {
                let _ = idle.spin();
            } else {
                idle = SpinWait::new();
            }
        }
        debug!(worker = self.id, "worker stopped");
    }

    fn dispatch(&self, a: &Assignment, req: *mut crate::request::Request) {
        let r = unsafe { &mut *req };
        trace!(
            worker = self.id,
            ns_id = r.ns_id,
            op = r.op,
            req_id = r.req_id,
            pid = a.creds.pid,
            "dispatch"
        );
        let module = match self.namespace.get(r.ns_id) {
            Ok(m) => m,
            Err(e) => {
                warn!(worker = self.id, ns_id = r.ns_id, error = %e, "unroutable request");
                self.fail(a, req);
                return;
            }
        };
        match module.process_request(&self.ipc, &a.qp, r, &a.creds) {
            Ok(ProcessOutcome::Done) => self.reclaim(a, req),
            Ok(ProcessOutcome::Pending) => {
                if let Err(e) = a.qp.requeue(req) {
                    warn!(worker = self.id, error = %e, "requeue failed");
                    self.fail(a, req);
                }
            }
            Err(e) => {
                warn!(worker = self.id, module = module.name(), error = %e, "module failed");
                self.fail(a, req);
            }
        }
    }

    /// Publishes a dispatch-failure completion so the submitter is not
    /// left waiting out its deadline, then reclaims the submission. When
    /// no completion slot is available the request is dropped and the
    /// submitter does time out.
    fn fail(&self, a: &Assignment, req: *mut crate::request::Request) {
        match self.ipc.alloc_request(&a.qp, self.id as usize) {
            Ok(comp_ptr) => {
                let (ns_id, op) = unsafe { ((*req).ns_id, (*req).op) };
                let comp = unsafe { &mut *comp_ptr };
                comp.start(ns_id, op);
                comp.code = CODE_DISPATCH_FAILED;
                if let Err(e) = a.qp.complete(req, comp_ptr) {
                    warn!(worker = self.id, error = %e, "failure completion not published");
                    self.reclaim(a, comp_ptr);
                }
            }
            Err(e) => {
                warn!(worker = self.id, error = %e, "no slot for failure completion");
            }
        }
        self.reclaim(a, req);
    }

    fn reclaim(&self, a: &Assignment, req: *mut crate::request::Request) {
        if let Err(e) = unsafe { self.ipc.free_request(&a.qp, req) } {
            warn!(worker = self.id, error = %e, "request slot leak");
        }
    }
}

struct WorkerHandle {
    tx: Sender<Assignment>,
    join: Option<JoinHandle<()>>,
}

/// Spawns the configured workers and assigns queue pairs to them.
pub struct WorkOrchestrator {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
    shutdown: Arc<AtomicBool>,
}

impl WorkOrchestrator {
    pub fn spawn(
        config: &OrchestratorConfig,
        ipc: Arc<IpcManager>,
        namespace: Arc<Namespace>,
    ) -> Result<Self> {
        if config.workers.is_empty() {
            return Err(Error::Config("orchestrator has no workers".into()));
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(config.workers.len());
        for wc in &config.workers {
            let (tx, rx) = mpsc::channel();
            let worker = Worker {
                id: wc.worker_id,
                work_queue_depth: config.work_queue_depth,
                rx,
                pairs: VecDeque::new(),
                ipc: ipc.clone(),
                namespace: namespace.clone(),
                shutdown: shutdown.clone(),
            };
            let cpu_id = wc.cpu_id;
            let worker_id = wc.worker_id;
            let join = std::thread::Builder::new()
                .name(format!("shmq-worker-{}", wc.worker_id))
                .spawn(move || {
                    if let Some(core) = cpu_id {
                        if let Err(errno) = pin_to_core(core) {
                            warn!(worker = worker_id, core, errno, "failed to pin worker");
                        } else {
                            debug!(worker = worker_id, core, "worker pinned");
                        }
                    }
                    worker.run();
                })?;
            workers.push(WorkerHandle {
                tx,
                join: Some(join),
            });
        }
        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
            shutdown,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Assigns a queue pair to a worker for the pair's lifetime, returning
    /// the worker's index. An explicit id is taken modulo the worker count;
    /// `None` picks the next worker round robin.
    pub fn assign(
        &self,
        qp: Arc<QueuePair>,
        creds: Credentials,
        worker_id: Option<usize>,
    ) -> Result<usize> {
        let idx = match worker_id {
            Some(id) => id % self.workers.len(),
            None => self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len(),
        };
        self.workers[idx]
            .tx
            .send(Assignment { qp, creds })
            .map_err(|_| Error::Disconnected)?;
        Ok(idx)
    }

    /// Stops every worker and joins them. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for w in &mut self.workers {
            if let Some(join) = w.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for WorkOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pin_to_core(core_id: usize) -> std::result::Result<(), i32> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core_id, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret == 0 {
            Ok(())
        } else {
            Err(*libc::__errno_location())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryConfig, WorkerConfig};
    use crate::manager::PosixShmAuthority;

    fn test_manager() -> Arc<IpcManager> {
        Arc::new(IpcManager::new(
            MemoryConfig::default(),
            MemoryConfig {
                region_size: 1 << 20,
                queue_depth: 16,
                num_queues: 2,
                ..Default::default()
            },
            Arc::new(PosixShmAuthority::new("shmq_worker_test")),
        ))
    }

    fn test_config(n: u32) -> OrchestratorConfig {
        OrchestratorConfig {
            work_queue_depth: 8,
            workers: (0..n)
                .map(|worker_id| WorkerConfig {
                    worker_id,
                    cpu_id: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_no_workers_rejected() {
        let ipc = test_manager();
        let ns = Arc::new(Namespace::new());
        assert!(matches!(
            WorkOrchestrator::spawn(&test_config(0), ipc, ns),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let ipc = test_manager();
        let ns = Arc::new(Namespace::new());
        let mut orch = WorkOrchestrator::spawn(&test_config(2), ipc.clone(), ns).unwrap();
        assert_eq!(orch.num_workers(), 2);
        ipc.create_private_queues(&orch).unwrap();
        orch.shutdown();
    }

    #[test]
    fn test_explicit_assignment_wraps() {
        let ipc = test_manager();
        let ns = Arc::new(Namespace::new());
        let orch = WorkOrchestrator::spawn(&test_config(2), ipc.clone(), ns).unwrap();
        ipc.create_private_queues(&orch).unwrap();
        // Worker id far beyond the pool still lands on a live worker.
        let qp = ipc.private_queue_pair().unwrap();
        let idx = orch.assign(qp, Credentials::current(), Some(17)).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn test_round_robin_assignment_spreads() {
        use crate::allocator::SegmentAllocator;
        use crate::queue_pair::QueuePair;
        use crate::region::HeapRegion;
        use crate::request::{QueueFlags, QueueId};

        let ipc = test_manager();
        let ns = Arc::new(Namespace::new());
        let mut orch = WorkOrchestrator::spawn(&test_config(2), ipc, ns).unwrap();

        let region = HeapRegion::new(64 * 1024).unwrap();
        let base = region.view();
        let mut seg = SegmentAllocator::new(base);
        let mut picked = Vec::new();
        for i in 0..4u32 {
            let qid = QueueId::new(1, QueueFlags::PRIVATE | QueueFlags::STREAM, i, 4);
            let view = seg.carve(QueuePair::region_size(8)).unwrap();
            let qp = Arc::new(QueuePair::create(qid, base, view, 8).unwrap());
            picked.push(orch.assign(qp, Credentials::current(), None).unwrap());
        }
        // Unhinted assignments alternate across the pool.
        assert_eq!(picked, vec![0, 1, 0, 1]);
        orch.shutdown();
    }
}
