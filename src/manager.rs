//! IPC orchestration: region provisioning, client registration and the
//! request helpers modules use.
//!
//! The server side owns an [`IpcManager`] (an explicit context object —
//! everything it needs is passed in, nothing is global). It keeps one
//! [`PerProcessIpc`] per peer: the mapped region, the request allocator
//! inside it, and the queue pairs carved from its queue segment.
//!
//! Region creation goes through a [`ShmemAuthority`]. The in-tree
//! [`PosixShmAuthority`] provisions plain `/dev/shm` objects; a privileged
//! broker could implement the same trait instead.
//!
//! Registration protocol over a Unix stream, fixed `repr(C)` frames:
//!
//! 1. server creates + grants the region, sends [`ConnectionParams`]
//! 2. client maps the region, initializes the request allocator, builds
//!    its queue pairs in the queue segment, sends [`RegisterQueues`] and
//!    one [`QueuePairPtr`] per pair
//! 3. server attaches the allocator and every pair, hands them to the
//!    work orchestrator, replies [`RegisterReply`]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::mem::{size_of, MaybeUninit};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use slab::Slab;
use tracing::{debug, info, warn};

use crate::allocator::{SegmentAllocator, ShardAllocator};
use crate::config::{MemoryConfig, MemoryPlan};
use crate::error::{Error, Result};
use crate::queue_pair::{QueuePair, QueuePairPtr};
use crate::region::{HeapRegion, RegionView, SharedRegion};
use crate::request::{Credentials, QueueFlags, QueueId, Request, RequestToken};
use crate::worker::WorkOrchestrator;
use crate::Serial;

/// Reserved pid for queues that would bridge to a kernel-side processor.
pub const KERNEL_PID: u32 = 0;

// === Shared memory authority ===

/// Provisions shared regions on behalf of the server.
pub trait ShmemAuthority: Send + Sync {
    /// Creates a region of `size` bytes and returns its id.
    fn create_shmem(&self, size: usize) -> Result<u32>;
    /// Allows `pid` to map the region.
    fn grant_access(&self, pid: u32, region_id: u32) -> Result<()>;
    /// Maps the region into the calling process.
    fn map_shmem(&self, region_id: u32, size: usize) -> Result<SharedRegion>;
    /// Destroys the region once every mapping is gone.
    fn free_shmem(&self, region_id: u32) -> Result<()>;
}

/// `/dev/shm`-backed authority. Region ids index a slab of owned shm
/// objects named `/{prefix}_{id}`, so a peer that knows the prefix can
/// derive the name from the id alone.
pub struct PosixShmAuthority {
    prefix: String,
    regions: Mutex<Slab<SharedRegion>>,
}

impl PosixShmAuthority {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            regions: Mutex::new(Slab::new()),
        }
    }

    pub fn region_name(prefix: &str, region_id: u32) -> String {
        format!("/{}_{}", prefix, region_id)
    }
}

impl ShmemAuthority for PosixShmAuthority {
    fn create_shmem(&self, size: usize) -> Result<u32> {
        let mut regions = self.regions.lock();
        let entry = regions.vacant_entry();
        let id = entry.key() as u32;
        let region = SharedRegion::create(&Self::region_name(&self.prefix, id), size)?;
        entry.insert(region);
        Ok(id)
    }

    fn grant_access(&self, pid: u32, region_id: u32) -> Result<()> {
        // Objects are created 0600 under the server's uid; same-user peers
        // can already open them. A privileged broker would adjust ACLs here.
        debug!(pid, region_id, "granted region access");
        Ok(())
    }

    fn map_shmem(&self, region_id: u32, size: usize) -> Result<SharedRegion> {
        Ok(SharedRegion::open(
            &Self::region_name(&self.prefix, region_id),
            size,
        )?)
    }

    fn free_shmem(&self, region_id: u32) -> Result<()> {
        let mut regions = self.regions.lock();
        if regions.contains(region_id as usize) {
            regions.remove(region_id as usize);
            Ok(())
        } else {
            Err(Error::Registration(format!(
                "unknown region id {}",
                region_id
            )))
        }
    }
}

// === Wire protocol frames ===

/// First frame, server to client: everything the client needs to map the
/// region and rebuild the layout the server expects.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ConnectionParams {
    pub region_id: u32,
    pub request_unit: u32,
    pub region_size: u64,
    pub request_region_size: u64,
    pub queue_region_size: u64,
    pub queue_depth: u32,
    pub num_queues: u32,
}

unsafe impl Serial for ConnectionParams {}

/// Client to server: number of [`QueuePairPtr`] frames that follow.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RegisterQueues {
    pub count: u32,
}

unsafe impl Serial for RegisterQueues {}

/// Final frame, server to client. Zero status means every pair was
/// attached and scheduled.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RegisterReply {
    pub status: i32,
}

unsafe impl Serial for RegisterReply {}

fn send_frame<T: Serial>(stream: &mut UnixStream, value: &T) -> Result<()> {
    let bytes =
        unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) };
    stream.write_all(bytes)?;
    Ok(())
}

fn recv_frame<T: Serial>(stream: &mut UnixStream) -> Result<T> {
    let mut value = MaybeUninit::<T>::uninit();
    let bytes = unsafe {
        std::slice::from_raw_parts_mut(value.as_mut_ptr() as *mut u8, size_of::<T>())
    };
    stream.read_exact(bytes).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Disconnected
        } else {
            Error::Io(e)
        }
    })?;
    Ok(unsafe { value.assume_init() })
}

// === Per-process state ===

enum RegionHold {
    Shared(SharedRegion),
    Heap(HeapRegion),
}

impl RegionHold {
    fn view(&self) -> RegionView {
        match self {
            RegionHold::Shared(r) => r.view(),
            RegionHold::Heap(r) => r.view(),
        }
    }
}

struct PerProcessIpc {
    creds: Credentials,
    region_id: Option<u32>,
    region: RegionHold,
    alloc: ShardAllocator,
    qps: Vec<Arc<QueuePair>>,
}

// === IPC manager ===

/// Server-side IPC state: per-process regions, allocators and queue pairs.
pub struct IpcManager {
    my_pid: u32,
    client_conf: MemoryConfig,
    private_conf: MemoryConfig,
    authority: Arc<dyn ShmemAuthority>,
    procs: RwLock<HashMap<u32, Arc<PerProcessIpc>>>,
    qps: RwLock<HashMap<QueueId, Arc<QueuePair>>>,
    next_private: AtomicUsize,
}

impl IpcManager {
    pub fn new(
        client_conf: MemoryConfig,
        private_conf: MemoryConfig,
        authority: Arc<dyn ShmemAuthority>,
    ) -> Self {
        Self {
            my_pid: std::process::id(),
            client_conf,
            private_conf,
            authority,
            procs: RwLock::new(HashMap::new()),
            qps: RwLock::new(HashMap::new()),
            next_private: AtomicUsize::new(0),
        }
    }

    pub fn my_pid(&self) -> u32 {
        self.my_pid
    }

    /// Builds the server's own heap-backed queues for module-to-module
    /// traffic and schedules them on the orchestrator.
    pub fn create_private_queues(&self, orchestrator: &WorkOrchestrator) -> Result<()> {
        let plan = self.private_conf.plan()?;
        let region = HeapRegion::new(plan.region_size)?;
        let base = region.view();
        let creds = Credentials::current();

        let flags = QueueFlags::PRIVATE
            | QueueFlags::STREAM
            | QueueFlags::INTERMEDIATE
            | QueueFlags::ORDERED
            | QueueFlags::LOW_LATENCY;
        let (alloc, qps) = build_process_queues(base, &plan, self.my_pid, flags)?;
        let qps: Vec<Arc<QueuePair>> = qps.into_iter().map(Arc::new).collect();

        for (i, qp) in qps.iter().enumerate() {
            self.register_queue_pair(qp.clone())?;
            orchestrator.assign(qp.clone(), creds, Some(i))?;
        }
        info!(num_queues = qps.len(), "created private queues");

        self.procs.write().insert(
            self.my_pid,
            Arc::new(PerProcessIpc {
                creds,
                region_id: None,
                region: RegionHold::Heap(region),
                alloc,
                qps,
            }),
        );
        Ok(())
    }

    /// Runs the server side of the registration protocol for one client.
    pub fn register_client(
        &self,
        stream: &mut UnixStream,
        creds: Credentials,
        orchestrator: &WorkOrchestrator,
    ) -> Result<()> {
        match self.try_register_client(stream, creds, orchestrator) {
            Ok(()) => {
                send_frame(stream, &RegisterReply { status: 0 })?;
                info!(pid = creds.pid, "client registered");
                Ok(())
            }
            Err(e) => {
                warn!(pid = creds.pid, error = %e, "client registration failed");
                let _ = send_frame(stream, &RegisterReply { status: -1 });
                Err(e)
            }
        }
    }

    fn try_register_client(
        &self,
        stream: &mut UnixStream,
        creds: Credentials,
        orchestrator: &WorkOrchestrator,
    ) -> Result<()> {
        let plan = self.client_conf.plan()?;

        // A second registration under the same pid would replace the live
        // entry while its queue pairs are still assigned to workers.
        if self.procs.read().contains_key(&creds.pid) {
            return Err(Error::Registration(format!(
                "pid {} already has ipc state",
                creds.pid
            )));
        }

        let region_id = self.authority.create_shmem(plan.region_size)?;
        let result = self.register_with_region(stream, creds, orchestrator, region_id, &plan);
        if result.is_err() {
            // Nothing holds the region after an aborted registration; give
            // it back so failed attempts do not pin /dev/shm space.
            if let Err(e) = self.authority.free_shmem(region_id) {
                warn!(region_id, error = %e, "failed to release region of aborted registration");
            }
        }
        result
    }

    fn register_with_region(
        &self,
        stream: &mut UnixStream,
        creds: Credentials,
        orchestrator: &WorkOrchestrator,
        region_id: u32,
        plan: &MemoryPlan,
    ) -> Result<()> {
        self.authority.grant_access(self.my_pid, region_id)?;
        self.authority.grant_access(creds.pid, region_id)?;
        let region = self.authority.map_shmem(region_id, plan.region_size)?;
        let base = region.view();

        send_frame(
            stream,
            &ConnectionParams {
                region_id,
                request_unit: plan.request_unit,
                region_size: plan.region_size as u64,
                request_region_size: plan.request_region_size as u64,
                queue_region_size: plan.queue_region_size as u64,
                queue_depth: plan.queue_depth,
                num_queues: plan.num_queues,
            },
        )?;

        // The client initializes the allocator and queue pairs in its own
        // mapping; nothing on this side touches the region until the
        // descriptors arrive.
        let register: RegisterQueues = recv_frame(stream)?;
        if register.count != plan.num_queues {
            return Err(Error::Registration(format!(
                "client sent {} queue pairs, expected {}",
                register.count, plan.num_queues
            )));
        }
        let mut ptrs = Vec::with_capacity(register.count as usize);
        for _ in 0..register.count {
            ptrs.push(recv_frame::<QueuePairPtr>(stream)?);
        }

        let request_view = narrow(base, 0, plan.request_region_size)?;
        let alloc = ShardAllocator::attach(base, request_view)?;

        let mut qps = Vec::with_capacity(ptrs.len());
        for (i, ptr) in ptrs.iter().enumerate() {
            let qp = Arc::new(QueuePair::attach(ptr, base)?);
            debug!(pid = creds.pid, index = i, "attached client queue pair");
            qps.push(qp);
        }
        for (i, qp) in qps.iter().enumerate() {
            if let Err(e) = self.register_queue_pair(qp.clone()) {
                let mut map = self.qps.write();
                for earlier in &qps[..i] {
                    map.remove(&earlier.qid());
                }
                return Err(e);
            }
        }

        // Workers see the pairs only after the process entry holds the
        // mapping, so an error from here on cannot unmap under them.
        self.procs.write().insert(
            creds.pid,
            Arc::new(PerProcessIpc {
                creds,
                region_id: Some(region_id),
                region: RegionHold::Shared(region),
                alloc,
                qps: qps.clone(),
            }),
        );
        for (i, qp) in qps.iter().enumerate() {
            orchestrator.assign(qp.clone(), creds, Some(i))?;
        }
        Ok(())
    }

    /// Tears down a peer's state. The region itself is reclaimed once the
    /// peer's mapping is gone.
    pub fn unregister_client(&self, pid: u32) -> Result<()> {
        let proc = self
            .procs
            .write()
            .remove(&pid)
            .ok_or_else(|| Error::Registration(format!("unknown pid {}", pid)))?;
        let mut qps = self.qps.write();
        for qp in &proc.qps {
            qps.remove(&qp.qid());
        }
        drop(qps);
        if let Some(region_id) = proc.region_id {
            self.authority.free_shmem(region_id)?;
        }
        info!(pid, uid = proc.creds.uid, "client unregistered");
        Ok(())
    }

    /// This process's view of a peer's region.
    pub fn region_view(&self, pid: u32) -> Result<RegionView> {
        self.procs
            .read()
            .get(&pid)
            .map(|p| p.region.view())
            .ok_or_else(|| Error::Registration(format!("no ipc state for pid {}", pid)))
    }

    fn register_queue_pair(&self, qp: Arc<QueuePair>) -> Result<()> {
        let qid = qp.qid();
        let mut qps = self.qps.write();
        if qps.contains_key(&qid) {
            return Err(Error::Registration(format!(
                "queue pair {:?} already registered",
                qid
            )));
        }
        qps.insert(qid, qp);
        Ok(())
    }

    pub fn queue_pair(&self, qid: &QueueId) -> Result<Arc<QueuePair>> {
        self.qps
            .read()
            .get(qid)
            .cloned()
            .ok_or(Error::QueuePairNotFound(*qid))
    }

    /// One of the server's private queues, round robin.
    pub fn private_queue_pair(&self) -> Result<Arc<QueuePair>> {
        let procs = self.procs.read();
        let proc = procs
            .get(&self.my_pid)
            .ok_or_else(|| Error::Registration("private queues not created".into()))?;
        let i = self.next_private.fetch_add(1, Ordering::Relaxed) % proc.qps.len();
        Ok(proc.qps[i].clone())
    }

    fn proc_for(&self, qp: &QueuePair) -> Result<Arc<PerProcessIpc>> {
        let pid = qp.qid().pid;
        self.procs
            .read()
            .get(&pid)
            .cloned()
            .ok_or_else(|| Error::Registration(format!("no ipc state for pid {}", pid)))
    }

    /// Allocates a request slot from the region the queue pair lives in.
    pub fn alloc_request(&self, qp: &QueuePair, core_hint: usize) -> Result<*mut Request> {
        let proc = self.proc_for(qp)?;
        let slot = proc.alloc.alloc(core_hint)?;
        Ok(slot.as_ptr() as *mut Request)
    }

    /// Returns a request slot to its region's allocator.
    ///
    /// # Safety
    /// `req` must have come from [`alloc_request`](Self::alloc_request) for
    /// a queue pair of the same peer, and must not be used afterwards.
    pub unsafe fn free_request(&self, qp: &QueuePair, req: *mut Request) -> Result<()> {
        let proc = self.proc_for(qp)?;
        proc.alloc.free(NonNull::new(req as *mut u8).ok_or(Error::InvalidState(
            "null request pointer freed",
        ))?)
    }

    /// Waits on a token through the registered queue pair.
    pub fn wait(&self, token: &RequestToken, deadline: Option<Duration>) -> Result<*mut Request> {
        let qp = self.queue_pair(&token.qid)?;
        qp.wait(token, deadline)
    }
}

/// Splits a region per `plan` and builds its allocator and queue pairs.
/// Used by whichever side owns initialization: the server for private
/// queues, the client for its shared region.
fn build_process_queues(
    base: RegionView,
    plan: &MemoryPlan,
    pid: u32,
    flags: QueueFlags,
) -> Result<(ShardAllocator, Vec<QueuePair>)> {
    if (plan.request_unit as usize) < size_of::<Request>() {
        return Err(Error::Config(format!(
            "request unit {} cannot hold a {}-byte request header",
            plan.request_unit,
            size_of::<Request>()
        )));
    }
    let request_view = narrow(base, 0, plan.request_region_size)?;
    let alloc = ShardAllocator::init(base, request_view, plan.request_unit, 0)?;

    let queue_view = narrow(base, plan.request_region_size, plan.queue_region_size)?;
    let mut seg = SegmentAllocator::new(queue_view);
    let mut qps = Vec::with_capacity(plan.num_queues as usize);
    for i in 0..plan.num_queues {
        let qid = QueueId::new(pid, flags, i, plan.num_queues);
        let view = seg.carve(QueuePair::region_size(plan.queue_depth))?;
        qps.push(QueuePair::create(qid, base, view, plan.queue_depth)?);
    }
    Ok((alloc, qps))
}

fn narrow(base: RegionView, off: usize, len: usize) -> Result<RegionView> {
    let window = base.slice_from(off)?;
    if len > window.len() {
        return Err(Error::AddressOutOfRange {
            off: (off + len) as i64,
            len: base.len(),
        });
    }
    Ok(unsafe { RegionView::new(NonNull::new_unchecked(window.base()), len) })
}

// === Client session ===

/// Client side of the registration protocol plus call helpers.
pub struct ClientSession {
    region: SharedRegion,
    alloc: ShardAllocator,
    qps: Vec<QueuePair>,
    next_qp: AtomicUsize,
    params: ConnectionParams,
}

impl ClientSession {
    /// Connects to the server's control socket and registers.
    pub fn connect(path: &Path, shm_prefix: &str) -> Result<Self> {
        let stream = UnixStream::connect(path)?;
        Self::establish(stream, shm_prefix)
    }

    /// Runs the client side of the protocol over an established stream.
    pub fn establish(mut stream: UnixStream, shm_prefix: &str) -> Result<Self> {
        let params: ConnectionParams = recv_frame(&mut stream)?;
        let region = SharedRegion::open(
            &PosixShmAuthority::region_name(shm_prefix, params.region_id),
            params.region_size as usize,
        )?;
        let base = region.view();

        let plan = MemoryPlan {
            region_size: params.region_size as usize,
            request_region_size: params.request_region_size as usize,
            queue_region_size: params.queue_region_size as usize,
            request_unit: params.request_unit,
            queue_depth: params.queue_depth,
            num_queues: params.num_queues,
        };
        let flags = QueueFlags::SHMEM
            | QueueFlags::STREAM
            | QueueFlags::PRIMARY
            | QueueFlags::ORDERED
            | QueueFlags::LOW_LATENCY;
        let (alloc, qps) = build_process_queues(base, &plan, std::process::id(), flags)?;

        send_frame(&mut stream, &RegisterQueues { count: qps.len() as u32 })?;
        for qp in &qps {
            send_frame(&mut stream, &qp.to_ptr())?;
        }

        let reply: RegisterReply = recv_frame(&mut stream)?;
        if reply.status != 0 {
            return Err(Error::Registration(format!(
                "server rejected registration with status {}",
                reply.status
            )));
        }

        Ok(Self {
            region,
            alloc,
            qps,
            next_qp: AtomicUsize::new(0),
            params,
        })
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn base(&self) -> RegionView {
        self.region.view()
    }

    /// Allocates a request slot in the shared region.
    pub fn alloc_request(&self, core_hint: usize) -> Result<*mut Request> {
        Ok(self.alloc.alloc(core_hint)?.as_ptr() as *mut Request)
    }

    /// # Safety
    /// `req` must be a live slot from [`alloc_request`](Self::alloc_request).
    pub unsafe fn free_request(&self, req: *mut Request) -> Result<()> {
        self.alloc.free(NonNull::new_unchecked(req as *mut u8))
    }

    /// Submits a request on one of the session's queues, round robin,
    /// spinning while the queue is full.
    pub fn call(&self, req: *mut Request) -> Result<RequestToken> {
        let i = self.next_qp.fetch_add(1, Ordering::Relaxed) % self.qps.len();
        self.qps[i].enqueue_spin(req, crate::spin::SpinWait::new())
    }

    /// Waits for the completion of `token` and returns the completion
    /// request. The caller frees both records.
    pub fn wait(&self, token: &RequestToken, deadline: Option<Duration>) -> Result<*mut Request> {
        let qp = self
            .qps
            .get(token.qid.index as usize)
            .ok_or(Error::QueuePairNotFound(token.qid))?;
        qp.wait(token, deadline)
    }
}
