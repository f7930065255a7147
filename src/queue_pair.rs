//! Queue pairs: a submission queue plus a completion table.
//!
//! The submitter enqueues a request and keeps the token; the processor
//! dequeues, does the work, and publishes a completion request's offset
//! under the token's `req_id`. The completion table is a fixed array of
//! `depth` entries, linearly probed from `req_id % depth`: a publisher
//! claims the first free entry in the probe window, and only a table with
//! every entry unconsumed makes the publisher wait for a consumer.

use std::mem::size_of;
use std::ptr::{addr_of, read_volatile, write_volatile};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::region::{align_up, Off, RegionView};
use crate::request::{QueueId, Request, RequestToken};
use crate::queue::RequestQueue;
use crate::spin::{spin_until, SpinWait};
use crate::Serial;

const ENTRY_EMPTY: u32 = 0;
const ENTRY_CLAIMED: u32 = 1;
const ENTRY_READY: u32 = 2;

#[repr(C)]
struct Completion {
    state: AtomicU32,
    req_id: AtomicU32,
    resp_off: AtomicI64,
}

#[repr(C)]
struct TableHeader {
    depth: u32,
    _pad: u32,
}

/// Fixed-size completion table living in a region.
pub struct CompletionTable {
    header: *mut TableHeader,
    entries: *mut Completion,
}

unsafe impl Send for CompletionTable {}
unsafe impl Sync for CompletionTable {}

impl Clone for CompletionTable {
    fn clone(&self) -> Self {
        Self {
            header: self.header,
            entries: self.entries,
        }
    }
}

impl CompletionTable {
    pub fn region_size(depth: u32) -> usize {
        align_up(size_of::<TableHeader>()) + depth as usize * size_of::<Completion>()
    }

    fn layout(view: RegionView, depth: u32) -> Result<Self> {
        if depth == 0 {
            return Err(Error::Config("completion table depth must be non-zero".into()));
        }
        if view.len() < Self::region_size(depth) {
            return Err(Error::Config(format!(
                "completion table of depth {} needs {} bytes, region has {}",
                depth,
                Self::region_size(depth),
                view.len()
            )));
        }
        Ok(Self {
            header: view.base() as *mut TableHeader,
            entries: unsafe { view.base().add(align_up(size_of::<TableHeader>())) }
                as *mut Completion,
        })
    }

    pub fn init(view: RegionView, depth: u32) -> Result<Self> {
        let table = Self::layout(view, depth)?;
        unsafe {
            write_volatile(std::ptr::addr_of_mut!((*table.header).depth), depth);
            for i in 0..depth as usize {
                let e = &*table.entries.add(i);
                e.state.store(ENTRY_EMPTY, Ordering::Relaxed);
                e.req_id.store(0, Ordering::Relaxed);
                e.resp_off.store(0, Ordering::Relaxed);
            }
        }
        Ok(table)
    }

    pub fn attach(view: RegionView) -> Result<Self> {
        if view.len() < size_of::<TableHeader>() {
            return Err(Error::Config("region too small for completion table".into()));
        }
        let depth = unsafe {
            read_volatile(addr_of!((*(view.base() as *mut TableHeader)).depth))
        };
        Self::layout(view, depth)
    }

    pub fn depth(&self) -> u32 {
        unsafe { read_volatile(addr_of!((*self.header).depth)) }
    }

    fn entry(&self, idx: u32) -> &Completion {
        unsafe { &*self.entries.add(idx as usize) }
    }

    /// Publishes a completion offset under `req_id`: claims the first free
    /// entry probing linearly from `req_id % depth`. Only a table whose
    /// every entry holds an unconsumed completion makes this wait.
    pub fn publish(&self, req_id: u32, resp_off: Off) {
        let depth = self.depth();
        let mut wait = SpinWait::new();
        loop {
            for probe in 0..depth {
                let e = self.entry((req_id.wrapping_add(probe)) % depth);
                if e.state
                    .compare_exchange(
                        ENTRY_EMPTY,
                        ENTRY_CLAIMED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    e.req_id.store(req_id, Ordering::Relaxed);
                    e.resp_off.store(resp_off, Ordering::Relaxed);
                    e.state.store(ENTRY_READY, Ordering::Release);
                    return;
                }
            }
            let _ = wait.spin();
        }
    }

    fn find(&self, req_id: u32) -> Option<&Completion> {
        let depth = self.depth();
        for probe in 0..depth {
            let e = self.entry((req_id.wrapping_add(probe)) % depth);
            if e.state.load(Ordering::Acquire) == ENTRY_READY
                && e.req_id.load(Ordering::Relaxed) == req_id
            {
                return Some(e);
            }
        }
        None
    }

    /// True if the completion for `req_id` is published and unconsumed.
    pub fn is_ready(&self, req_id: u32) -> bool {
        self.find(req_id).is_some()
    }

    /// Consumes the completion for `req_id` if published.
    pub fn take(&self, req_id: u32) -> Result<Off> {
        let e = self.find(req_id).ok_or(Error::Empty)?;
        let off = e.resp_off.load(Ordering::Relaxed);
        e.state.store(ENTRY_EMPTY, Ordering::Release);
        Ok(off)
    }
}

/// Descriptor a peer uses to attach a queue pair built in a shared region.
/// All positions are offsets against the region base.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct QueuePairPtr {
    pub qid: QueueId,
    pub sq_off: Off,
    pub ct_off: Off,
    pub depth: u32,
    _pad: u32,
}

unsafe impl Serial for QueuePairPtr {}

impl QueuePairPtr {
    pub fn new(qid: QueueId, sq_off: Off, ct_off: Off, depth: u32) -> Self {
        Self {
            qid,
            sq_off,
            ct_off,
            depth,
            _pad: 0,
        }
    }
}

/// A submission queue and its completion table, under one identity.
pub struct QueuePair {
    base: RegionView,
    sq: RequestQueue,
    ct: CompletionTable,
}

unsafe impl Send for QueuePair {}
unsafe impl Sync for QueuePair {}

impl QueuePair {
    /// Bytes needed for both halves of a pair of `depth` requests.
    pub fn region_size(depth: u32) -> usize {
        align_up(RequestQueue::region_size(depth)) + CompletionTable::region_size(depth)
    }

    /// Builds a pair in `view`, a window of the base region.
    pub fn create(qid: QueueId, base: RegionView, view: RegionView, depth: u32) -> Result<Self> {
        let sq = RequestQueue::init(base, view, depth, qid)?;
        let ct_view = view.slice_from(align_up(RequestQueue::region_size(depth)))?;
        let ct = CompletionTable::init(ct_view, depth)?;
        Ok(Self { base, sq, ct })
    }

    /// Descriptor for [`attach`](Self::attach) by a peer process.
    pub fn to_ptr(&self) -> QueuePairPtr {
        let depth = self.sq.max_depth();
        let sq_off = self.sq.region_off();
        QueuePairPtr::new(
            self.qid(),
            sq_off,
            sq_off + align_up(RequestQueue::region_size(depth)) as Off,
            depth,
        )
    }

    /// Attaches to a pair built by a peer, through this process's mapping.
    pub fn attach(ptr: &QueuePairPtr, base: RegionView) -> Result<Self> {
        let sq_base = base.checked_at(ptr.sq_off)?;
        let ct_base = base.checked_at(ptr.ct_off)?;
        let sq_len = align_up(RequestQueue::region_size(ptr.depth));
        let ct_len = CompletionTable::region_size(ptr.depth);
        if ptr.sq_off as usize + sq_len > base.len() || ptr.ct_off as usize + ct_len > base.len() {
            return Err(Error::AddressOutOfRange {
                off: ptr.sq_off,
                len: base.len(),
            });
        }
        let sq_view = unsafe {
            RegionView::new(std::ptr::NonNull::new_unchecked(sq_base), sq_len)
        };
        let ct_view = unsafe {
            RegionView::new(std::ptr::NonNull::new_unchecked(ct_base), ct_len)
        };
        let sq = RequestQueue::attach(base, sq_view)?;
        let ct = CompletionTable::attach(ct_view)?;
        let qp = Self { base, sq, ct };
        if qp.qid() != ptr.qid {
            return Err(Error::Registration(format!(
                "descriptor qid {:?} does not match region contents {:?}",
                ptr.qid,
                qp.qid()
            )));
        }
        Ok(qp)
    }

    pub fn qid(&self) -> QueueId {
        self.sq.qid()
    }

    pub fn base(&self) -> RegionView {
        self.base
    }

    pub fn depth(&self) -> u64 {
        self.sq.depth()
    }

    pub fn max_depth(&self) -> u32 {
        self.sq.max_depth()
    }

    /// Submits a request, stamping its token.
    pub fn enqueue(&self, req: *mut Request) -> Result<RequestToken> {
        self.sq.enqueue(req)
    }

    /// Blocking submit under the crate retry policy.
    pub fn enqueue_spin(&self, req: *mut Request, wait: SpinWait) -> Result<RequestToken> {
        self.sq.enqueue_spin(req, wait)
    }

    /// Puts a partially processed request back without restamping: its
    /// token, and therefore its completion entry, must survive the trip.
    pub fn requeue(&self, req: *mut Request) -> Result<()> {
        self.sq.requeue(req)
    }

    pub fn dequeue(&self) -> Result<*mut Request> {
        self.sq.dequeue()
    }

    /// Publishes `result` as the completion of `submit`.
    ///
    /// `result` must be a distinct record from `submit`: the submitter owns
    /// the completion from the moment it is published, while the processor
    /// still frees the submission afterwards.
    pub fn complete(&self, submit: *const Request, result: *mut Request) -> Result<()> {
        let req_id = unsafe { read_volatile(addr_of!((*submit).req_id)) };
        let off = self.base.offset_of(result);
        self.base.checked_at(off)?;
        self.ct.publish(req_id, off);
        Ok(())
    }

    pub fn is_complete(&self, token: &RequestToken) -> bool {
        self.ct.is_ready(token.req_id)
    }

    /// Waits for the completion of `token`, consuming its entry. Returns
    /// the completion request, never the submission. With a deadline,
    /// overrun is `Timeout` and the entry is left for a later wait.
    pub fn wait(&self, token: &RequestToken, deadline: Option<Duration>) -> Result<*mut Request> {
        let wait = match deadline {
            Some(d) => SpinWait::with_timeout(d),
            None => SpinWait::new(),
        };
        let off = spin_until(wait, || self.ct.take(token.req_id))?;
        Ok(self.base.checked_at(off)? as *mut Request)
    }
}
