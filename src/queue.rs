//! Request queues: rings of region-relative request offsets.
//!
//! A queue never stores pointers. Enqueue converts the request's address to
//! an offset against the shared base region, stamps the ring sequence into
//! the request's `req_id` before publication, and hands back the
//! [`RequestToken`] the caller will later wait on.

use std::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile};

use crate::error::Result;
use crate::region::{align_up, Off, RegionView};
use crate::request::{QueueId, Request, RequestToken};
use crate::ring::RingBuffer;
use crate::spin::{spin_until, SpinWait};

#[repr(C)]
struct QueueHeader {
    qid: QueueId,
}

/// Handle over a request queue in a region. All state lives in the region;
/// clones and cross-process attachments address the same queue.
pub struct RequestQueue {
    base: RegionView,
    header: *mut QueueHeader,
    ring: RingBuffer<u32>,
}

unsafe impl Send for RequestQueue {}
unsafe impl Sync for RequestQueue {}

impl Clone for RequestQueue {
    fn clone(&self) -> Self {
        Self {
            base: self.base,
            header: self.header,
            ring: self.ring.clone(),
        }
    }
}

impl RequestQueue {
    /// Bytes of region needed for a queue of `max_depth` requests.
    pub fn region_size(max_depth: u32) -> usize {
        align_up(std::mem::size_of::<QueueHeader>()) + RingBuffer::<u32>::region_size(max_depth)
    }

    /// Initializes a queue in `view`. `base` is the region requests live
    /// in, which offsets are computed against.
    pub fn init(base: RegionView, view: RegionView, max_depth: u32, qid: QueueId) -> Result<Self> {
        let header = view.base() as *mut QueueHeader;
        unsafe { write_volatile(addr_of_mut!((*header).qid), qid) };
        let ring_view = view.slice_from(align_up(std::mem::size_of::<QueueHeader>()))?;
        let ring = RingBuffer::init(ring_view, max_depth)?;
        Ok(Self { base, header, ring })
    }

    /// Attaches to a queue initialized elsewhere, through this process's
    /// own mapping of the region.
    pub fn attach(base: RegionView, view: RegionView) -> Result<Self> {
        let header = view.base() as *mut QueueHeader;
        let ring_view = view.slice_from(align_up(std::mem::size_of::<QueueHeader>()))?;
        let ring = RingBuffer::attach(ring_view)?;
        Ok(Self { base, header, ring })
    }

    /// Offset of the queue's storage within the base region.
    pub(crate) fn region_off(&self) -> Off {
        self.base.offset_of(self.header)
    }

    pub fn qid(&self) -> QueueId {
        unsafe { read_volatile(addr_of!((*self.header).qid)) }
    }

    pub fn depth(&self) -> u64 {
        self.ring.depth()
    }

    pub fn max_depth(&self) -> u32 {
        self.ring.max_depth()
    }

    /// Enqueues a request living in the base region. Non-blocking; `Full`
    /// is returned as a value.
    ///
    /// The ring sequence is stamped into `req.req_id` before the entry is
    /// published, so the consumer always observes a stamped request.
    pub fn enqueue(&self, req: *mut Request) -> Result<RequestToken> {
        let off = self.base.offset_of(req);
        self.base.checked_at(off)?;
        let seq = self
            .ring
            .enqueue_with(off as u32, |seq| unsafe {
                write_volatile(addr_of_mut!((*req).req_id), seq as u32)
            })?;
        Ok(RequestToken::new(self.qid(), seq as u32))
    }

    /// Blocking enqueue under the crate retry policy.
    pub fn enqueue_spin(&self, req: *mut Request, wait: SpinWait) -> Result<RequestToken> {
        spin_until(wait, || self.enqueue(req))
    }

    /// Re-enqueues a request that is already mid-flight, preserving its
    /// stamped `req_id` so the original token stays valid.
    pub fn requeue(&self, req: *mut Request) -> Result<()> {
        let off = self.base.offset_of(req);
        self.base.checked_at(off)?;
        self.ring.enqueue(off as u32)?;
        Ok(())
    }

    /// Dequeues the oldest request, resolving its offset through this
    /// process's mapping.
    pub fn dequeue(&self) -> Result<*mut Request> {
        let off = self.ring.dequeue()?;
        Ok(self.base.checked_at(off as Off)? as *mut Request)
    }
}
