//! Bounded MPMC ring buffer laid out in shared memory.
//!
//! Layout: `RingHeader`, a validity bitmap (one bit per slot), then
//! `max_depth` slots of `T`. Position is tracked by two monotonically
//! increasing counters; a slot index is always `counter % max_depth` and
//! `enqueued - dequeued` is the live depth. Each side holds its own spin
//! lock, and the bitmap additionally marks a slot's payload as published
//! so a dequeuer never observes a half-written slot.
//!
//! `Full` and `Empty` come back as values; callers that want to block wrap
//! the calls in a [`crate::spin::SpinWait`].

use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::{read_volatile, write_volatile};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::region::{align_up, RegionView};
use crate::spin::SpinLock;
use crate::Serial;

#[repr(C)]
struct RingHeader {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    max_depth: u32,
    _pad: u32,
    enq_lock: SpinLock,
    deq_lock: SpinLock,
}

/// Handle over a ring living in a region. Cheap to copy; all state is in
/// the region itself, so any number of handles (in any process mapping the
/// region) address the same ring.
pub struct RingBuffer<T: Serial> {
    header: *mut RingHeader,
    bitmap: *mut AtomicU64,
    slots: *mut T,
    _marker: PhantomData<T>,
}

unsafe impl<T: Serial> Send for RingBuffer<T> {}
unsafe impl<T: Serial> Sync for RingBuffer<T> {}

impl<T: Serial> Clone for RingBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            header: self.header,
            bitmap: self.bitmap,
            slots: self.slots,
            _marker: PhantomData,
        }
    }
}

fn bitmap_words(max_depth: u32) -> usize {
    (max_depth as usize + 63) / 64
}

impl<T: Serial> RingBuffer<T> {
    /// Bytes of region needed for a ring of `max_depth` slots.
    pub fn region_size(max_depth: u32) -> usize {
        align_up(size_of::<RingHeader>())
            + align_up(bitmap_words(max_depth) * size_of::<AtomicU64>())
            + max_depth as usize * size_of::<T>()
    }

    fn layout(view: RegionView, max_depth: u32) -> Result<Self> {
        if max_depth == 0 {
            return Err(Error::Config("ring depth must be non-zero".into()));
        }
        if view.len() < Self::region_size(max_depth) {
            return Err(Error::Config(format!(
                "ring of depth {} needs {} bytes, region has {}",
                max_depth,
                Self::region_size(max_depth),
                view.len()
            )));
        }
        if view.base() as usize % align_of::<RingHeader>() != 0 {
            return Err(Error::Config("ring region is misaligned".into()));
        }
        let header = view.base() as *mut RingHeader;
        let bitmap =
            unsafe { view.base().add(align_up(size_of::<RingHeader>())) } as *mut AtomicU64;
        let slots = unsafe {
            view.base()
                .add(align_up(size_of::<RingHeader>()))
                .add(align_up(bitmap_words(max_depth) * size_of::<AtomicU64>()))
        } as *mut T;
        Ok(Self {
            header,
            bitmap,
            slots,
            _marker: PhantomData,
        })
    }

    /// Initializes a ring in `view`. Called once, by the provisioning side,
    /// before any peer attaches.
    pub fn init(view: RegionView, max_depth: u32) -> Result<Self> {
        let ring = Self::layout(view, max_depth)?;
        unsafe {
            let hdr = &*ring.header;
            hdr.enqueued.store(0, Ordering::Relaxed);
            hdr.dequeued.store(0, Ordering::Relaxed);
            write_volatile(std::ptr::addr_of!((*ring.header).max_depth) as *mut u32, max_depth);
            hdr.enq_lock.init();
            hdr.deq_lock.init();
            for w in 0..bitmap_words(max_depth) {
                (*ring.bitmap.add(w)).store(0, Ordering::Relaxed);
            }
        }
        Ok(ring)
    }

    /// Attaches to a ring previously initialized in this region, possibly
    /// through a different mapping.
    pub fn attach(view: RegionView) -> Result<Self> {
        if view.len() < size_of::<RingHeader>() {
            return Err(Error::Config("region too small for ring header".into()));
        }
        let max_depth = unsafe {
            read_volatile(std::ptr::addr_of!((*(view.base() as *mut RingHeader)).max_depth))
        };
        Self::layout(view, max_depth)
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*self.header }
    }

    pub fn max_depth(&self) -> u32 {
        unsafe { read_volatile(std::ptr::addr_of!((*self.header).max_depth)) }
    }

    /// Entries currently enqueued. Racy by nature; bounded by `max_depth`.
    pub fn depth(&self) -> u64 {
        let hdr = self.header();
        let enq = hdr.enqueued.load(Ordering::Acquire);
        let deq = hdr.dequeued.load(Ordering::Acquire);
        enq.saturating_sub(deq)
    }

    #[inline]
    fn bit(&self, idx: u64) -> (&AtomicU64, u64) {
        let word = unsafe { &*self.bitmap.add((idx / 64) as usize) };
        (word, 1u64 << (idx % 64))
    }

    /// Enqueues `item`, returning its sequence number (the pre-increment
    /// enqueued count). `Full` when the ring is at max depth.
    pub fn enqueue(&self, item: T) -> Result<u64> {
        self.enqueue_with(item, |_| {})
    }

    /// Enqueue variant that runs `stamp` with the sequence number after the
    /// slot is written but before the validity bit publishes it. Consumers
    /// cannot observe the slot until `stamp` has returned.
    pub(crate) fn enqueue_with(&self, item: T, stamp: impl FnOnce(u64)) -> Result<u64> {
        let hdr = self.header();
        let max_depth = self.max_depth() as u64;
        let _guard = hdr.enq_lock.lock();

        let enq = hdr.enqueued.load(Ordering::Relaxed);
        let deq = hdr.dequeued.load(Ordering::Acquire);
        if enq - deq == max_depth {
            return Err(Error::Full);
        }

        let idx = enq % max_depth;
        unsafe { write_volatile(self.slots.add(idx as usize), item) };
        stamp(enq);

        let (word, mask) = self.bit(idx);
        word.fetch_or(mask, Ordering::Release);
        hdr.enqueued.store(enq + 1, Ordering::Release);
        Ok(enq)
    }

    /// Dequeues the oldest entry. `Empty` when there is nothing published.
    pub fn dequeue(&self) -> Result<T> {
        let hdr = self.header();
        let max_depth = self.max_depth() as u64;
        let _guard = hdr.deq_lock.lock();

        let deq = hdr.dequeued.load(Ordering::Relaxed);
        let enq = hdr.enqueued.load(Ordering::Acquire);
        if enq == deq {
            return Err(Error::Empty);
        }

        let idx = deq % max_depth;
        let (word, mask) = self.bit(idx);
        // The counter may be visible before the payload publish; treat an
        // unset bit as not-yet-enqueued.
        if word.load(Ordering::Acquire) & mask == 0 {
            return Err(Error::Empty);
        }

        let item = unsafe { read_volatile(self.slots.add(idx as usize)) };
        word.fetch_and(!mask, Ordering::Release);
        hdr.dequeued.store(deq + 1, Ordering::Release);
        Ok(item)
    }
}
