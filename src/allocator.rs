//! Request slot allocation inside a shared region.
//!
//! [`ShardAllocator`] hands out fixed-size slots for request records. The
//! region is split into `concurrency` shards; each shard keeps its free
//! slots as a ring of region-relative offsets, so allocation is a dequeue
//! and free is an enqueue under that shard's lock only. Callers pass a core
//! hint to spread contention; an empty shard falls through to the next one
//! round-robin, and `OutOfMemory` means every shard was tried.
//!
//! Every slot carries a [`BlockHeader`] just before the payload. The header
//! records the owning shard, a reference count, and a stamp of the slot's
//! own offset. Allocation and free verify both; a mismatch means a process
//! scribbled over the region and the allocator refuses to continue
//! (`InvalidState`).

use std::mem::size_of;
use std::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile, NonNull};
use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::{Error, Result};
use crate::region::{align_up, Off, RegionView};
use crate::ring::RingBuffer;

/// Per-slot bookkeeping, located immediately before the payload.
#[repr(C)]
struct BlockHeader {
    shard: u16,
    refcnt: AtomicU16,
    /// Region-relative offset of this header; written on first allocation.
    stamp: u32,
}

#[repr(C)]
struct AllocHeader {
    region_size: u32,
    slot_size: u32,
    concurrency: u32,
    _pad: u32,
}

/// Bounded attempts to push a freed slot back before declaring the free
/// lists corrupt. A healthy shard ring can never stay full this long.
const FREE_RETRY_LIMIT: u32 = 1 << 20;

struct Shard {
    free: RingBuffer<u32>,
}

/// Sharded slab allocator over a prefix of a shared region.
pub struct ShardAllocator {
    base: RegionView,
    header: *mut AllocHeader,
    shards: Vec<Shard>,
}

unsafe impl Send for ShardAllocator {}
unsafe impl Sync for ShardAllocator {}

impl ShardAllocator {
    /// Initializes the allocator in `region` (a sub-window of `base`).
    /// Offsets handed out are relative to `base` so requests can be resolved
    /// by any structure sharing the region.
    ///
    /// `concurrency == 0` means one shard per available core.
    pub fn init(
        base: RegionView,
        region: RegionView,
        request_unit: u32,
        concurrency: usize,
    ) -> Result<Self> {
        let concurrency = effective_concurrency(concurrency);
        if base.len() > u32::MAX as usize {
            return Err(Error::Config(
                "allocator regions are limited to 4 GiB of offset space".into(),
            ));
        }
        if request_unit == 0 || request_unit % 8 != 0 {
            return Err(Error::Config(format!(
                "request unit {} must be a non-zero multiple of 8",
                request_unit
            )));
        }
        let slot_size = request_unit as usize + size_of::<BlockHeader>();
        let header_bytes = align_up(size_of::<AllocHeader>());
        if region.len() <= header_bytes {
            return Err(Error::Config("allocator region too small".into()));
        }
        let shard_size = (region.len() - header_bytes) / concurrency;

        let header = region.base() as *mut AllocHeader;
        unsafe {
            write_volatile(addr_of_mut!((*header).region_size), region.len() as u32);
            write_volatile(addr_of_mut!((*header).slot_size), slot_size as u32);
            write_volatile(addr_of_mut!((*header).concurrency), concurrency as u32);
        }

        let mut shards = Vec::with_capacity(concurrency);
        for s in 0..concurrency {
            let shard_view = region.slice_from(header_bytes + s * shard_size)?;
            shards.push(Shard::init(base, shard_view, shard_size, slot_size, s as u16)?);
        }
        Ok(Self {
            base,
            header,
            shards,
        })
    }

    /// Reattaches to an allocator initialized by another process, through
    /// this process's own mapping.
    pub fn attach(base: RegionView, region: RegionView) -> Result<Self> {
        if region.len() < size_of::<AllocHeader>() {
            return Err(Error::Config("allocator region too small".into()));
        }
        let header = region.base() as *mut AllocHeader;
        let (region_size, slot_size, concurrency) = unsafe {
            (
                read_volatile(addr_of!((*header).region_size)) as usize,
                read_volatile(addr_of!((*header).slot_size)) as usize,
                read_volatile(addr_of!((*header).concurrency)) as usize,
            )
        };
        if concurrency == 0 || slot_size == 0 || region_size > region.len() {
            return Err(Error::InvalidState("allocator header is corrupt"));
        }
        let header_bytes = align_up(size_of::<AllocHeader>());
        let shard_size = (region_size - header_bytes) / concurrency;
        let mut shards = Vec::with_capacity(concurrency);
        for s in 0..concurrency {
            let shard_view = region.slice_from(header_bytes + s * shard_size)?;
            shards.push(Shard::attach(shard_view)?);
        }
        Ok(Self {
            base,
            header,
            shards,
        })
    }

    pub fn concurrency(&self) -> usize {
        self.shards.len()
    }

    /// Usable payload bytes per slot.
    pub fn request_unit(&self) -> u32 {
        let slot_size = unsafe { read_volatile(addr_of!((*self.header).slot_size)) };
        slot_size - size_of::<BlockHeader>() as u32
    }

    /// Allocates one slot, preferring the shard for `core_hint`.
    pub fn alloc(&self, core_hint: usize) -> Result<NonNull<u8>> {
        let n = self.shards.len();
        let start = core_hint % n;
        let mut shard_idx = start;
        loop {
            match self.shards[shard_idx].free.dequeue() {
                Ok(off) => return self.claim(off, shard_idx as u16),
                Err(Error::Empty) => {
                    shard_idx = (shard_idx + 1) % n;
                    if shard_idx == start {
                        return Err(Error::OutOfMemory);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn claim(&self, off: u32, shard: u16) -> Result<NonNull<u8>> {
        let hdr = self.base.checked_at(off as Off)? as *mut BlockHeader;
        unsafe {
            let stamp = read_volatile(addr_of!((*hdr).stamp));
            if stamp == 0 {
                write_volatile(addr_of_mut!((*hdr).stamp), off);
            } else if stamp != off {
                return Err(Error::InvalidState("slot stamp mismatch on alloc"));
            }
            if (*hdr).refcnt.fetch_add(1, Ordering::Relaxed) != 0 {
                return Err(Error::InvalidState("slot refcount not zero on alloc"));
            }
            write_volatile(addr_of_mut!((*hdr).shard), shard);
            Ok(NonNull::new_unchecked((hdr as *mut u8).add(size_of::<BlockHeader>())))
        }
    }

    /// Frees a slot previously returned by [`alloc`](Self::alloc), possibly
    /// by a different process.
    ///
    /// # Safety
    /// `ptr` must be a live slot of this allocator.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        let hdr = ptr.as_ptr().sub(size_of::<BlockHeader>()) as *mut BlockHeader;
        let off = self.base.offset_of(hdr);
        let stamp = read_volatile(addr_of!((*hdr).stamp));
        if i64::from(stamp) != off {
            return Err(Error::InvalidState("slot stamp mismatch on free"));
        }
        // Live slots hold refcnt 1; the exchange lets exactly one of two
        // racing frees win.
        if (*hdr)
            .refcnt
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::InvalidState("slot double free"));
        }

        // Freed slots go back to their owning shard; advance past it only
        // to preserve progress if that ring is wedged full by corruption.
        let shard = read_volatile(addr_of!((*hdr).shard)) as usize % self.shards.len();
        let mut retries = 0u32;
        loop {
            match self.shards[shard].free.enqueue(stamp) {
                Ok(_) => return Ok(()),
                Err(Error::Full) => {
                    retries += 1;
                    if retries >= FREE_RETRY_LIMIT {
                        return Err(Error::InvalidState("free list wedged full"));
                    }
                    std::hint::spin_loop();
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Shard {
    fn init(
        base: RegionView,
        view: RegionView,
        shard_size: usize,
        slot_size: usize,
        shard_id: u16,
    ) -> Result<Self> {
        // Capacity covers the whole shard even though slot storage shares
        // it with the ring itself, so the ring can never reject a free.
        let cap = (shard_size / slot_size) as u32;
        if cap == 0 {
            return Err(Error::Config(format!(
                "shard of {} bytes cannot hold any {}-byte slot",
                shard_size, slot_size
            )));
        }
        let ring_bytes = align_up(RingBuffer::<u32>::region_size(cap));
        if ring_bytes + slot_size > shard_size {
            return Err(Error::Config(
                "allocator shard too small for its free list".into(),
            ));
        }
        let free = RingBuffer::init(view, cap)?;

        let slots_view = view.slice_from(ring_bytes)?;
        let nslots = (shard_size - ring_bytes) / slot_size;
        for i in 0..nslots {
            let hdr = unsafe { slots_view.base().add(i * slot_size) } as *mut BlockHeader;
            let off = base.offset_of(hdr);
            unsafe {
                write_volatile(addr_of_mut!((*hdr).shard), shard_id);
                (*hdr).refcnt.store(0, Ordering::Relaxed);
                write_volatile(addr_of_mut!((*hdr).stamp), 0);
            }
            free.enqueue(off as u32)?;
        }
        Ok(Self { free })
    }

    fn attach(view: RegionView) -> Result<Self> {
        Ok(Self {
            free: RingBuffer::attach(view)?,
        })
    }
}

fn effective_concurrency(concurrency: usize) -> usize {
    if concurrency != 0 {
        return concurrency;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Bump allocator that carves queue storage out of a region.
///
/// Used by the provisioning side only; the carved windows are then
/// communicated to peers as offsets. Nothing is ever returned.
pub struct SegmentAllocator {
    view: RegionView,
    cursor: usize,
}

impl SegmentAllocator {
    pub fn new(view: RegionView) -> Self {
        Self { view, cursor: 0 }
    }

    /// Carves `size` bytes, cache-line aligned.
    pub fn carve(&mut self, size: usize) -> Result<RegionView> {
        let start = align_up(self.cursor);
        let end = start.checked_add(size).ok_or(Error::OutOfMemory)?;
        if end > self.view.len() {
            return Err(Error::OutOfMemory);
        }
        self.cursor = end;
        let window = self.view.slice_from(start)?;
        // Narrow to exactly `size` bytes.
        Ok(unsafe {
            RegionView::new(
                NonNull::new_unchecked(window.base()),
                size,
            )
        })
    }

    pub fn remaining(&self) -> usize {
        self.view.len() - align_up(self.cursor).min(self.view.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    fn setup(region_size: usize, request_unit: u32, concurrency: usize) -> (HeapRegion, ShardAllocator) {
        let region = HeapRegion::new(region_size).unwrap();
        let base = region.view();
        let alloc = ShardAllocator::init(base, base, request_unit, concurrency).unwrap();
        (region, alloc)
    }

    #[test]
    fn test_alloc_free_reuse() {
        let (_region, alloc) = setup(64 * 1024, 256, 2);
        let a = alloc.alloc(0).unwrap();
        unsafe { std::ptr::write_bytes(a.as_ptr(), 0xab, alloc.request_unit() as usize) };
        unsafe { alloc.free(a).unwrap() };
        // The freed slot rejoins the back of its shard's FIFO free list and
        // comes around again before the allocator runs dry.
        let mut held = Vec::new();
        let recycled = loop {
            let p = alloc.alloc(0).unwrap();
            if p == a {
                break p;
            }
            held.push(p);
        };
        assert_eq!(recycled, a);
        unsafe { alloc.free(recycled).unwrap() };
        for p in held {
            unsafe { alloc.free(p).unwrap() };
        }
    }

    #[test]
    fn test_exhaustion_falls_through_shards() {
        let (_region, alloc) = setup(32 * 1024, 512, 4);
        // Hint a single core the whole time: once its shard drains, the
        // allocator must keep succeeding from the other shards.
        let mut slots = Vec::new();
        loop {
            match alloc.alloc(0) {
                Ok(p) => slots.push(p),
                Err(Error::OutOfMemory) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(slots.len() > 4, "expected slots from every shard");
        // Distinct pointers.
        let mut addrs: Vec<usize> = slots.iter().map(|p| p.as_ptr() as usize).collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), slots.len());

        for p in slots {
            unsafe { alloc.free(p).unwrap() };
        }
        // Everything reusable again.
        assert!(alloc.alloc(3).is_ok());
    }

    #[test]
    fn test_double_free_is_fatal() {
        let (_region, alloc) = setup(32 * 1024, 256, 1);
        let p = alloc.alloc(0).unwrap();
        unsafe { alloc.free(p).unwrap() };
        assert!(matches!(
            unsafe { alloc.free(p) },
            Err(Error::InvalidState("slot double free"))
        ));
    }

    #[test]
    fn test_racing_frees_reject_exactly_one() {
        let (_region, alloc) = setup(32 * 1024, 256, 1);
        let alloc = std::sync::Arc::new(alloc);
        let addr = alloc.alloc(0).unwrap().as_ptr() as usize;

        let mut handles = Vec::new();
        for _ in 0..2 {
            let alloc = alloc.clone();
            handles.push(std::thread::spawn(move || unsafe {
                alloc.free(NonNull::new_unchecked(addr as *mut u8)).is_ok()
            }));
        }
        let outcomes: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    }

    #[test]
    fn test_attach_shares_free_lists() {
        let region = HeapRegion::new(64 * 1024).unwrap();
        let base = region.view();
        let alloc1 = ShardAllocator::init(base, base, 256, 2).unwrap();
        let alloc2 = ShardAllocator::attach(base, base).unwrap();
        assert_eq!(alloc2.concurrency(), 2);
        assert_eq!(alloc2.request_unit(), 256);

        let p = alloc1.alloc(0).unwrap();
        unsafe { alloc2.free(p).unwrap() };
        let q = alloc2.alloc(0).unwrap();
        unsafe { alloc1.free(q).unwrap() };
    }

    #[test]
    fn test_payload_does_not_clobber_headers() {
        let (_region, alloc) = setup(32 * 1024, 128, 2);
        let mut slots = Vec::new();
        for i in 0..8 {
            let p = alloc.alloc(i).unwrap();
            unsafe { std::ptr::write_bytes(p.as_ptr(), 0xff, 128) };
            slots.push(p);
        }
        for p in slots {
            unsafe { alloc.free(p).unwrap() };
        }
    }

    #[test]
    fn test_misaligned_request_unit_rejected() {
        let region = HeapRegion::new(4096).unwrap();
        let base = region.view();
        assert!(matches!(
            ShardAllocator::init(base, base, 100, 1),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_segment_allocator_carves_aligned() {
        let region = HeapRegion::new(4096).unwrap();
        let mut seg = SegmentAllocator::new(region.view());
        let a = seg.carve(100).unwrap();
        let b = seg.carve(200).unwrap();
        assert_eq!(a.base() as usize % 64, 0);
        assert_eq!(b.base() as usize % 64, 0);
        assert!(b.base() as usize >= a.base() as usize + 100);
        assert!(matches!(seg.carve(1 << 20), Err(Error::OutOfMemory)));
    }
}
