//! Structures built through one mapping, driven through another.
//!
//! Both mappings live in this process, but they sit at different virtual
//! addresses, so any absolute pointer smuggled into the region would fault
//! or corrupt. Everything has to survive on region-relative offsets alone.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use shmq::{
    QueueFlags, QueueId, QueuePair, Request, SegmentAllocator, ShardAllocator, SharedRegion,
};

static NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_shm_name(tag: &str) -> String {
    format!(
        "/shmq_xmap_{}_{}_{}",
        tag,
        std::process::id(),
        NAME_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

const REGION_SIZE: usize = 256 * 1024;
const QUEUE_SPACE: usize = 64 * 1024;
const DEPTH: u32 = 16;

#[repr(C)]
struct Payload {
    head: Request,
    value: u64,
}

fn test_qid() -> QueueId {
    QueueId::new(
        std::process::id(),
        QueueFlags::SHMEM | QueueFlags::STREAM | QueueFlags::PRIMARY,
        0,
        1,
    )
}

/// Creator mapping: allocator over the tail of the region, queue pair
/// carved from the head.
fn build(base: shmq::RegionView) -> (ShardAllocator, QueuePair) {
    let alloc_view = base.slice_from(QUEUE_SPACE).unwrap();
    let alloc = ShardAllocator::init(base, alloc_view, 256, 2).unwrap();

    let mut seg = SegmentAllocator::new(base.slice_from(0).unwrap());
    let qp_view = seg.carve(QueuePair::region_size(DEPTH)).unwrap();
    let qp = QueuePair::create(test_qid(), base, qp_view, DEPTH).unwrap();
    (alloc, qp)
}

#[test]
fn test_round_trip_across_mappings() {
    let name = unique_shm_name("rt");
    let creator = SharedRegion::create(&name, REGION_SIZE).unwrap();
    let peer = SharedRegion::open(&name, REGION_SIZE).unwrap();

    let (alloc_a, qp_a) = build(creator.view());

    // Peer attaches through its own mapping, from offsets alone.
    let peer_base = peer.view();
    let alloc_b = ShardAllocator::attach(peer_base, peer_base.slice_from(QUEUE_SPACE).unwrap())
        .unwrap();
    let qp_b = QueuePair::attach(&qp_a.to_ptr(), peer_base).unwrap();
    assert_eq!(qp_b.qid(), test_qid());

    for i in 0..(DEPTH as u64 * 3) {
        // Peer submits.
        let submit = alloc_b.alloc(0).unwrap().as_ptr() as *mut Payload;
        unsafe {
            (*submit).head.start(1, 0);
            (*submit).value = i;
        }
        let token = qp_b.enqueue(submit as *mut Request).unwrap();

        // Creator processes through its own mapping.
        let got = qp_a.dequeue().unwrap() as *mut Payload;
        let value = unsafe { (*got).value };
        assert_eq!(value, i);

        let result = alloc_a.alloc(1).unwrap().as_ptr() as *mut Payload;
        unsafe {
            (*result).head.start(1, 0);
            (*result).value = value * 2;
        }
        qp_a.complete(got as *const Request, result as *mut Request)
            .unwrap();
        unsafe {
            alloc_a
                .free(std::ptr::NonNull::new(got as *mut u8).unwrap())
                .unwrap()
        };

        // Peer collects, through its mapping again.
        let comp = qp_b.wait(&token, Some(Duration::from_secs(5))).unwrap() as *mut Payload;
        assert_eq!(unsafe { (*comp).value }, i * 2);
        unsafe {
            alloc_b
                .free(std::ptr::NonNull::new(comp as *mut u8).unwrap())
                .unwrap()
        };
    }
}

#[test]
fn test_free_through_other_mapping() {
    let name = unique_shm_name("free");
    let creator = SharedRegion::create(&name, REGION_SIZE).unwrap();
    let peer = SharedRegion::open(&name, REGION_SIZE).unwrap();

    let base_a = creator.view();
    let alloc_view = base_a.slice_from(QUEUE_SPACE).unwrap();
    let alloc_a = ShardAllocator::init(base_a, alloc_view, 256, 2).unwrap();

    let base_b = peer.view();
    let alloc_b =
        ShardAllocator::attach(base_b, base_b.slice_from(QUEUE_SPACE).unwrap()).unwrap();

    // A slot allocated under one base frees cleanly under the other: the
    // stamp is a region offset, and both mappings agree on offsets.
    let p = alloc_a.alloc(0).unwrap();
    let off = base_a.offset_of(p.as_ptr());
    let p_in_b = std::ptr::NonNull::new(base_b.checked_at(off).unwrap()).unwrap();
    unsafe { alloc_b.free(p_in_b).unwrap() };

    // And the slot circulates again on either side.
    let q = alloc_b.alloc(0).unwrap();
    let q_off = base_b.offset_of(q.as_ptr());
    let q_in_a = std::ptr::NonNull::new(base_a.checked_at(q_off).unwrap()).unwrap();
    unsafe { alloc_a.free(q_in_a).unwrap() };
}
