//! Shared-memory IPC substrate.
//!
//! Processes exchange fixed-size request records through queues laid out
//! in shared memory regions. Everything in a region is addressed by
//! region-relative offsets, never pointers, so peers mapping the region at
//! different base addresses see the same structures.
//!
//! ```text
//!  client process                      server process
//!  ──────────────                      ──────────────
//!  ClientSession ── UnixStream ──────▶ IpcManager::register_client
//!       │                                   │
//!       │  alloc_request / call             │  attach + assign
//!       ▼                                   ▼
//!  ┌───────────────── shared region ─────────────────┐
//!  │ ShardAllocator (request slots)                   │
//!  │ QueuePair: RequestQueue ──▶ Worker ──▶ Module    │
//!  │            CompletionTable ◀── complete ─┘       │
//!  └──────────────────────────────────────────────────┘
//! ```
//!
//! The server runs a [`WorkOrchestrator`] of busy-polling [`worker`]
//! threads; each dequeued request is routed through the [`Namespace`] to
//! the module that owns its `ns_id`. Multi-stage modules return
//! [`ProcessOutcome::Pending`] to be re-invoked once a forwarded
//! sub-request completes.

pub mod allocator;
pub mod config;
pub mod error;
pub mod manager;
pub mod module;
pub mod queue;
pub mod queue_pair;
pub mod region;
pub mod request;
pub mod ring;
pub mod spin;
pub mod worker;

pub use allocator::{SegmentAllocator, ShardAllocator};
pub use config::{MemoryConfig, MemoryPlan, OrchestratorConfig, WorkerConfig};
pub use error::{Error, Result};
pub use manager::{
    ClientSession, ConnectionParams, IpcManager, PosixShmAuthority, RegisterQueues, RegisterReply,
    ShmemAuthority, KERNEL_PID,
};
pub use module::{Module, Namespace, ProcessOutcome};
pub use queue::RequestQueue;
pub use queue_pair::{CompletionTable, QueuePair, QueuePairPtr};
pub use region::{HeapRegion, Off, RegionView, SharedRegion};
pub use request::{
    Credentials, QueueFlags, QueueId, Request, RequestToken, CODE_DISPATCH_FAILED, CODE_OK,
    CODE_SUBREQUEST_FAILED,
};
pub use ring::RingBuffer;
pub use spin::{SpinLock, SpinWait};
pub use worker::WorkOrchestrator;

/// Marker trait for types safely transmittable through shared memory.
///
/// # Safety
/// Types must be `Copy` with a stable memory layout suitable for IPC.
pub unsafe trait Serial: Copy {}

unsafe impl Serial for u8 {}
unsafe impl Serial for u16 {}
unsafe impl Serial for u32 {}
unsafe impl Serial for u64 {}
unsafe impl Serial for u128 {}
unsafe impl Serial for usize {}
unsafe impl Serial for i8 {}
unsafe impl Serial for i16 {}
unsafe impl Serial for i32 {}
unsafe impl Serial for i64 {}
unsafe impl Serial for i128 {}
unsafe impl Serial for isize {}
unsafe impl Serial for f32 {}
unsafe impl Serial for f64 {}
unsafe impl Serial for bool {}
unsafe impl<T: Copy, const N: usize> Serial for [T; N] {}
