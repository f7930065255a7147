//! Request records, tokens, queue identities and credentials.
//!
//! A request lives entirely inside a shared region: modules define their own
//! `#[repr(C)]` request structs with a [`Request`] header as the first field
//! and cast the slot pointer. Queues move region-relative offsets, and a
//! [`RequestToken`] is the caller's handle for awaiting completion.

use bitflags::bitflags;
use nix::unistd::{getgid, getpid, getuid};

use crate::Serial;

bitflags! {
    /// Properties of a queue, packed into its identity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueFlags: u32 {
        /// Backed by a shared region, visible to other processes.
        const SHMEM = 1 << 0;
        /// Backed by process-private memory.
        const PRIVATE = 1 << 1;
        const STREAM = 1 << 2;
        const DATAGRAM = 1 << 3;
        /// First queue to receive a request chain.
        const PRIMARY = 1 << 4;
        /// Receives requests forwarded from a primary queue.
        const INTERMEDIATE = 1 << 5;
        const ORDERED = 1 << 6;
        const UNORDERED = 1 << 7;
        const LOW_LATENCY = 1 << 8;
        const HIGH_LATENCY = 1 << 9;
    }
}

/// Identity of a queue pair: owning process, properties, and position
/// within that process's group of queues.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId {
    pub pid: u32,
    pub flags: QueueFlags,
    /// Index of this queue within the owner's group.
    pub index: u32,
    /// Size of the owner's group at creation time.
    pub count: u32,
}

unsafe impl Serial for QueueId {}

impl QueueId {
    pub fn new(pid: u32, flags: QueueFlags, index: u32, count: u32) -> Self {
        Self {
            pid,
            flags,
            index,
            count,
        }
    }
}

/// Handle for an in-flight request: which queue it went into and the
/// sequence number the queue stamped on it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken {
    pub qid: QueueId,
    pub req_id: u32,
}

unsafe impl Serial for RequestToken {}

impl RequestToken {
    pub fn new(qid: QueueId, req_id: u32) -> Self {
        Self { qid, req_id }
    }
}

/// Completion code meaning success.
pub const CODE_OK: i32 = 0;
/// Completion code stamped on a request whose sub-request failed.
pub const CODE_SUBREQUEST_FAILED: i32 = -1;
/// Completion code published when no module could process the request.
pub const CODE_DISPATCH_FAILED: i32 = -2;

/// Common header of every request. Module-specific requests embed this as
/// their first field.
///
/// `stage` and the sub-token are continuation state for multi-stage
/// processing: a module that forwards work to another queue records the
/// sub-request's token here, returns `Pending`, and resumes from `stage`
/// when re-invoked.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub ns_id: u32,
    pub op: u32,
    pub code: i32,
    /// Stamped by the queue on enqueue; identifies the completion slot.
    pub req_id: u32,
    pub stage: u32,
    sub_valid: u32,
    sub_token: RequestToken,
}

unsafe impl Serial for Request {}

impl Request {
    pub fn start(&mut self, ns_id: u32, op: u32) {
        self.ns_id = ns_id;
        self.op = op;
        self.code = CODE_OK;
        self.req_id = 0;
        self.stage = 0;
        self.sub_valid = 0;
    }

    /// Copies the outcome of `other` into this request's completion fields.
    pub fn copy_outcome(&mut self, other: &Request) {
        self.code = other.code;
    }

    pub fn succeeded(&self) -> bool {
        self.code == CODE_OK
    }

    /// Records the token of a forwarded sub-request.
    pub fn set_sub_token(&mut self, token: RequestToken) {
        self.sub_token = token;
        self.sub_valid = 1;
    }

    /// Takes the recorded sub-request token, clearing it.
    pub fn take_sub_token(&mut self) -> Option<RequestToken> {
        if self.sub_valid == 0 {
            return None;
        }
        self.sub_valid = 0;
        Some(self.sub_token)
    }

    pub fn sub_token(&self) -> Option<RequestToken> {
        if self.sub_valid == 0 {
            None
        } else {
            Some(self.sub_token)
        }
    }
}

/// Identity of the process on whose behalf a request is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    /// Credentials of the calling process.
    pub fn current() -> Self {
        Self {
            pid: getpid().as_raw() as u32,
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
        }
    }
}
