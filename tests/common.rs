//! Shared fixtures: test modules and a server harness.
#![allow(dead_code)]

use std::sync::Arc;

use shmq::{
    Credentials, IpcManager, MemoryConfig, Module, Namespace, OrchestratorConfig,
    PosixShmAuthority, ProcessOutcome, QueuePair, Request, Result, WorkOrchestrator, WorkerConfig,
};

pub const OP_INC: u32 = 0;
pub const OP_FAIL: u32 = 1;
pub const OP_REJECT: u32 = 2;
pub const FAIL_CODE: i32 = -5;

/// Request payload used by every test module.
#[repr(C)]
pub struct TestRequest {
    pub head: Request,
    pub value: u64,
}

/// Completes every request in place: `OP_INC` returns `value + 1`,
/// `OP_FAIL` completes with [`FAIL_CODE`], `OP_REJECT` errors without
/// completing.
pub struct EchoModule;

impl Module for EchoModule {
    fn name(&self) -> &str {
        "echo"
    }

    fn process_request(
        &self,
        ipc: &IpcManager,
        qp: &QueuePair,
        req: &mut Request,
        _creds: &Credentials,
    ) -> Result<ProcessOutcome> {
        let submit = unsafe { &*(req as *mut Request as *const TestRequest) };
        if submit.head.op == OP_REJECT {
            return Err(shmq::Error::InvalidState("rejected by module"));
        }

        let comp_ptr = ipc.alloc_request(qp, 0)?;
        let comp = unsafe { &mut *(comp_ptr as *mut TestRequest) };
        comp.head.start(submit.head.ns_id, submit.head.op);
        comp.value = submit.value + 1;
        if submit.head.op == OP_FAIL {
            comp.head.code = FAIL_CODE;
        }
        qp.complete(req, comp_ptr)?;
        Ok(ProcessOutcome::Done)
    }
}

/// Two-stage module: forwards the value to the echo module over one of the
/// server's private queues, then completes the original request with the
/// sub-request's outcome.
pub struct ChainModule {
    pub echo_ns: u32,
}

impl Module for ChainModule {
    fn name(&self) -> &str {
        "chain"
    }

    fn process_request(
        &self,
        ipc: &IpcManager,
        qp: &QueuePair,
        req: &mut Request,
        _creds: &Credentials,
    ) -> Result<ProcessOutcome> {
        match req.stage {
            0 => {
                let value = unsafe { (*(req as *mut Request as *const TestRequest)).value };

                let sub_qp = ipc.private_queue_pair()?;
                let sub_ptr = ipc.alloc_request(&sub_qp, 0)?;
                let sub = unsafe { &mut *(sub_ptr as *mut TestRequest) };
                sub.head.start(self.echo_ns, req.op);
                sub.value = value;

                let token = sub_qp.enqueue(sub_ptr)?;
                req.set_sub_token(token);
                req.stage = 1;
                Ok(ProcessOutcome::Pending)
            }
            1 => {
                let token = req
                    .sub_token()
                    .ok_or(shmq::Error::InvalidState("continuation lost its token"))?;
                let sub_qp = ipc.queue_pair(&token.qid)?;
                if !sub_qp.is_complete(&token) {
                    return Ok(ProcessOutcome::Pending);
                }
                let sub_comp_ptr = sub_qp.wait(&token, None)?;
                let (sub_code, sub_value) = unsafe {
                    let sub_comp = &*(sub_comp_ptr as *const TestRequest);
                    (sub_comp.head.code, sub_comp.value)
                };
                unsafe { ipc.free_request(&sub_qp, sub_comp_ptr)? };
                req.take_sub_token();

                let comp_ptr = ipc.alloc_request(qp, 0)?;
                let comp = unsafe { &mut *(comp_ptr as *mut TestRequest) };
                comp.head.start(req.ns_id, req.op);
                comp.head.code = sub_code;
                comp.value = sub_value;
                qp.complete(req, comp_ptr)?;
                Ok(ProcessOutcome::Done)
            }
            _ => Err(shmq::Error::InvalidState("unknown continuation stage")),
        }
    }
}

pub fn small_memory_config() -> MemoryConfig {
    MemoryConfig {
        region_size: 1 << 20,
        request_unit: 256,
        min_request_region: 64 << 10,
        queue_depth: 32,
        num_queues: 2,
    }
}

pub fn orchestrator_config(workers: u32) -> OrchestratorConfig {
    OrchestratorConfig {
        work_queue_depth: 16,
        workers: (0..workers)
            .map(|worker_id| WorkerConfig {
                worker_id,
                cpu_id: None,
            })
            .collect(),
    }
}

pub struct TestServer {
    pub ipc: Arc<IpcManager>,
    pub namespace: Arc<Namespace>,
    pub orchestrator: WorkOrchestrator,
}

/// Spins up a manager with private queues, the given modules, and a
/// two-worker orchestrator.
pub fn start_server(prefix: &str, modules: &[(&str, Arc<dyn Module>)]) -> TestServer {
    start_server_inner(prefix, modules, true)
}

/// Server variant without private queues, for registering an in-process
/// client: per-process state is keyed by pid, and both would claim ours.
pub fn start_server_for_clients(prefix: &str, modules: &[(&str, Arc<dyn Module>)]) -> TestServer {
    start_server_inner(prefix, modules, false)
}

fn start_server_inner(
    prefix: &str,
    modules: &[(&str, Arc<dyn Module>)],
    private_queues: bool,
) -> TestServer {
    let ipc = Arc::new(IpcManager::new(
        small_memory_config(),
        small_memory_config(),
        Arc::new(PosixShmAuthority::new(prefix)),
    ));
    let namespace = Arc::new(Namespace::new());
    for (key, module) in modules {
        namespace.register(key, module.clone()).unwrap();
    }
    let orchestrator =
        WorkOrchestrator::spawn(&orchestrator_config(2), ipc.clone(), namespace.clone()).unwrap();
    if private_queues {
        ipc.create_private_queues(&orchestrator).unwrap();
    }
    TestServer {
        ipc,
        namespace,
        orchestrator,
    }
}

pub fn unique_prefix(tag: &str) -> String {
    format!("shmq_{}_{}", tag, std::process::id())
}
