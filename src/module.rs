//! Named modules and the namespace that routes requests to them.
//!
//! A request carries the namespace id of its target module; workers look
//! the module up and invoke it. Modules are registered once at startup and
//! read on every dispatch, so the registry is a read-mostly map behind a
//! `parking_lot::RwLock`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::manager::IpcManager;
use crate::queue_pair::QueuePair;
use crate::request::{Credentials, Request};

/// What a module did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Processing finished; a completion was (or will not be) published and
    /// the submission slot can be reclaimed.
    Done,
    /// The request is waiting on something, typically a sub-request. The
    /// worker puts it back on the same queue and the module is re-invoked
    /// later with its `stage` and sub-token intact.
    Pending,
}

/// A request processor bound to a namespace id.
///
/// `process_request` runs on worker threads and must never block; waiting
/// is expressed by returning [`ProcessOutcome::Pending`]. Failures are
/// reported by completing the request with a non-zero code, or by
/// returning an error, in which case the worker publishes a
/// dispatch-failure completion itself. Never do both for one request.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn process_request(
        &self,
        ipc: &IpcManager,
        qp: &QueuePair,
        req: &mut Request,
        creds: &Credentials,
    ) -> Result<ProcessOutcome>;
}

#[derive(Default)]
struct Registry {
    by_id: Vec<Arc<dyn Module>>,
    by_key: HashMap<String, u32>,
}

/// Registry mapping module keys to dense namespace ids.
#[derive(Default)]
pub struct Namespace {
    registry: RwLock<Registry>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `module` under `key`, returning its namespace id.
    pub fn register(&self, key: &str, module: Arc<dyn Module>) -> Result<u32> {
        let mut reg = self.registry.write();
        if reg.by_key.contains_key(key) {
            return Err(Error::Registration(format!(
                "module key {:?} already registered",
                key
            )));
        }
        let ns_id = reg.by_id.len() as u32;
        reg.by_id.push(module);
        reg.by_key.insert(key.to_string(), ns_id);
        debug!(key, ns_id, "registered module");
        Ok(ns_id)
    }

    /// Module for a namespace id. O(1); the hot path of every dispatch.
    pub fn get(&self, ns_id: u32) -> Result<Arc<dyn Module>> {
        self.registry
            .read()
            .by_id
            .get(ns_id as usize)
            .cloned()
            .ok_or(Error::ModuleNotFound(ns_id))
    }

    pub fn id_of(&self, key: &str) -> Option<u32> {
        self.registry.read().by_key.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.registry.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Module for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn process_request(
            &self,
            _ipc: &IpcManager,
            _qp: &QueuePair,
            _req: &mut Request,
            _creds: &Credentials,
        ) -> Result<ProcessOutcome> {
            Ok(ProcessOutcome::Done)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let ns = Namespace::new();
        let id = ns.register("echo", Arc::new(Echo)).unwrap();
        assert_eq!(id, 0);
        assert_eq!(ns.id_of("echo"), Some(id));
        assert_eq!(ns.get(id).unwrap().name(), "echo");
        assert_eq!(ns.len(), 1);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let ns = Namespace::new();
        ns.register("echo", Arc::new(Echo)).unwrap();
        assert!(matches!(
            ns.register("echo", Arc::new(Echo)),
            Err(Error::Registration(_))
        ));
    }

    #[test]
    fn test_unknown_id() {
        let ns = Namespace::new();
        assert!(matches!(ns.get(5), Err(Error::ModuleNotFound(5))));
    }

    #[test]
    fn test_ids_are_dense() {
        let ns = Namespace::new();
        let a = ns.register("a", Arc::new(Echo)).unwrap();
        let b = ns.register("b", Arc::new(Echo)).unwrap();
        assert_eq!((a, b), (0, 1));
    }
}
