use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{
    driver::ProcessHandle,
    function::{Invocation, InvocationResult},
};

/// Per-function scheduling state.
///
/// `idle_workers` and `queued` are both stacks and are never both non-empty
/// once an operation returns: whichever side arrives second drains the other.
#[derive(Default)]
pub(crate) struct Pool {
    idle_workers: Vec<oneshot::Sender<Invocation>>,
    queued: Vec<Invocation>,
    processes: HashMap<String, ProcessHandle>,
    in_flight: HashMap<String, oneshot::Sender<InvocationResult>>,
}

/// What a drain removed from a pool.
pub(crate) struct Drained {
    pub processes: Vec<ProcessHandle>,
    pub released_workers: usize,
    pub abandoned_requests: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub idle_workers: usize,
    pub queued: usize,
    pub processes: usize,
    pub in_flight: usize,
}

impl Pool {
    /// Gives the invocation to the most recently parked worker still waiting.
    /// Hands the invocation back when no such worker exists.
    pub fn hand_to_idle_worker(&mut self, mut invocation: Invocation) -> Result<(), Invocation> {
        while let Some(worker) = self.idle_workers.pop() {
            match worker.send(invocation) {
                Ok(()) => return Ok(()),
                // The worker's connection went away while it was parked.
                Err(returned) => invocation = returned,
            }
        }
        Err(invocation)
    }

    pub fn push_queued(&mut self, invocation: Invocation) {
        self.queued.push(invocation);
    }

    pub fn take_queued(&mut self) -> Option<Invocation> {
        self.queued.pop()
    }

    pub fn park_worker(&mut self) -> oneshot::Receiver<Invocation> {
        self.idle_workers.retain(|worker| !worker.is_closed());
        let (tx, rx) = oneshot::channel();
        self.idle_workers.push(tx);
        rx
    }

    /// Returns `None` if a caller is already waiting on `request_id`.
    pub fn register_request(
        &mut self,
        request_id: &str,
    ) -> Option<oneshot::Receiver<InvocationResult>> {
        if let Some(existing) = self.in_flight.get(request_id) {
            if !existing.is_closed() {
                return None;
            }
        }
        let (tx, rx) = oneshot::channel();
        self.in_flight.insert(request_id.to_string(), tx);
        Some(rx)
    }

    pub fn forget_request(&mut self, request_id: &str) {
        self.in_flight.remove(request_id);
    }

    /// Removes `request_id` only if its caller has stopped waiting.
    pub fn forget_abandoned_request(&mut self, request_id: &str) -> bool {
        match self.in_flight.get(request_id) {
            Some(caller) if caller.is_closed() => {
                self.in_flight.remove(request_id);
                true
            }
            _ => false,
        }
    }

    /// Resolves the caller waiting on `request_id`. Returns false when nobody
    /// was registered or the caller stopped waiting.
    pub fn complete_request(&mut self, request_id: &str, result: InvocationResult) -> bool {
        match self.in_flight.remove(request_id) {
            Some(caller) => caller.send(result).is_ok(),
            None => false,
        }
    }

    pub fn add_process(&mut self, handle: ProcessHandle) {
        self.processes.insert(handle.id.clone(), handle);
    }

    pub fn remove_process(&mut self, id: &str) -> Option<ProcessHandle> {
        self.processes.remove(id)
    }

    /// Releases every idle worker and hands back the live processes so the
    /// caller can terminate them. Queued invocations stay queued. Requests
    /// that already left the queue were taken by a worker this drain is about
    /// to kill; their callers are dropped so they stop waiting.
    pub fn drain(&mut self) -> Drained {
        let queued: HashSet<&str> = self.queued.iter().map(|i| i.request_id()).collect();
        let in_flight_before = self.in_flight.len();
        self.in_flight
            .retain(|request_id, _| queued.contains(request_id.as_str()));

        let released_workers = self.idle_workers.len();
        self.idle_workers.clear();

        Drained {
            processes: self.processes.drain().map(|(_, handle)| handle).collect(),
            released_workers,
            abandoned_requests: in_flight_before - self.in_flight.len(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle_workers: self
                .idle_workers
                .iter()
                .filter(|worker| !worker.is_closed())
                .count(),
            queued: self.queued.len(),
            processes: self.processes.len(),
            in_flight: self
                .in_flight
                .values()
                .filter(|caller| !caller.is_closed())
                .count(),
        }
    }
}
