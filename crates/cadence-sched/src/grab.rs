//! Queue of pending worker grab requests.

use std::collections::{HashSet, VecDeque};

use crate::worker::{WorkerId, WorkerRegistry};

/// One outstanding GRAB_JOB request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrabItem {
    /// Owning worker.
    pub worker_id: WorkerId,
    /// Message id to echo in the JOB_ASSIGN reply.
    pub msg_id: Vec<u8>,
}

/// FIFO of grab requests.
///
/// Workers are served in the order they asked within a function; there is no
/// per-function weighting. Items owned by dead or deregistered workers are
/// purged as scans walk past them.
#[derive(Debug, Default)]
pub struct GrabQueue {
    items: VecDeque<GrabItem>,
}

impl GrabQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending grab requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true when no grab requests are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Appends a grab request.
    pub fn push(&mut self, item: GrabItem) {
        self.items.push_back(item);
    }

    /// Removes and returns the first request whose worker is alive and
    /// advertises `func`.
    pub fn take(&mut self, func: &str, workers: &WorkerRegistry) -> Option<GrabItem> {
        let mut index = 0;
        while index < self.items.len() {
            let worker_id = self.items[index].worker_id;
            match workers.get(worker_id) {
                Some(worker) if worker.is_alive() => {
                    if worker.advertises(func) {
                        return self.items.remove(index);
                    }
                    index += 1;
                }
                _ => {
                    self.items.remove(index);
                }
            }
        }
        None
    }

    /// Functions for which at least one alive grab request is waiting.
    pub fn eligible_funcs(&mut self, workers: &WorkerRegistry) -> HashSet<String> {
        let mut funcs = HashSet::new();
        let mut index = 0;
        while index < self.items.len() {
            let worker_id = self.items[index].worker_id;
            match workers.get(worker_id) {
                Some(worker) if worker.is_alive() => {
                    funcs.extend(worker.funcs());
                    index += 1;
                }
                _ => {
                    self.items.remove(index);
                }
            }
        }
        funcs
    }

    /// Removes one item by identity.
    pub fn remove(&mut self, item: &GrabItem) {
        if let Some(pos) = self.items.iter().position(|i| i == item) {
            self.items.remove(pos);
        }
    }

    /// Drops every item owned by a worker.
    pub fn remove_worker(&mut self, worker_id: WorkerId) {
        self.items.retain(|item| item.worker_id != worker_id);
    }
}
