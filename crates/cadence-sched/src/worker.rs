//! Worker sessions and the worker registry.
//!
//! Each worker connection gets a [`WorkerHandle`] registered under a numeric
//! id. The scheduler's grab queue refers to workers by id only; the registry
//! resolves ids to handles, so worker death never leaves dangling references
//! into the scheduler.
//!
//! Outbound frames go through a bounded channel drained by a writer task
//! that owns the connection's write half. A full or closed channel marks the
//! worker dead.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use cadence_proto::{codec, Command, Message};

use crate::grab::GrabItem;
use crate::sched::Scheduler;

/// Unique worker identifier, assigned at connection time.
pub type WorkerId = u64;

/// Outbound frame buffer per worker connection.
const SEND_QUEUE_DEPTH: usize = 64;

/// Shared handle to one worker connection.
#[derive(Debug)]
pub struct WorkerHandle {
    /// Registry id.
    pub id: WorkerId,
    sender: mpsc::Sender<Vec<u8>>,
    alive: AtomicBool,
    funcs: RwLock<HashSet<String>>,
    assigned: Mutex<HashSet<i64>>,
}

impl WorkerHandle {
    fn new(id: WorkerId, sender: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            id,
            sender,
            alive: AtomicBool::new(true),
            funcs: RwLock::new(HashSet::new()),
            assigned: Mutex::new(HashSet::new()),
        }
    }

    /// Returns true while the connection is usable.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Marks the worker unusable.
    pub fn set_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Returns true if the worker advertises the function.
    #[must_use]
    pub fn advertises(&self, func: &str) -> bool {
        self.funcs.read().unwrap_or_else(|e| e.into_inner()).contains(func)
    }

    /// Adds a function to the advertised set. Returns true if newly added.
    pub fn add_func(&self, func: &str) -> bool {
        self.funcs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(func.to_owned())
    }

    /// Removes a function from the advertised set. Returns true if present.
    pub fn remove_func(&self, func: &str) -> bool {
        self.funcs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(func)
    }

    /// Snapshot of the advertised functions.
    #[must_use]
    pub fn funcs(&self) -> Vec<String> {
        self.funcs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Records a job as assigned to this worker.
    pub fn track(&self, id: i64) {
        self.assigned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
    }

    /// Forgets an assigned job.
    pub fn untrack(&self, id: i64) {
        self.assigned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Drains the assigned set, for death cleanup.
    #[must_use]
    pub fn take_assigned(&self) -> Vec<i64> {
        self.assigned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect()
    }

    /// Queues a frame for the writer task.
    ///
    /// Returns false and marks the worker dead if the connection is gone or
    /// so far behind that its buffer is full.
    pub fn send_frame(&self, body: Vec<u8>) -> bool {
        if !self.is_alive() {
            return false;
        }
        match self.sender.try_send(body) {
            Ok(()) => true,
            Err(e) => {
                warn!(worker_id = self.id, error = %e, "worker send failed");
                self.set_dead();
                false
            }
        }
    }
}

/// Registry of live worker connections.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: DashMap<WorkerId, Arc<WorkerHandle>>,
    next_id: AtomicU64,
}

impl WorkerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new worker connection and returns its handle.
    pub fn register(&self, sender: mpsc::Sender<Vec<u8>>) -> Arc<WorkerHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = Arc::new(WorkerHandle::new(id, sender));
        self.workers.insert(id, handle.clone());
        handle
    }

    /// Resolves a worker id to its handle.
    #[must_use]
    pub fn get(&self, id: WorkerId) -> Option<Arc<WorkerHandle>> {
        self.workers.get(&id).map(|entry| entry.value().clone())
    }

    /// Drops a worker from the registry.
    pub fn remove(&self, id: WorkerId) {
        self.workers.remove(&id);
    }

    /// Number of registered workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true when no workers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Creates the channel feeding a worker connection's writer task.
#[must_use]
pub fn frame_channel() -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
    mpsc::channel(SEND_QUEUE_DEPTH)
}

/// One worker connection's read loop.
pub struct WorkerSession {
    sched: Arc<Scheduler>,
    handle: Arc<WorkerHandle>,
}

impl WorkerSession {
    /// Creates a session for a registered worker.
    #[must_use]
    pub fn new(sched: Arc<Scheduler>, handle: Arc<WorkerHandle>) -> Self {
        Self { sched, handle }
    }

    /// Runs the read loop until disconnect or a protocol error.
    ///
    /// Death cleanup is done by the caller so that it also runs when the
    /// session aborts.
    pub async fn run<R>(&self, reader: &mut R)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let body = match self.sched.read_session_frame(reader).await {
                Ok(body) => body,
                Err(e) => {
                    if !e.is_closed() {
                        warn!(worker_id = self.handle.id, error = %e, "worker read failed");
                    }
                    return;
                }
            };

            let message = match Message::parse(&body) {
                Ok(message) => message,
                Err(e) => {
                    warn!(worker_id = self.handle.id, error = %e, "bad worker frame");
                    continue;
                }
            };

            if let Err(e) = self.dispatch(message).await {
                warn!(worker_id = self.handle.id, error = %e, "worker command failed");
            }

            if !self.handle.is_alive() {
                return;
            }
        }
    }

    async fn dispatch(&self, message: Message) -> crate::error::Result<()> {
        match message.command {
            Command::GrabJob => {
                self.sched.grab_job(GrabItem {
                    worker_id: self.handle.id,
                    msg_id: message.msg_id,
                });
            }
            Command::WorkDone => {
                if let Some(id) = parse_i64(&message.payload) {
                    self.handle.untrack(id);
                    self.sched.done(id).await?;
                } else {
                    debug!(worker_id = self.handle.id, "unparsable WORK_DONE id");
                }
            }
            Command::WorkFail => {
                if let Some(id) = parse_i64(&message.payload) {
                    self.handle.untrack(id);
                    self.sched.fail(id).await?;
                } else {
                    debug!(worker_id = self.handle.id, "unparsable WORK_FAIL id");
                }
            }
            Command::SchedLater => {
                let mut parts = message.payload.splitn(3, |&b| b == cadence_proto::NULL_CHAR);
                let id = parts.next().and_then(parse_i64);
                let delay = parts.next().and_then(parse_i64);
                let counter = parts.next().and_then(parse_i64).unwrap_or(0);
                match (id, delay) {
                    (Some(id), Some(delay)) => {
                        self.handle.untrack(id);
                        self.sched.sched_later(id, delay, counter).await?;
                    }
                    _ => debug!(worker_id = self.handle.id, "unparsable SCHED_LATER"),
                }
            }
            Command::CanDo => {
                let func = String::from_utf8_lossy(&message.payload).into_owned();
                if self.handle.add_func(&func) {
                    self.sched.stats().incr_workers(&func);
                    self.sched.notify_job_timer();
                }
            }
            Command::CantDo => {
                let func = String::from_utf8_lossy(&message.payload).into_owned();
                if self.handle.remove_func(&func) {
                    self.sched.stats().decr_workers(&func);
                }
            }
            Command::Sleep => {
                self.handle
                    .send_frame(Message::encode_reply(&message.msg_id, Command::Noop));
            }
            Command::Ping => {
                self.handle
                    .send_frame(Message::encode_reply(&message.msg_id, Command::Pong));
            }
            other => {
                debug!(worker_id = self.handle.id, command = %other, "unknown worker command");
                self.handle
                    .send_frame(Message::encode_reply(&message.msg_id, Command::Unknown));
            }
        }
        Ok(())
    }
}

/// Drains queued frames to the connection's write half.
pub async fn run_writer<W>(mut receiver: mpsc::Receiver<Vec<u8>>, writer: &mut W)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(body) = receiver.recv().await {
        if let Err(e) = codec::write_frame(writer, &body).await {
            debug!(error = %e, "worker write failed");
            return;
        }
    }
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_func_set_is_idempotent() {
        let (tx, _rx) = frame_channel();
        let handle = WorkerHandle::new(1, tx);

        assert!(handle.add_func("mail"));
        assert!(!handle.add_func("mail"));
        assert!(handle.advertises("mail"));

        assert!(handle.remove_func("mail"));
        assert!(!handle.remove_func("mail"));
        assert!(!handle.advertises("mail"));
    }

    #[test]
    fn send_to_closed_channel_marks_dead() {
        let (tx, rx) = frame_channel();
        drop(rx);
        let handle = WorkerHandle::new(1, tx);

        assert!(!handle.send_frame(b"frame".to_vec()));
        assert!(!handle.is_alive());
    }

    #[test]
    fn registry_assigns_distinct_ids() {
        let registry = WorkerRegistry::new();
        let (tx, _rx) = frame_channel();
        let a = registry.register(tx.clone());
        let b = registry.register(tx);

        assert_ne!(a.id, b.id);
        assert_eq!(registry.len(), 2);

        registry.remove(a.id);
        assert!(registry.get(a.id).is_none());
        assert!(registry.get(b.id).is_some());
    }

    #[test]
    fn assigned_tracking() {
        let (tx, _rx) = frame_channel();
        let handle = WorkerHandle::new(1, tx);

        handle.track(10);
        handle.track(11);
        handle.untrack(10);

        let mut left = handle.take_assigned();
        left.sort_unstable();
        assert_eq!(left, vec![11]);
        assert!(handle.take_assigned().is_empty());
    }

    #[test]
    fn parse_i64_variants() {
        assert_eq!(parse_i64(b"42"), Some(42));
        assert_eq!(parse_i64(b" 7 "), Some(7));
        assert_eq!(parse_i64(b"x"), None);
        assert_eq!(parse_i64(b""), None);
    }
}
