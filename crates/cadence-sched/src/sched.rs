//! Scheduler core.
//!
//! The scheduler owns four mutable structures and keeps them consistent with
//! the store:
//!
//! - per-function ready heaps ordered by `sched_at`
//! - a global revert heap ordered by in-flight deadline
//! - the proc table of in-flight jobs
//! - the grab queue of pending worker requests
//!
//! Two long-running dispatcher tasks drain the ready and revert heaps. All
//! waits are bounded by one minute so that a lost wake self-heals; any
//! mutation that can change the earliest event calls the matching notify.
//!
//! Lock order: the proc table (async mutex, held across store calls) before
//! the queue set or grab queue (plain mutexes, never held across an await).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cadence_proto::{codec, Command, Job, Message, ProtocolError, NULL_CHAR};
use cadence_store::Driver;

use crate::error::Result;
use crate::grab::{GrabItem, GrabQueue};
use crate::queue::{QueueItem, TimeQueue};
use crate::stats::StatRegistry;
use crate::worker::{WorkerHandle, WorkerRegistry};

/// Ceiling on dispatcher waits; lost notifications self-heal within this.
const MAX_WAIT: Duration = Duration::from_secs(60);

/// Returns the current unix time in seconds.
#[must_use]
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// The ready item currently selected across all functions.
#[derive(Debug, Clone)]
struct CachedItem {
    func: String,
    item: QueueItem,
}

#[derive(Debug, Default)]
struct QueueSet {
    ready: HashMap<String, TimeQueue>,
    revert: TimeQueue,
    cache: Option<CachedItem>,
}

/// The scheduler engine.
pub struct Scheduler {
    driver: Arc<dyn Driver>,
    stats: StatRegistry,
    workers: WorkerRegistry,
    proc: Mutex<HashMap<i64, Job>>,
    queues: StdMutex<QueueSet>,
    grab: StdMutex<GrabQueue>,
    job_wake: Notify,
    revert_wake: Notify,
    shutdown: CancellationToken,
    session_deadline: Option<Duration>,
}

impl Scheduler {
    /// Creates a scheduler over the given store.
    pub fn new(
        driver: Arc<dyn Driver>,
        session_deadline: Option<Duration>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            driver,
            stats: StatRegistry::new(),
            workers: WorkerRegistry::new(),
            proc: Mutex::new(HashMap::new()),
            queues: StdMutex::new(QueueSet::default()),
            grab: StdMutex::new(GrabQueue::new()),
            job_wake: Notify::new(),
            revert_wake: Notify::new(),
            shutdown,
            session_deadline,
        })
    }

    /// The per-function counters.
    #[must_use]
    pub fn stats(&self) -> &StatRegistry {
        &self.stats
    }

    /// The worker registry.
    #[must_use]
    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    /// The backing store.
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Rebuilds in-memory state from the store.
    ///
    /// Ready jobs return to their heaps; in-flight jobs whose deadline has
    /// not passed go back to the proc table and revert heap, the rest are
    /// reverted to ready. Tombstones are deleted on sight.
    pub async fn restore(&self) -> Result<()> {
        let now = unix_now();
        let mut tombstones = Vec::new();
        let mut revived = Vec::new();
        let mut total = 0usize;

        {
            let mut stream = self.driver.iter(None).await?;
            while let Some(job) = stream.next().await {
                let job = job?;
                if job.name.is_empty() {
                    tombstones.push(job.id);
                    continue;
                }
                total += 1;
                self.stats.incr_jobs(&job.func);
                if job.is_processing() {
                    if job.timeout > 0 && job.deadline() > now {
                        self.stats.incr_processing(&job.func);
                        self.queue_set().revert.push(QueueItem {
                            value: job.id,
                            priority: job.deadline(),
                        });
                        self.proc.lock().await.insert(job.id, job);
                    } else {
                        revived.push(job);
                    }
                } else {
                    self.push_ready(&job);
                }
            }
        }

        for id in tombstones {
            self.driver.delete(id).await?;
        }
        for mut job in revived {
            job.set_ready();
            self.driver.save(&mut job, false).await?;
            self.push_ready(&job);
        }

        info!(jobs = total, "scheduler state restored");
        Ok(())
    }

    /// Spawns the ready and revert dispatcher tasks.
    pub fn start(self: &Arc<Self>) {
        let ready = Arc::clone(self);
        tokio::spawn(async move { ready.run_ready_loop().await });
        let revert = Arc::clone(self);
        tokio::spawn(async move { revert.run_revert_loop().await });
    }

    /// Stops the dispatchers and releases the store.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.notify_job_timer();
        self.notify_revert_timer();
        self.driver.close().await?;
        Ok(())
    }

    // ── Entry points ───────────────────────────────────────────────

    /// Accepts a job, replacing any existing job with the same (func, name).
    ///
    /// A replaced in-flight job is pulled out of the revert heap and proc
    /// table; its eventual WORK_DONE will find nothing to complete.
    pub async fn submit(&self, mut job: Job) -> Result<()> {
        let mut proc = self.proc.lock().await;
        job.set_ready();

        let mut is_new = true;
        match self.driver.get_by_name(&job.func, &job.name).await {
            Ok(old) => {
                job.id = old.id;
                is_new = false;
                if old.is_processing() {
                    self.stats.decr_processing(&old.func);
                    self.remove_revert(old.id);
                    proc.remove(&old.id);
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        self.driver.save(&mut job, false).await?;
        if is_new {
            self.stats.incr_jobs(&job.func);
        }
        self.push_ready(&job);
        drop(proc);

        self.notify_job_timer();
        Ok(())
    }

    /// Removes a job by its (func, name) key.
    pub async fn remove(&self, func: &str, name: &str) -> Result<()> {
        let mut proc = self.proc.lock().await;
        let job = self.driver.get_by_name(func, name).await?;
        proc.remove(&job.id);
        self.driver.delete(job.id).await?;
        self.stats.decr_jobs(&job.func);
        if job.is_processing() {
            self.stats.decr_processing(&job.func);
            self.remove_revert(job.id);
        } else {
            self.remove_ready(&job.func, job.id);
        }
        drop(proc);

        self.notify_job_timer();
        Ok(())
    }

    /// Deletes a function and all of its jobs, unless workers still
    /// advertise it (then nothing is deleted).
    pub async fn drop_func(&self, func: &str) -> Result<()> {
        let _proc = self.proc.lock().await;
        if self.stats.workers(func) == 0 {
            let mut ids = Vec::new();
            {
                let mut stream = self.driver.iter(Some(func)).await?;
                while let Some(job) = stream.next().await {
                    ids.push(job?.id);
                }
            }
            let count = ids.len();
            for id in ids {
                self.driver.delete(id).await?;
            }
            self.stats.remove(func);

            let mut queues = self.queue_set();
            queues.ready.remove(func);
            if queues.cache.as_ref().is_some_and(|c| c.func == func) {
                queues.cache = None;
            }
            drop(queues);

            info!(func, jobs = count, "function dropped");
        } else {
            debug!(func, "drop skipped, workers still subscribed");
        }
        self.notify_job_timer();
        Ok(())
    }

    /// Completes a job: periodic jobs are re-armed, one-shots deleted.
    pub async fn done(&self, id: i64) -> Result<()> {
        let mut proc = self.proc.lock().await;
        proc.remove(&id);
        match self.driver.get(id).await {
            Ok(mut job) => {
                if job.is_processing() {
                    self.stats.decr_processing(&job.func);
                }
                self.remove_revert(id);
                if job.is_period() {
                    job.reset_period(unix_now());
                    job.set_ready();
                    self.driver.save(&mut job, false).await?;
                    self.push_ready(&job);
                } else {
                    self.driver.delete(id).await?;
                    self.stats.decr_jobs(&job.func);
                    self.remove_ready(&job.func, id);
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        drop(proc);

        self.notify_job_timer();
        self.notify_revert_timer();
        Ok(())
    }

    /// Returns a failed job to its ready heap.
    pub async fn fail(&self, id: i64) -> Result<()> {
        self.release(id, None).await
    }

    /// Returns a job to its ready heap with a new `sched_at` and counter.
    pub async fn sched_later(&self, id: i64, delay: i64, counter: i64) -> Result<()> {
        self.release(id, Some((delay, counter))).await
    }

    async fn release(&self, id: i64, later: Option<(i64, i64)>) -> Result<()> {
        let mut proc = self.proc.lock().await;
        proc.remove(&id);
        match self.driver.get(id).await {
            Ok(mut job) => {
                if job.is_processing() {
                    self.stats.decr_processing(&job.func);
                    self.remove_revert(id);
                }
                job.set_ready();
                if let Some((delay, counter)) = later {
                    job.sched_at = unix_now() + delay;
                    job.counter += counter;
                }
                self.driver.save(&mut job, false).await?;
                self.push_ready(&job);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        drop(proc);

        self.notify_job_timer();
        self.notify_revert_timer();
        Ok(())
    }

    /// Re-ingests dumped jobs, keeping their ids.
    pub async fn load_jobs(&self, jobs: Vec<Job>) -> Result<()> {
        for mut job in jobs {
            if job.name.is_empty() || job.func.is_empty() {
                continue;
            }
            if let Err(e) = job.init() {
                warn!(func = %job.func, name = %job.name, error = %e, "skipping job on load");
                continue;
            }
            job.run_at = job.run_at.max(job.sched_at);
            job.set_ready();
            self.driver.save(&mut job, true).await?;
            self.stats.incr_jobs(&job.func);
            self.push_ready(&job);
        }
        self.notify_job_timer();
        Ok(())
    }

    /// Queues a worker grab request.
    pub fn grab_job(&self, item: GrabItem) {
        self.grab_queue().push(item);
        self.notify_job_timer();
    }

    /// Runs death cleanup for a worker connection.
    ///
    /// Jobs still assigned to the worker are failed back to their ready
    /// heaps; worker counters drop for every still-advertised function.
    pub async fn worker_closed(&self, handle: &Arc<WorkerHandle>) {
        handle.set_dead();
        self.grab_queue().remove_worker(handle.id);

        for id in handle.take_assigned() {
            if let Err(e) = self.fail(id).await {
                warn!(worker_id = handle.id, job_id = id, error = %e, "failing job on worker death");
            }
        }
        for func in handle.funcs() {
            self.stats.decr_workers(&func);
        }
        self.workers.remove(handle.id);
        self.notify_job_timer();
        debug!(worker_id = handle.id, "worker closed");
    }

    // ── Dispatcher loops ───────────────────────────────────────────

    async fn run_ready_loop(self: Arc<Self>) {
        debug!("ready dispatcher started");
        while !self.shutdown.is_cancelled() {
            if self.grab_queue().is_empty() {
                self.wait_job(MAX_WAIT).await;
                continue;
            }

            let Some(selected) = self.next_ready_item() else {
                self.wait_job(MAX_WAIT).await;
                continue;
            };

            let job = match self.driver.get(selected.item.value).await {
                Ok(job) => job,
                Err(e) if e.is_not_found() => {
                    self.clear_cache();
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "loading ready job failed");
                    self.push_back_cache();
                    self.wait_job(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let now = unix_now();
            if job.sched_at > now {
                self.wait_job(Duration::from_secs((job.sched_at - now) as u64))
                    .await;
                if job.sched_at > unix_now() {
                    // Woken early by a state change; rescan from scratch.
                    self.push_back_cache();
                }
                continue;
            }

            let grabbed = self.grab_queue().take(&job.func, &self.workers);
            match grabbed {
                Some(item) => match self.assign_job(&item, &job).await {
                    Ok(true) => self.clear_cache(),
                    Ok(false) => self.push_back_cache(),
                    Err(e) => {
                        warn!(job_id = job.id, error = %e, "job assignment failed");
                        self.push_back_cache();
                    }
                },
                None => {
                    // The grabber vanished between the scan and the take.
                    self.push_back_cache();
                    self.wait_job(Duration::from_secs(1)).await;
                }
            }
        }
        debug!("ready dispatcher stopped");
    }

    async fn run_revert_loop(self: Arc<Self>) {
        debug!("revert dispatcher started");
        while !self.shutdown.is_cancelled() {
            let head = { self.queue_set().revert.peek().copied() };
            let Some(item) = head else {
                self.wait_revert(MAX_WAIT).await;
                continue;
            };

            let now = unix_now();
            if item.priority > now {
                self.wait_revert(Duration::from_secs((item.priority - now) as u64))
                    .await;
                continue;
            }

            let popped = {
                let mut queues = self.queue_set();
                if queues.revert.peek() == Some(&item) {
                    queues.revert.pop()
                } else {
                    None
                }
            };
            let Some(item) = popped else { continue };

            if let Err(e) = self.revert_job(item.value).await {
                warn!(job_id = item.value, error = %e, "revert failed");
            }
        }
        debug!("revert dispatcher stopped");
    }

    async fn revert_job(&self, id: i64) -> Result<()> {
        let mut proc = self.proc.lock().await;
        match self.driver.get(id).await {
            Ok(mut job) => {
                if job.is_processing() {
                    debug!(job_id = id, func = %job.func, "job timed out, back to ready");
                    self.stats.decr_processing(&job.func);
                    job.set_ready();
                    self.driver.save(&mut job, false).await?;
                    self.push_ready(&job);
                }
                proc.remove(&id);
            }
            Err(e) if e.is_not_found() => {
                proc.remove(&id);
            }
            Err(e) => return Err(e.into()),
        }
        drop(proc);

        self.notify_job_timer();
        Ok(())
    }

    /// Hands a job to a grabbing worker.
    ///
    /// Returns false when the worker cannot take it (dead, vanished, or the
    /// send failed); the caller then re-queues the job. Tombstones and jobs
    /// already in flight count as handled.
    async fn assign_job(&self, grab: &GrabItem, job: &Job) -> Result<bool> {
        let mut proc = self.proc.lock().await;
        if job.name.is_empty() {
            self.driver.delete(job.id).await?;
            return Ok(true);
        }
        if proc.contains_key(&job.id) {
            return Ok(true);
        }
        let Some(worker) = self.workers.get(grab.worker_id) else {
            return Ok(false);
        };
        if !worker.is_alive() {
            return Ok(false);
        }

        let mut assigned = job.clone();
        assigned.set_processing();
        assigned.run_at = unix_now();

        // msg_id ␀ JOB_ASSIGN ␀ id ␀ job_json
        let mut payload = assigned.id.to_string().into_bytes();
        payload.push(NULL_CHAR);
        payload.extend_from_slice(&assigned.to_json()?);
        if !worker.send_frame(Message::encode(&grab.msg_id, Command::JobAssign, &payload)) {
            return Ok(false);
        }

        self.driver.save(&mut assigned, false).await?;
        self.stats.incr_processing(&assigned.func);
        if assigned.timeout > 0 {
            self.queue_set().revert.push(QueueItem {
                value: assigned.id,
                priority: assigned.deadline(),
            });
        }
        worker.track(assigned.id);
        debug!(job_id = assigned.id, func = %assigned.func, worker_id = worker.id, "job assigned");
        proc.insert(assigned.id, assigned);
        drop(proc);

        self.notify_revert_timer();
        Ok(true)
    }

    // ── Queue bookkeeping ──────────────────────────────────────────

    /// Selects the earliest ready item across all functions that currently
    /// have a waiting grabber, caching the winner.
    fn next_ready_item(&self) -> Option<CachedItem> {
        let eligible = self.grab_queue().eligible_funcs(&self.workers);
        if eligible.is_empty() {
            return None;
        }

        let mut queues = self.queue_set();

        // Re-validate the cache: its function may have been dropped or its
        // workers may be gone since it was selected.
        if let Some(cached) = &queues.cache {
            if eligible.contains(&cached.func) && queues.ready.contains_key(&cached.func) {
                return Some(cached.clone());
            }
            let stale = queues.cache.take().unwrap();
            queues
                .ready
                .entry(stale.func.clone())
                .or_default()
                .push(stale.item);
        }

        let mut best: Option<CachedItem> = None;
        for (func, heap) in &queues.ready {
            if !eligible.contains(func) {
                continue;
            }
            let Some(head) = heap.peek() else { continue };
            if best
                .as_ref()
                .is_none_or(|b| head.priority < b.item.priority)
            {
                best = Some(CachedItem {
                    func: func.clone(),
                    item: *head,
                });
            }
        }

        if let Some(best) = &best {
            if let Some(heap) = queues.ready.get_mut(&best.func) {
                heap.pop();
            }
            queues.cache = Some(best.clone());
        }
        best
    }

    fn push_ready(&self, job: &Job) {
        let mut queues = self.queue_set();
        let item = QueueItem {
            value: job.id,
            priority: job.sched_at,
        };
        // A push with a lower priority, or for the cached id itself,
        // invalidates the cache.
        if let Some(cached) = &queues.cache {
            if cached.item.value == item.value || item.priority < cached.item.priority {
                let stale = queues.cache.take().unwrap();
                if stale.item.value != item.value {
                    queues
                        .ready
                        .entry(stale.func.clone())
                        .or_default()
                        .push(stale.item);
                }
            }
        }
        queues.ready.entry(job.func.clone()).or_default().push(item);
    }

    fn remove_ready(&self, func: &str, id: i64) {
        let mut queues = self.queue_set();
        if queues.cache.as_ref().is_some_and(|c| c.item.value == id) {
            queues.cache = None;
        }
        if let Some(heap) = queues.ready.get_mut(func) {
            heap.remove_value(id);
        }
    }

    fn remove_revert(&self, id: i64) {
        self.queue_set().revert.remove_value(id);
    }

    fn clear_cache(&self) {
        self.queue_set().cache = None;
    }

    fn push_back_cache(&self) {
        let mut queues = self.queue_set();
        if let Some(cached) = queues.cache.take() {
            queues
                .ready
                .entry(cached.func.clone())
                .or_default()
                .push(cached.item);
        }
    }

    fn queue_set(&self) -> std::sync::MutexGuard<'_, QueueSet> {
        self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn grab_queue(&self) -> std::sync::MutexGuard<'_, GrabQueue> {
        self.grab
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // ── Timers ─────────────────────────────────────────────────────

    /// Wakes the ready dispatcher so it recomputes its next event.
    pub fn notify_job_timer(&self) {
        self.job_wake.notify_one();
    }

    /// Wakes the revert dispatcher so it recomputes its next event.
    pub fn notify_revert_timer(&self) {
        self.revert_wake.notify_one();
    }

    async fn wait_job(&self, duration: Duration) {
        let duration = duration.min(MAX_WAIT);
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.job_wake.notified() => {}
            () = self.shutdown.cancelled() => {}
        }
    }

    async fn wait_revert(&self, duration: Duration) {
        let duration = duration.min(MAX_WAIT);
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.revert_wake.notified() => {}
            () = self.shutdown.cancelled() => {}
        }
    }

    /// Reads one frame from a session connection, honouring the configured
    /// per-connection deadline.
    pub(crate) async fn read_session_frame<R>(
        &self,
        reader: &mut R,
    ) -> std::result::Result<Vec<u8>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        match self.session_deadline {
            Some(deadline) => tokio::time::timeout(deadline, codec::read_frame(reader))
                .await
                .map_err(|_| {
                    ProtocolError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "read deadline exceeded",
                    ))
                })?,
            None => codec::read_frame(reader).await,
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::frame_channel;
    use cadence_store::MemoryDriver;

    fn scheduler() -> Arc<Scheduler> {
        Scheduler::new(
            Arc::new(MemoryDriver::new()),
            None,
            CancellationToken::new(),
        )
    }

    fn job_json(func: &str, name: &str, extra: &str) -> Job {
        let sep = if extra.is_empty() { "" } else { "," };
        Job::from_json(
            format!(r#"{{"func":"{func}","name":"{name}"{sep}{extra}}}"#).as_bytes(),
        )
        .unwrap()
    }

    impl Scheduler {
        fn ready_contains(&self, func: &str, id: i64) -> bool {
            let queues = self.queues.lock().unwrap();
            queues
                .ready
                .get(func)
                .is_some_and(|heap| heap.get(id).is_some())
                || queues
                    .cache
                    .as_ref()
                    .is_some_and(|c| c.func == func && c.item.value == id)
        }

        fn revert_priority(&self, id: i64) -> Option<i64> {
            self.queues
                .lock()
                .unwrap()
                .revert
                .get(id)
                .map(|item| item.priority)
        }

        async fn proc_contains(&self, id: i64) -> bool {
            self.proc.lock().await.contains_key(&id)
        }
    }

    /// Every persisted job sits in exactly one of the ready heap (status
    /// ready) or the proc table (status processing).
    #[tokio::test]
    async fn submitted_job_is_ready_and_queued() {
        let sched = scheduler();
        sched.submit(job_json("mail", "welcome", "")).await.unwrap();

        let job = sched.driver().get_by_name("mail", "welcome").await.unwrap();
        assert!(job.is_ready());
        assert!(sched.ready_contains("mail", job.id));
        assert!(!sched.proc_contains(job.id).await);
        assert_eq!(sched.stats().lines(), vec!["mail,0,1,0"]);
    }

    #[tokio::test]
    async fn assigned_job_moves_to_proc_with_deadline() {
        let sched = scheduler();
        sched
            .submit(job_json("mail", "welcome", r#""timeout":30,"sched_at":100"#))
            .await
            .unwrap();
        let job = sched.driver().get_by_name("mail", "welcome").await.unwrap();

        let (tx, mut rx) = frame_channel();
        let worker = sched.workers().register(tx);
        worker.add_func("mail");
        sched.stats().incr_workers("mail");

        // Walk the dispatcher's path: grab, select, take, assign.
        sched.grab_job(GrabItem {
            worker_id: worker.id,
            msg_id: b"1".to_vec(),
        });
        let selected = sched.next_ready_item().unwrap();
        assert_eq!(selected.item.value, job.id);
        let grabbed = {
            let mut grab = sched.grab.lock().unwrap();
            grab.take(&job.func, &sched.workers).unwrap()
        };
        assert!(sched.assign_job(&grabbed, &job).await.unwrap());
        sched.clear_cache();

        // Worker received the JOB_ASSIGN frame.
        let frame = rx.try_recv().unwrap();
        let message = Message::parse(&frame).unwrap();
        assert_eq!(message.command, Command::JobAssign);

        // Exactly one home: the proc table, with the revert deadline at
        // max(run_at, sched_at) + timeout.
        let stored = sched.driver().get(job.id).await.unwrap();
        assert!(stored.is_processing());
        assert!(sched.proc_contains(job.id).await);
        assert!(!sched.ready_contains("mail", job.id));
        assert_eq!(
            sched.revert_priority(job.id),
            Some(stored.run_at.max(stored.sched_at) + 30)
        );
        assert_eq!(sched.stats().lines(), vec!["mail,1,1,1"]);
    }

    #[tokio::test]
    async fn done_deletes_one_shot() {
        let sched = scheduler();
        sched.submit(job_json("mail", "welcome", "")).await.unwrap();
        let job = sched.driver().get_by_name("mail", "welcome").await.unwrap();

        let (tx, _rx) = frame_channel();
        let worker = sched.workers().register(tx);
        worker.add_func("mail");
        let grabbed = GrabItem {
            worker_id: worker.id,
            msg_id: b"1".to_vec(),
        };
        sched.assign_job(&grabbed, &job).await.unwrap();

        sched.done(job.id).await.unwrap();

        assert!(sched.driver().get(job.id).await.is_err());
        assert!(!sched.proc_contains(job.id).await);
        assert_eq!(sched.revert_priority(job.id), None);
        assert_eq!(sched.stats().lines(), vec!["mail,0,0,0"]);
    }

    #[tokio::test]
    async fn done_rearms_periodic_job() {
        let sched = scheduler();
        sched
            .submit(job_json("clock", "tick", r#""period":"every_60s""#))
            .await
            .unwrap();
        let job = sched.driver().get_by_name("clock", "tick").await.unwrap();

        let (tx, _rx) = frame_channel();
        let worker = sched.workers().register(tx);
        worker.add_func("clock");
        sched.stats().incr_workers("clock");
        let grabbed = GrabItem {
            worker_id: worker.id,
            msg_id: b"1".to_vec(),
        };
        sched.assign_job(&grabbed, &job).await.unwrap();
        sched.done(job.id).await.unwrap();

        let rearmed = sched.driver().get(job.id).await.unwrap();
        assert!(rearmed.is_ready());
        assert!(rearmed.sched_at > unix_now());
        assert!(sched.ready_contains("clock", job.id));
        // Same id, still counted.
        assert_eq!(sched.stats().lines(), vec!["clock,1,1,0"]);
    }

    #[tokio::test]
    async fn fail_returns_job_to_ready() {
        let sched = scheduler();
        sched.submit(job_json("mail", "welcome", r#""timeout":5"#)).await.unwrap();
        let job = sched.driver().get_by_name("mail", "welcome").await.unwrap();

        let (tx, _rx) = frame_channel();
        let worker = sched.workers().register(tx);
        worker.add_func("mail");
        sched.stats().incr_workers("mail");
        let grabbed = GrabItem {
            worker_id: worker.id,
            msg_id: b"1".to_vec(),
        };
        sched.assign_job(&grabbed, &job).await.unwrap();

        sched.fail(job.id).await.unwrap();

        let stored = sched.driver().get(job.id).await.unwrap();
        assert!(stored.is_ready());
        assert!(sched.ready_contains("mail", job.id));
        assert!(!sched.proc_contains(job.id).await);
        assert_eq!(sched.revert_priority(job.id), None);
        assert_eq!(sched.stats().lines(), vec!["mail,1,1,0"]);
    }

    #[tokio::test]
    async fn sched_later_delays_and_counts() {
        let sched = scheduler();
        sched.submit(job_json("mail", "welcome", "")).await.unwrap();
        let job = sched.driver().get_by_name("mail", "welcome").await.unwrap();

        let (tx, _rx) = frame_channel();
        let worker = sched.workers().register(tx);
        worker.add_func("mail");
        let grabbed = GrabItem {
            worker_id: worker.id,
            msg_id: b"1".to_vec(),
        };
        sched.assign_job(&grabbed, &job).await.unwrap();

        sched.sched_later(job.id, 300, 2).await.unwrap();

        let stored = sched.driver().get(job.id).await.unwrap();
        assert!(stored.is_ready());
        assert!(stored.sched_at >= unix_now() + 299);
        assert_eq!(stored.counter, 2);
    }

    /// Submit-after-submit with the same (func, name) keeps the id and does
    /// not inflate the job counter.
    #[tokio::test]
    async fn resubmit_preserves_id_and_counter() {
        let sched = scheduler();
        sched
            .submit(job_json("mail", "welcome", r#""sched_at":100"#))
            .await
            .unwrap();
        let first = sched.driver().get_by_name("mail", "welcome").await.unwrap();

        sched
            .submit(job_json("mail", "welcome", r#""sched_at":50"#))
            .await
            .unwrap();
        let second = sched.driver().get_by_name("mail", "welcome").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.sched_at, 50);
        assert_eq!(sched.stats().lines(), vec!["mail,0,1,0"]);

        // The heap entry follows the latest sched_at.
        let queues = sched.queues.lock().unwrap();
        let heap_priority = queues
            .ready
            .get("mail")
            .and_then(|heap| heap.get(second.id))
            .map(|item| item.priority);
        assert_eq!(heap_priority, Some(50));
    }

    /// Resubmitting over an in-flight job pulls it out of the revert heap
    /// and proc table.
    #[tokio::test]
    async fn resubmit_replaces_processing_job() {
        let sched = scheduler();
        sched
            .submit(job_json("mail", "welcome", r#""timeout":60"#))
            .await
            .unwrap();
        let job = sched.driver().get_by_name("mail", "welcome").await.unwrap();

        let (tx, _rx) = frame_channel();
        let worker = sched.workers().register(tx);
        worker.add_func("mail");
        sched.stats().incr_workers("mail");
        let grabbed = GrabItem {
            worker_id: worker.id,
            msg_id: b"1".to_vec(),
        };
        sched.assign_job(&grabbed, &job).await.unwrap();
        assert_eq!(sched.stats().lines(), vec!["mail,1,1,1"]);

        sched.submit(job_json("mail", "welcome", "")).await.unwrap();

        assert!(!sched.proc_contains(job.id).await);
        assert_eq!(sched.revert_priority(job.id), None);
        assert_eq!(sched.stats().lines(), vec!["mail,1,1,0"]);
        let stored = sched.driver().get(job.id).await.unwrap();
        assert!(stored.is_ready());
    }

    #[tokio::test]
    async fn remove_job_clears_all_structures() {
        let sched = scheduler();
        sched.submit(job_json("mail", "welcome", "")).await.unwrap();
        let job = sched.driver().get_by_name("mail", "welcome").await.unwrap();

        sched.remove("mail", "welcome").await.unwrap();

        assert!(sched.driver().get(job.id).await.is_err());
        assert!(!sched.ready_contains("mail", job.id));
        assert_eq!(sched.stats().lines(), vec!["mail,0,0,0"]);

        // Removing an absent job is an error surfaced to the caller.
        assert!(sched.remove("mail", "welcome").await.is_err());
    }

    #[tokio::test]
    async fn drop_func_without_workers_deletes_jobs() {
        let sched = scheduler();
        sched.submit(job_json("mail", "a", "")).await.unwrap();
        sched.submit(job_json("mail", "b", "")).await.unwrap();
        sched.submit(job_json("print", "c", "")).await.unwrap();

        sched.drop_func("mail").await.unwrap();

        assert!(sched.driver().get_by_name("mail", "a").await.is_err());
        assert!(sched.driver().get_by_name("mail", "b").await.is_err());
        assert!(sched.driver().get_by_name("print", "c").await.is_ok());
        assert_eq!(sched.stats().lines(), vec!["print,0,1,0"]);
    }

    #[tokio::test]
    async fn drop_func_with_workers_keeps_jobs() {
        let sched = scheduler();
        sched.submit(job_json("mail", "a", "")).await.unwrap();
        sched.stats().incr_workers("mail");

        sched.drop_func("mail").await.unwrap();

        assert!(sched.driver().get_by_name("mail", "a").await.is_ok());
        assert_eq!(sched.stats().lines(), vec!["mail,1,1,0"]);
    }

    #[tokio::test]
    async fn worker_death_fails_assigned_jobs() {
        let sched = scheduler();
        sched.submit(job_json("mail", "a", r#""timeout":60"#)).await.unwrap();
        sched.submit(job_json("mail", "b", r#""timeout":60"#)).await.unwrap();
        let a = sched.driver().get_by_name("mail", "a").await.unwrap();
        let b = sched.driver().get_by_name("mail", "b").await.unwrap();

        let (tx, _rx) = frame_channel();
        let worker = sched.workers().register(tx);
        worker.add_func("mail");
        sched.stats().incr_workers("mail");

        for (msg, job) in [(b"1", &a), (b"2", &b)] {
            let grabbed = GrabItem {
                worker_id: worker.id,
                msg_id: msg.to_vec(),
            };
            sched.assign_job(&grabbed, job).await.unwrap();
        }
        assert_eq!(sched.stats().lines(), vec!["mail,1,2,2"]);

        sched.worker_closed(&worker).await;

        assert_eq!(sched.stats().lines(), vec!["mail,0,2,0"]);
        assert!(sched.ready_contains("mail", a.id));
        assert!(sched.ready_contains("mail", b.id));
        assert!(!sched.proc_contains(a.id).await);
        assert!(sched.workers().is_empty());
    }

    #[tokio::test]
    async fn revert_restores_timed_out_job() {
        let sched = scheduler();
        sched
            .submit(job_json("mail", "slow", r#""timeout":1,"sched_at":1"#))
            .await
            .unwrap();
        let job = sched.driver().get_by_name("mail", "slow").await.unwrap();

        let (tx, _rx) = frame_channel();
        let worker = sched.workers().register(tx);
        worker.add_func("mail");
        sched.stats().incr_workers("mail");
        let grabbed = GrabItem {
            worker_id: worker.id,
            msg_id: b"1".to_vec(),
        };
        sched.assign_job(&grabbed, &job).await.unwrap();

        sched.revert_job(job.id).await.unwrap();

        let stored = sched.driver().get(job.id).await.unwrap();
        assert!(stored.is_ready());
        assert!(sched.ready_contains("mail", job.id));
        assert!(!sched.proc_contains(job.id).await);
        assert_eq!(sched.stats().lines(), vec!["mail,1,1,0"]);
    }

    /// Dump → load keeps (func, name, args, sched_at, period) and resets
    /// status to ready.
    #[tokio::test]
    async fn load_restores_dumped_jobs() {
        let sched = scheduler();
        sched
            .submit(job_json("mail", "a", r#""workload":"x","sched_at":7"#))
            .await
            .unwrap();
        sched
            .submit(job_json("clock", "b", r#""period":"every_5m""#))
            .await
            .unwrap();

        let mut dumped = Vec::new();
        {
            let mut stream = sched.driver().iter(None).await.unwrap();
            while let Some(job) = stream.next().await {
                dumped.push(job.unwrap());
            }
        }

        // Into a fresh scheduler, as `load` does after a dump.
        let restored = scheduler();
        restored.load_jobs(dumped.clone()).await.unwrap();

        for job in &dumped {
            let loaded = restored
                .driver()
                .get_by_name(&job.func, &job.name)
                .await
                .unwrap();
            assert_eq!(loaded.id, job.id);
            assert_eq!(loaded.args, job.args);
            assert_eq!(loaded.sched_at, job.sched_at);
            assert_eq!(loaded.period, job.period);
            assert!(loaded.is_ready());
        }
        assert_eq!(
            restored.stats().lines(),
            vec!["clock,0,1,0", "mail,0,1,0"]
        );
    }

    #[tokio::test]
    async fn restore_rebuilds_state_from_store() {
        let driver: Arc<dyn Driver> = Arc::new(MemoryDriver::new());

        // Seed: one ready job, one expired in-flight job, one tombstone.
        let mut ready = job_json("mail", "a", "");
        driver.save(&mut ready, false).await.unwrap();

        let mut expired = job_json("mail", "b", r#""timeout":1"#);
        expired.set_processing();
        expired.run_at = unix_now() - 100;
        driver.save(&mut expired, false).await.unwrap();

        let mut tombstone = job_json("mail", "", "");
        driver.save(&mut tombstone, false).await.unwrap();

        let sched = Scheduler::new(driver, None, CancellationToken::new());
        sched.restore().await.unwrap();

        assert!(sched.ready_contains("mail", ready.id));
        assert!(sched.ready_contains("mail", expired.id));
        assert!(sched.driver().get(tombstone.id).await.is_err());
        let reverted = sched.driver().get(expired.id).await.unwrap();
        assert!(reverted.is_ready());
        assert_eq!(sched.stats().lines(), vec!["mail,0,2,0"]);
    }

    #[tokio::test]
    async fn cache_invalidated_by_earlier_push() {
        let sched = scheduler();
        sched
            .submit(job_json("mail", "late", r#""sched_at":1000"#))
            .await
            .unwrap();
        let late = sched.driver().get_by_name("mail", "late").await.unwrap();

        let (tx, _rx) = frame_channel();
        let worker = sched.workers().register(tx);
        worker.add_func("mail");
        sched.grab_job(GrabItem {
            worker_id: worker.id,
            msg_id: b"1".to_vec(),
        });

        // Select and cache the only candidate.
        let selected = sched.next_ready_item().unwrap();
        assert_eq!(selected.item.value, late.id);

        // An earlier job displaces the cache.
        sched
            .submit(job_json("mail", "early", r#""sched_at":5"#))
            .await
            .unwrap();
        let early = sched.driver().get_by_name("mail", "early").await.unwrap();

        let reselected = sched.next_ready_item().unwrap();
        assert_eq!(reselected.item.value, early.id);
    }

    #[tokio::test]
    async fn cache_cleared_when_func_dropped() {
        let sched = scheduler();
        sched.submit(job_json("mail", "a", r#""sched_at":1000"#)).await.unwrap();

        let (tx, _rx) = frame_channel();
        let worker = sched.workers().register(tx);
        worker.add_func("mail");
        sched.grab_job(GrabItem {
            worker_id: worker.id,
            msg_id: b"1".to_vec(),
        });
        assert!(sched.next_ready_item().is_some());

        // Drop the function out from under the cache; CANT_DO withdraws the
        // advertisement so the drop is allowed to delete.
        worker.remove_func("mail");
        sched.drop_func("mail").await.unwrap();

        assert!(sched.next_ready_item().is_none());
    }
}
