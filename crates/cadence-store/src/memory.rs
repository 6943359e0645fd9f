use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use cadence_proto::Job;
use futures::stream;

use crate::driver::{Driver, JobStream};
use crate::error::{Result, StoreError};

#[derive(Debug, Default)]
struct Inner {
    jobs: BTreeMap<i64, Job>,
    index: HashMap<(String, String), i64>,
}

/// In-memory job store.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    inner: Mutex<Inner>,
    next_id: AtomicI64,
}

impl MemoryDriver {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicI64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn get(&self, id: i64) -> Result<Job> {
        self.lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn get_by_name(&self, func: &str, name: &str) -> Result<Job> {
        let inner = self.lock();
        let id = inner
            .index
            .get(&(func.to_owned(), name.to_owned()))
            .copied()
            .ok_or_else(|| StoreError::NameNotFound {
                func: func.to_owned(),
                name: name.to_owned(),
            })?;
        inner
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn save(&self, job: &mut Job, keep_id: bool) -> Result<()> {
        let mut inner = self.lock();
        if job.id == 0 {
            job.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        } else if keep_id {
            // Keep the id counter ahead of re-ingested ids.
            self.next_id.fetch_max(job.id + 1, Ordering::SeqCst);
        }

        // Drop a stale index entry when the job was renamed.
        if let Some(old) = inner.jobs.get(&job.id) {
            if old.func != job.func || old.name != job.name {
                let key = (old.func.clone(), old.name.clone());
                inner.index.remove(&key);
            }
        }

        inner
            .index
            .insert((job.func.clone(), job.name.clone()), job.id);
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.remove(&id) {
            let key = (job.func.clone(), job.name.clone());
            if inner.index.get(&key) == Some(&id) {
                inner.index.remove(&key);
            }
        }
        Ok(())
    }

    async fn iter(&self, func: Option<&str>) -> Result<JobStream> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| func.is_none_or(|f| j.func == f))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.func.cmp(&b.func).then(a.id.cmp(&b.id)));
        Ok(Box::pin(stream::iter(jobs.into_iter().map(Ok))))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
