//! redb-backed job store.
//!
//! Jobs are JSON-serialised into a `&[u8]` value column keyed by id. A second
//! table maps `func ␀ name` to the id, and a meta table carries the id
//! counter so that assignment survives restarts.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use cadence_proto::Job;
use futures::stream;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::driver::{Driver, JobStream};
use crate::error::{Result, StoreError};

const JOBS: TableDefinition<i64, &[u8]> = TableDefinition::new("jobs");
const NAMES: TableDefinition<&str, i64> = TableDefinition::new("job_names");
const META: TableDefinition<&str, i64> = TableDefinition::new("meta");

const NEXT_ID_KEY: &str = "next_id";

fn name_key(func: &str, name: &str) -> String {
    format!("{func}\u{0}{name}")
}

fn map_db<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Persistent job store backed by redb.
pub struct RedbDriver {
    db: Arc<Database>,
}

impl RedbDriver {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(map_db)?;
        let driver = Self { db: Arc::new(db) };
        driver.ensure_tables()?;
        debug!(?path, "job store opened");
        Ok(driver)
    }

    /// Creates an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_db)?;
        let driver = Self { db: Arc::new(db) };
        driver.ensure_tables()?;
        Ok(driver)
    }

    fn ensure_tables(&self) -> Result<()> {
        let txn = self.db.begin_write().map_err(map_db)?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(JOBS).map_err(map_db)?;
        txn.open_table(NAMES).map_err(map_db)?;
        txn.open_table(META).map_err(map_db)?;
        txn.commit().map_err(map_db)?;
        Ok(())
    }

    fn read_job(&self, id: i64) -> Result<Job> {
        let txn = self.db.begin_read().map_err(map_db)?;
        let table = txn.open_table(JOBS).map_err(map_db)?;
        match table.get(id).map_err(map_db)? {
            Some(guard) => decode_job(guard.value()),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

fn decode_job(bytes: &[u8]) -> Result<Job> {
    let mut job: Job = serde_json::from_slice(bytes)?;
    // Periods were validated on the way in.
    job.init()
        .map_err(|e| StoreError::Database(e.to_string()))?;
    Ok(job)
}

#[async_trait]
impl Driver for RedbDriver {
    async fn get(&self, id: i64) -> Result<Job> {
        self.read_job(id)
    }

    async fn get_by_name(&self, func: &str, name: &str) -> Result<Job> {
        let id = {
            let txn = self.db.begin_read().map_err(map_db)?;
            let table = txn.open_table(NAMES).map_err(map_db)?;
            table
                .get(name_key(func, name).as_str())
                .map_err(map_db)?
                .map(|guard| guard.value())
        };
        match id {
            Some(id) => self.read_job(id),
            None => Err(StoreError::NameNotFound {
                func: func.to_owned(),
                name: name.to_owned(),
            }),
        }
    }

    async fn save(&self, job: &mut Job, keep_id: bool) -> Result<()> {
        let txn = self.db.begin_write().map_err(map_db)?;
        {
            let mut meta = txn.open_table(META).map_err(map_db)?;
            let next = meta
                .get(NEXT_ID_KEY)
                .map_err(map_db)?
                .map_or(1, |guard| guard.value());

            if job.id == 0 {
                job.id = next;
                meta.insert(NEXT_ID_KEY, next + 1).map_err(map_db)?;
            } else if keep_id && job.id >= next {
                meta.insert(NEXT_ID_KEY, job.id + 1).map_err(map_db)?;
            }

            let mut jobs = txn.open_table(JOBS).map_err(map_db)?;
            let mut names = txn.open_table(NAMES).map_err(map_db)?;

            // Drop a stale index entry when the job was renamed.
            let old_key = jobs
                .get(job.id)
                .map_err(map_db)?
                .map(|guard| decode_job(guard.value()))
                .transpose()?
                .map(|old| name_key(&old.func, &old.name));
            if let Some(old_key) = old_key {
                let new_key = name_key(&job.func, &job.name);
                if old_key != new_key {
                    names.remove(old_key.as_str()).map_err(map_db)?;
                }
            }

            let bytes = serde_json::to_vec(job)?;
            jobs.insert(job.id, bytes.as_slice()).map_err(map_db)?;
            names
                .insert(name_key(&job.func, &job.name).as_str(), job.id)
                .map_err(map_db)?;
        }
        txn.commit().map_err(map_db)?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let txn = self.db.begin_write().map_err(map_db)?;
        {
            let mut jobs = txn.open_table(JOBS).map_err(map_db)?;
            let removed = jobs
                .remove(id)
                .map_err(map_db)?
                .map(|guard| decode_job(guard.value()))
                .transpose()?;
            if let Some(job) = removed {
                let mut names = txn.open_table(NAMES).map_err(map_db)?;
                let key = name_key(&job.func, &job.name);
                let current = names
                    .get(key.as_str())
                    .map_err(map_db)?
                    .map(|guard| guard.value());
                if current == Some(id) {
                    names.remove(key.as_str()).map_err(map_db)?;
                }
            }
        }
        txn.commit().map_err(map_db)?;
        Ok(())
    }

    async fn iter(&self, func: Option<&str>) -> Result<JobStream> {
        let txn = self.db.begin_read().map_err(map_db)?;
        let names = txn.open_table(NAMES).map_err(map_db)?;
        let jobs = txn.open_table(JOBS).map_err(map_db)?;

        // The name index is ordered by `func ␀ name`, which gives the
        // per-function iteration order the broker expects.
        let mut collected = Vec::new();
        let bounds = func.map(|f| (format!("{f}\u{0}"), format!("{f}\u{1}")));
        let range = match &bounds {
            Some((start, end)) => names
                .range(start.as_str()..end.as_str())
                .map_err(map_db)?,
            None => names.iter().map_err(map_db)?,
        };

        for entry in range {
            let (_, id_guard) = entry.map_err(map_db)?;
            let id = id_guard.value();
            if let Some(guard) = jobs.get(id).map_err(map_db)? {
                collected.push(decode_job(guard.value()));
            }
        }

        Ok(Box::pin(stream::iter(collected)))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for RedbDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbDriver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn make_job(func: &str, name: &str) -> Job {
        Job::from_json(
            format!(r#"{{"func":"{func}","name":"{name}"}}"#).as_bytes(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn save_get_delete() {
        let store = RedbDriver::open_in_memory().unwrap();
        let mut job = make_job("mail", "welcome");
        job.args = "hello".to_owned();

        store.save(&mut job, false).await.unwrap();
        assert!(job.id > 0);

        let loaded = store.get(job.id).await.unwrap();
        assert_eq!(loaded.args, "hello");
        assert_eq!(loaded.func, "mail");

        store.delete(job.id).await.unwrap();
        assert!(store.get(job.id).await.is_err());
        assert!(store.get_by_name("mail", "welcome").await.is_err());
    }

    #[tokio::test]
    async fn id_counter_survives_keep_id() {
        let store = RedbDriver::open_in_memory().unwrap();

        let mut imported = make_job("f", "imported");
        imported.id = 100;
        store.save(&mut imported, true).await.unwrap();

        let mut fresh = make_job("f", "fresh");
        store.save(&mut fresh, false).await.unwrap();
        assert_eq!(fresh.id, 101);
    }

    #[tokio::test]
    async fn iter_is_ordered_by_func() {
        let store = RedbDriver::open_in_memory().unwrap();
        for (func, name) in [("zeta", "1"), ("alpha", "2"), ("zeta", "3"), ("mid", "4")] {
            let mut job = make_job(func, name);
            store.save(&mut job, false).await.unwrap();
        }

        let all: Vec<Job> = store
            .iter(None)
            .await
            .unwrap()
            .map(|j| j.unwrap())
            .collect()
            .await;
        let funcs: Vec<&str> = all.iter().map(|j| j.func.as_str()).collect();
        assert_eq!(funcs, ["alpha", "mid", "zeta", "zeta"]);

        let only: Vec<Job> = store
            .iter(Some("zeta"))
            .await
            .unwrap()
            .map(|j| j.unwrap())
            .collect()
            .await;
        assert_eq!(only.len(), 2);
    }

    #[tokio::test]
    async fn reopen_preserves_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.redb");

        {
            let store = RedbDriver::open(&path).unwrap();
            let mut job = make_job("f", "persistent");
            store.save(&mut job, false).await.unwrap();
        }

        let store = RedbDriver::open(&path).unwrap();
        let job = store.get_by_name("f", "persistent").await.unwrap();
        assert_eq!(job.name, "persistent");

        // Counter also survives.
        let mut fresh = make_job("f", "next");
        store.save(&mut fresh, false).await.unwrap();
        assert_eq!(fresh.id, 2);
    }
}
