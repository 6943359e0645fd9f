use async_trait::async_trait;
use cadence_proto::Job;
use futures::stream::BoxStream;

use crate::error::Result;

/// Stream of jobs produced by [`Driver::iter`]. Single-use; dropping it
/// releases any underlying cursor.
pub type JobStream = BoxStream<'static, Result<Job>>;

/// A persistent job store.
///
/// The broker re-reads the store whenever authoritative job state is needed;
/// drivers must be safe for concurrent access. No transactional guarantees
/// are required beyond per-operation atomicity.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Fetches a job by id.
    async fn get(&self, id: i64) -> Result<Job>;

    /// Fetches a job by its unique `(func, name)` key.
    async fn get_by_name(&self, func: &str, name: &str) -> Result<Job>;

    /// Persists a job, assigning an id when it has none.
    ///
    /// With `keep_id` set, the job's existing id is preserved (dump
    /// re-ingestion); the id counter is advanced past it.
    async fn save(&self, job: &mut Job, keep_id: bool) -> Result<()>;

    /// Deletes a job by id. Deleting an absent id is not an error.
    async fn delete(&self, id: i64) -> Result<()>;

    /// Iterates jobs ordered by function, optionally limited to one function.
    async fn iter(&self, func: Option<&str>) -> Result<JobStream>;

    /// Flushes and releases the store.
    async fn close(&self) -> Result<()>;
}
