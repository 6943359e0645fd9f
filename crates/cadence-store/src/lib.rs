//! Storage drivers for the Cadence task broker.
//!
//! The broker holds its scheduling state in memory; the store is the durable
//! record of every job. Drivers implement [`Driver`]:
//!
//! - [`MemoryDriver`]: process-local maps, for tests and ephemeral brokers
//! - [`RedbDriver`]: embedded key-value store on disk
//!
//! Jobs are keyed by a store-assigned numeric id with a secondary unique
//! `(func, name)` index. Iteration is ordered by function so that dumps and
//! per-function scans are sequential.

mod driver;
mod error;
mod memory;
mod redb_driver;

pub use driver::{Driver, JobStream};
pub use error::{Result, StoreError};
pub use memory::MemoryDriver;
pub use redb_driver::RedbDriver;
