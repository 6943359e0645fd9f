//! Cadence broker - the scheduler core and its server.
//!
//! The broker accepts jobs from clients, dispatches them to workers that
//! registered for the matching function, retries on failure or timeout, and
//! re-arms periodic jobs from a cron expression or fixed interval. Clients
//! never execute work; workers pull it.
//!
//! # Architecture
//!
//! - [`sched::Scheduler`] keeps per-function ready heaps, a global revert
//!   heap of in-flight deadlines, the proc table and the grab queue
//!   consistent with the store
//! - two dispatcher tasks drain the ready and revert heaps on notify-driven
//!   timers with a one-minute wait ceiling
//! - [`server::Server`] accepts connections, sniffs the first bytes and
//!   installs a client session, worker session or the HTTP façade
//!
//! # Example
//!
//! ```ignore
//! use cadence_sched::{Server, ServerConfig};
//!
//! let config = ServerConfig::default();
//! let server = Server::new(&config, driver, shutdown)?;
//! server.serve().await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod grab;
pub mod http;
pub mod queue;
pub mod sched;
pub mod server;
pub mod stats;
pub mod transport;
pub mod worker;

// Re-export main types
pub use config::{DriverKind, ListenConfig, ServerConfig, StoreConfig};
pub use error::{Result, SchedError};
pub use sched::Scheduler;
pub use server::Server;
