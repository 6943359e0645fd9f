//! Broker server: listener, connection sniffing and session lifecycle.
//!
//! Every accepted connection starts with a 4-byte sniff. HTTP method bytes
//! divert to the façade; anything else is the length prefix of the first
//! frame, whose single byte names the session type (client or worker).

use std::sync::Arc;

use futures::FutureExt;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cadence_proto::{codec, is_http_prefix, TYPE_CLIENT, TYPE_WORKER};
use cadence_store::Driver;

use crate::client::ClientSession;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::http;
use crate::sched::Scheduler;
use crate::transport::{Connection, ListenAddr};
use crate::worker::{self, WorkerSession};

/// The broker server.
pub struct Server {
    sched: Arc<Scheduler>,
    listen: ListenAddr,
    shutdown: CancellationToken,
}

impl Server {
    /// Builds a server from configuration and a store driver.
    pub fn new(
        config: &ServerConfig,
        driver: Arc<dyn Driver>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listen: ListenAddr = config.listen.url.parse()?;
        let sched = Scheduler::new(driver, config.deadline(), shutdown.clone());
        Ok(Self {
            sched,
            listen,
            shutdown,
        })
    }

    /// The scheduler engine, for in-process access.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Binds the listener and serves until cancellation.
    ///
    /// Returns early only on listener errors; session errors close their
    /// own connection.
    pub async fn serve(&self) -> Result<()> {
        let listener = self.listen.bind().await?;
        self.sched.restore().await?;
        self.sched.start();
        info!(addr = %listener.local_addr(), "broker listening");

        loop {
            let conn = tokio::select! {
                accepted = listener.accept() => accepted?,
                () = self.shutdown.cancelled() => break,
            };
            let sched = Arc::clone(&self.sched);
            tokio::spawn(handle_connection(sched, conn));
        }

        self.sched.close().await?;
        info!("broker stopped");
        Ok(())
    }
}

async fn handle_connection(sched: Arc<Scheduler>, mut conn: Box<dyn Connection>) {
    let mut sniff = [0u8; 4];
    if let Err(e) = conn.read_exact(&mut sniff).await {
        debug!(error = %e, "connection closed before handshake");
        return;
    }

    if is_http_prefix(&sniff) {
        http::serve(sched, sniff.to_vec(), conn).await;
        return;
    }

    let first = match codec::read_frame_body(&mut conn, u32::from_be_bytes(sniff)).await {
        Ok(first) => first,
        Err(e) => {
            debug!(error = %e, "handshake frame read failed");
            return;
        }
    };

    match first.first().copied() {
        Some(TYPE_CLIENT) => {
            debug!("client connected");
            let mut session = ClientSession::new(sched, conn);
            if std::panic::AssertUnwindSafe(session.run())
                .catch_unwind()
                .await
                .is_err()
            {
                warn!("client session panicked");
            }
        }
        Some(TYPE_WORKER) => run_worker(sched, conn).await,
        other => warn!(first_byte = ?other, "unknown connection type"),
    }
}

/// Runs a worker session with its writer task, then death cleanup.
///
/// Cleanup runs on every exit path, including a panicking session, so a
/// dead worker never keeps grab items or in-flight jobs.
async fn run_worker(sched: Arc<Scheduler>, conn: Box<dyn Connection>) {
    let (mut reader, mut writer) = tokio::io::split(conn);
    let (sender, receiver) = worker::frame_channel();
    let handle = sched.workers().register(sender);
    debug!(worker_id = handle.id, "worker connected");

    let writer_task = tokio::spawn(async move {
        worker::run_writer(receiver, &mut writer).await;
    });

    let session = WorkerSession::new(Arc::clone(&sched), Arc::clone(&handle));
    if std::panic::AssertUnwindSafe(session.run(&mut reader))
        .catch_unwind()
        .await
        .is_err()
    {
        warn!(worker_id = handle.id, "worker session panicked");
    }

    sched.worker_closed(&handle).await;
    writer_task.abort();
}
