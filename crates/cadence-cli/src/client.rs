//! Protocol client used by the CLI subcommands.

use cadence_proto::{codec, Command, Job, NULL_CHAR, TYPE_CLIENT};
use cadence_sched::transport::{Connection, ListenAddr};
use serde::Deserialize;
use thiserror::Error;

/// CLI client errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Broker address could not be parsed or reached.
    #[error("{0}")]
    Connect(#[from] cadence_sched::SchedError),

    /// Wire protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] cadence_proto::ProtocolError),

    /// The broker rejected a request.
    #[error("broker error: {0}")]
    Rejected(String),

    /// Malformed reply or dump payload.
    #[error("bad reply: {0}")]
    BadReply(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Deserialize)]
struct JobList {
    jobs: Vec<Job>,
}

/// A connected protocol client.
pub struct Client {
    conn: Box<dyn Connection>,
    next_id: u64,
}

impl Client {
    /// Connects to the broker and identifies as a client.
    pub async fn connect(host: &str) -> Result<Self> {
        let addr: ListenAddr = host.parse()?;
        let mut conn = addr.connect().await?;
        codec::write_frame(&mut conn, &[TYPE_CLIENT]).await?;
        Ok(Self { conn, next_id: 0 })
    }

    async fn send(&mut self, command: Command, payload: Option<&[u8]>) -> Result<Vec<u8>> {
        self.next_id += 1;
        let msg_id = self.next_id.to_string().into_bytes();
        let body = match payload {
            Some(payload) => cadence_proto::Message::encode(&msg_id, command, payload),
            None => cadence_proto::Message::encode_reply(&msg_id, command),
        };
        codec::write_frame(&mut self.conn, &body).await?;
        Ok(msg_id)
    }

    /// Reads one reply frame and strips the msg_id prefix.
    async fn read_reply(&mut self) -> Result<Vec<u8>> {
        let body = codec::read_frame(&mut self.conn).await?;
        let sep = body
            .iter()
            .position(|&b| b == NULL_CHAR)
            .ok_or_else(|| ClientError::BadReply("missing msg_id separator".to_owned()))?;
        Ok(body[sep + 1..].to_vec())
    }

    async fn expect_success(&mut self) -> Result<()> {
        let reply = self.read_reply().await?;
        if reply.as_slice() == [Command::Success.as_u8()] {
            Ok(())
        } else {
            Err(ClientError::Rejected(
                String::from_utf8_lossy(&reply).into_owned(),
            ))
        }
    }

    /// Submits a job.
    pub async fn submit(&mut self, job: &Job) -> Result<()> {
        let payload = job.to_json()?;
        self.send(Command::SubmitJob, Some(&payload)).await?;
        self.expect_success().await
    }

    /// Removes a job by (func, name).
    pub async fn remove(&mut self, job: &Job) -> Result<()> {
        let payload = job.to_json()?;
        self.send(Command::RemoveJob, Some(&payload)).await?;
        self.expect_success().await
    }

    /// Drops a function and its jobs.
    pub async fn drop_func(&mut self, func: &str) -> Result<()> {
        self.send(Command::DropFunc, Some(func.as_bytes())).await?;
        self.expect_success().await
    }

    /// Fetches the per-function status table.
    pub async fn status(&mut self) -> Result<String> {
        self.send(Command::Status, None).await?;
        let reply = self.read_reply().await?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// Pings the broker.
    pub async fn ping(&mut self) -> Result<bool> {
        self.send(Command::Ping, None).await?;
        let reply = self.read_reply().await?;
        Ok(reply.as_slice() == [Command::Pong.as_u8()])
    }

    /// Downloads every job; batches arrive until an EOF frame.
    pub async fn dump(&mut self) -> Result<Vec<Job>> {
        self.send(Command::Dump, None).await?;
        let mut jobs = Vec::new();
        loop {
            let reply = self.read_reply().await?;
            if reply.as_slice() == b"EOF" {
                return Ok(jobs);
            }
            let batch: JobList = serde_json::from_slice(&reply)
                .map_err(|e| ClientError::BadReply(e.to_string()))?;
            jobs.extend(batch.jobs);
        }
    }

    /// Uploads a dump for re-ingestion. The broker sends no reply.
    pub async fn load(&mut self, payload: &[u8]) -> Result<()> {
        self.send(Command::Load, Some(payload)).await?;
        Ok(())
    }
}
