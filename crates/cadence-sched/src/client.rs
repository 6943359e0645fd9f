//! Client sessions.
//!
//! A client connection drives the scheduler's store-mutating entry points
//! and owns both halves of its connection: replies are written inline from
//! the read loop.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cadence_proto::{codec, Command, Job, Message};

use crate::error::Result;
use crate::sched::Scheduler;
use crate::transport::Connection;

/// Jobs per DUMP batch frame.
const DUMP_BATCH: usize = 100;

/// Envelope for DUMP batches and LOAD payloads.
#[derive(Debug, Serialize, Deserialize)]
struct JobList {
    jobs: Vec<Job>,
}

/// One client connection's command loop.
pub struct ClientSession {
    sched: Arc<Scheduler>,
    conn: Box<dyn Connection>,
}

impl ClientSession {
    /// Creates a session over an accepted connection.
    #[must_use]
    pub fn new(sched: Arc<Scheduler>, conn: Box<dyn Connection>) -> Self {
        Self { sched, conn }
    }

    /// Runs the command loop until disconnect or a fatal session error.
    pub async fn run(&mut self) {
        loop {
            let body = match self.sched.read_session_frame(&mut self.conn).await {
                Ok(body) => body,
                Err(e) => {
                    if !e.is_closed() {
                        warn!(error = %e, "client read failed");
                    }
                    return;
                }
            };

            let message = match Message::parse(&body) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "bad client frame");
                    continue;
                }
            };

            if let Err(e) = self.dispatch(message).await {
                if !matches!(&e, crate::error::SchedError::Protocol(p) if p.is_closed()) {
                    warn!(error = %e, "client command failed");
                }
                return;
            }
        }
    }

    async fn dispatch(&mut self, message: Message) -> Result<()> {
        match message.command {
            Command::SubmitJob => self.handle_submit(&message).await,
            Command::Status => self.handle_status(&message).await,
            Command::Ping => self.reply(&message.msg_id, Command::Pong).await,
            Command::DropFunc => self.handle_drop(&message).await,
            Command::RemoveJob => self.handle_remove(&message).await,
            Command::Dump => self.handle_dump(&message).await,
            Command::Load => self.handle_load(&message).await,
            other => {
                debug!(command = %other, "unknown client command");
                self.reply(&message.msg_id, Command::Unknown).await
            }
        }
    }

    async fn handle_submit(&mut self, message: &Message) -> Result<()> {
        let job = match Job::from_json(&message.payload) {
            Ok(job) => job,
            Err(e) => return self.reply_error(&message.msg_id, &e.to_string()).await,
        };
        match self.sched.submit(job).await {
            Ok(()) => self.reply(&message.msg_id, Command::Success).await,
            Err(e) => self.reply_error(&message.msg_id, &e.to_string()).await,
        }
    }

    async fn handle_status(&mut self, message: &Message) -> Result<()> {
        let mut body = self.sched.stats().lines().join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        self.reply_raw(&message.msg_id, body.as_bytes()).await
    }

    async fn handle_drop(&mut self, message: &Message) -> Result<()> {
        let func = String::from_utf8_lossy(&message.payload).into_owned();
        match self.sched.drop_func(&func).await {
            Ok(()) => self.reply(&message.msg_id, Command::Success).await,
            Err(e) => self.reply_error(&message.msg_id, &e.to_string()).await,
        }
    }

    async fn handle_remove(&mut self, message: &Message) -> Result<()> {
        let job = match Job::from_json(&message.payload) {
            Ok(job) => job,
            Err(e) => return self.reply_error(&message.msg_id, &e.to_string()).await,
        };
        match self.sched.remove(&job.func, &job.name).await {
            Ok(()) => self.reply(&message.msg_id, Command::Success).await,
            Err(e) => self.reply_error(&message.msg_id, &e.to_string()).await,
        }
    }

    /// Streams every named job in batches, terminated by an EOF frame.
    async fn handle_dump(&mut self, message: &Message) -> Result<()> {
        let mut batch = Vec::with_capacity(DUMP_BATCH);
        {
            let mut stream = self.sched.driver().iter(None).await?;
            while let Some(job) = stream.next().await {
                let job = job?;
                if job.name.is_empty() {
                    continue;
                }
                batch.push(job);
                if batch.len() == DUMP_BATCH {
                    self.send_job_list(&message.msg_id, std::mem::take(&mut batch))
                        .await?;
                }
            }
        }
        if !batch.is_empty() {
            self.send_job_list(&message.msg_id, batch).await?;
        }
        self.reply_raw(&message.msg_id, b"EOF").await
    }

    async fn send_job_list(&mut self, msg_id: &[u8], jobs: Vec<Job>) -> Result<()> {
        let payload = serde_json::to_vec(&JobList { jobs })
            .map_err(cadence_proto::ProtocolError::from)?;
        self.reply_raw(msg_id, &payload).await
    }

    async fn handle_load(&mut self, message: &Message) -> Result<()> {
        let list: JobList = match serde_json::from_slice(&message.payload) {
            Ok(list) => list,
            Err(e) => return self.reply_error(&message.msg_id, &e.to_string()).await,
        };
        self.sched.load_jobs(list.jobs).await?;
        Ok(())
    }

    async fn reply(&mut self, msg_id: &[u8], command: Command) -> Result<()> {
        let body = Message::encode_reply(msg_id, command);
        codec::write_frame(&mut self.conn, &body).await?;
        Ok(())
    }

    async fn reply_raw(&mut self, msg_id: &[u8], payload: &[u8]) -> Result<()> {
        let body = Message::encode_raw(msg_id, payload);
        codec::write_frame(&mut self.conn, &body).await?;
        Ok(())
    }

    async fn reply_error(&mut self, msg_id: &[u8], text: &str) -> Result<()> {
        debug!(error = text, "client request rejected");
        self.reply_raw(msg_id, text.as_bytes()).await
    }
}
