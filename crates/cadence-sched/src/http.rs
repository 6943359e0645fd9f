//! HTTP façade.
//!
//! A thin adapter over the same scheduler entry points the binary protocol
//! uses. The listener sniffs the first bytes of each connection; when they
//! spell an HTTP method the connection lands here, with the sniffed prefix
//! replayed in front of the stream.
//!
//! Routes:
//! - `GET /{func?}`: per-function counters as JSON
//! - `POST /{func?}`: submit a job from form fields, or remove with
//!   `act=remove`
//! - `DELETE /{func}`: drop a function

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use cadence_proto::Job;

use crate::sched::Scheduler;
use crate::stats::StatSnapshot;
use crate::transport::Connection;

/// Serves HTTP on an accepted connection whose first bytes were sniffed.
pub async fn serve(sched: Arc<Scheduler>, prefix: Vec<u8>, conn: Box<dyn Connection>) {
    let io = TokioIo::new(Rewind::new(prefix, conn));
    let service = service_fn(move |req| {
        let sched = Arc::clone(&sched);
        async move { Ok::<_, std::convert::Infallible>(handle(sched, req).await) }
    });

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .await
    {
        debug!(error = %e, "http connection closed with error");
    }
}

async fn handle(sched: Arc<Scheduler>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let func = req.uri().path().trim_start_matches('/').to_owned();

    match req.method() {
        &Method::GET => handle_status(&sched, &func),
        &Method::POST => {
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => return json_err(&e.to_string()),
            };
            let form: SubmitForm = match serde_urlencoded::from_bytes(&body) {
                Ok(form) => form,
                Err(e) => return json_err(&e.to_string()),
            };
            if form.act.eq_ignore_ascii_case("remove") {
                handle_remove(&sched, &func, form).await
            } else {
                handle_submit(&sched, &func, form).await
            }
        }
        &Method::DELETE => handle_drop(&sched, &func).await,
        _ => json_err("bad request"),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SubmitForm {
    act: String,
    func: String,
    name: String,
    args: String,
    timeout: String,
    sched_at: String,
    period: String,
    fail_retry: String,
}

fn handle_status(sched: &Scheduler, func: &str) -> Response<Full<Bytes>> {
    let stats: HashMap<String, StatSnapshot> = sched
        .stats()
        .snapshot()
        .into_iter()
        .map(|s| (s.func_name.clone(), s))
        .collect();

    let body = if func.is_empty() {
        serde_json::to_vec(&stats)
    } else {
        match stats.get(func) {
            Some(stat) => serde_json::to_vec(stat),
            None => Ok(b"{}".to_vec()),
        }
    };

    match body {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => json_err(&e.to_string()),
    }
}

async fn handle_submit(
    sched: &Scheduler,
    path_func: &str,
    form: SubmitForm,
) -> Response<Full<Bytes>> {
    let func = if path_func.is_empty() {
        form.func.as_str()
    } else {
        path_func
    };
    if form.name.is_empty() || func.is_empty() {
        return json_err("job name or func is required");
    }

    let raw = serde_json::json!({
        "name": form.name,
        "func": func,
        "workload": form.args,
        "timeout": parse_i64(&form.timeout),
        "sched_at": parse_i64(&form.sched_at),
        "period": form.period,
        "fail_retry": parse_i64(&form.fail_retry),
    });
    let job = match Job::from_json(raw.to_string().as_bytes()) {
        Ok(job) => job,
        Err(e) => return json_err(&e.to_string()),
    };

    match sched.submit(job).await {
        Ok(()) => json_msg("SUCCESS"),
        Err(e) => json_err(&e.to_string()),
    }
}

async fn handle_remove(
    sched: &Scheduler,
    path_func: &str,
    form: SubmitForm,
) -> Response<Full<Bytes>> {
    let func = if path_func.is_empty() {
        form.func.as_str()
    } else {
        path_func
    };
    match sched.remove(func, &form.name).await {
        Ok(()) => json_msg("SUCCESS"),
        Err(e) => json_err(&e.to_string()),
    }
}

async fn handle_drop(sched: &Scheduler, func: &str) -> Response<Full<Bytes>> {
    if func.is_empty() {
        return json_err("func is required");
    }
    match sched.drop_func(func).await {
        Ok(()) => json_msg("SUCCESS"),
        Err(e) => json_err(&e.to_string()),
    }
}

fn parse_i64(s: &str) -> i64 {
    s.trim().parse().unwrap_or(0)
}

fn json_msg(msg: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        serde_json::json!({ "msg": msg }).to_string().into_bytes(),
    )
}

fn json_err(err: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({ "err": err }).to_string().into_bytes(),
    )
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// Replays sniffed bytes in front of a connection.
struct Rewind {
    prefix: Vec<u8>,
    offset: usize,
    inner: Box<dyn Connection>,
}

impl Rewind {
    fn new(prefix: Vec<u8>, inner: Box<dyn Connection>) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl AsyncRead for Rewind {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            self.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Rewind {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn rewind_replays_prefix_first() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("rw.sock");
        let listener = tokio::net::UnixListener::bind(&sock).unwrap();

        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b" world").await.unwrap();
        });

        let conn = tokio::net::UnixStream::connect(&sock).await.unwrap();
        let mut rewind = Rewind::new(b"hello".to_vec(), Box::new(conn));

        let mut buf = vec![0u8; 11];
        rewind.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");

        writer.await.unwrap();
    }
}
