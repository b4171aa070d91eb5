//! Server-side correlation controller.
//!
//! Owns one [`TunnelConnection`] per target id and turns the shared duplex
//! channel into independent synchronous calls. Every call registers a
//! single-use response slot under a fresh request id before its request is
//! queued; the connection's read loop routes each response to its slot by id.

use std::collections::HashMap;
use std::fmt::Display;
use std::time::{Duration, Instant};

use fdxtunnel_shared::protocol::{self, DEFAULT_CALL_TIMEOUT, DEFAULT_QUEUE_CAPACITY};
use fdxtunnel_shared::{Error, Registry, RequestMessage, ResponseMessage, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::TunnelConnection;
use crate::metrics::{CallOutcome, Metrics};

/// Single-use slot a waiting call receives its response on
type PendingSlot = oneshot::Sender<ResponseMessage>;

/// Removes a call's pending slot however the call ends, including when the
/// caller drops the `call_api` future before it completes.
struct PendingGuard {
    pending: Registry<PendingSlot>,
    reqid: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.delete(&self.reqid);
    }
}

/// Tunables for a [`ServerController`]
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Upper bound for a call, covering both queueing and the wait
    pub call_timeout: Duration,
    /// Capacity of each target's outbound request queue
    pub queue_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Result of a call answered by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl From<ResponseMessage> for CallResponse {
    fn from(msg: ResponseMessage) -> Self {
        Self {
            status: msg.status,
            headers: msg.headers,
            body: msg.body,
        }
    }
}

#[derive(Clone)]
pub struct ServerController {
    tunnels: Registry<TunnelConnection>,
    pending: Registry<PendingSlot>,
    metrics: Metrics,
    options: ServerOptions,
}

impl ServerController {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            tunnels: Registry::new(),
            pending: Registry::new(),
            metrics: Metrics::new(),
            options,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn is_registered(&self, target_id: &str) -> bool {
        self.tunnels.contains(target_id)
    }

    /// Number of calls currently waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Take ownership of an established channel for `target_id` and start
    /// its read and write loops.
    ///
    /// A target id that already has an active connection is rejected and the
    /// existing connection is left untouched.
    pub fn register<W, R, E>(&self, target_id: &str, sink: W, stream: R) -> Result<()>
    where
        W: Sink<String> + Send + Unpin + 'static,
        W::Error: Display + Send,
        R: Stream<Item = std::result::Result<String, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        if target_id.is_empty() {
            warn!("no target address found for this call");
            return Err(Error::Tunnel("no target address found for this call".into()));
        }

        let (conn, rx) = TunnelConnection::new(target_id.to_string(), self.options.queue_capacity);
        if self.tunnels.insert_if_absent(target_id, conn.clone()).is_err() {
            warn!("Connection controller for {} already exists", target_id);
            return Err(Error::AlreadyRegistered(target_id.to_string()));
        }
        self.metrics.tunnel_opened();
        info!("Tunnel active: {} (connection {})", target_id, conn.id);

        let writer = tokio::spawn(write_loop(
            conn.target_id.clone(),
            sink,
            rx,
            conn.cancel.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            conn.target_id.clone(),
            stream,
            self.pending.clone(),
            self.metrics.clone(),
            conn.cancel.clone(),
        ));

        let tunnels = self.tunnels.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let _ = reader.await;
            conn.cancel.cancel();
            let _ = writer.await;

            tunnels.delete_if(&conn.target_id, |current| current.id == conn.id);
            metrics.tunnel_closed();
            info!(
                "Tunnel {} closed after {:?}",
                conn.target_id,
                conn.connected_at.elapsed()
            );
        });

        Ok(())
    }

    /// Stop the loops of the active connection for `target_id`, if any.
    pub fn disconnect(&self, target_id: &str) -> bool {
        match self.tunnels.get(target_id) {
            Some(conn) => {
                info!("Disconnecting tunnel {}", target_id);
                conn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Issue an HTTP call through the tunnel of `target_id` and wait for
    /// the agent's answer.
    ///
    /// Fails immediately for an unknown target. Never waits longer than
    /// [`ServerOptions::call_timeout`]; on timeout the pending slot is gone
    /// before this returns, so a late response is dropped. Dropping the
    /// returned future releases the slot as well.
    pub async fn call_api(
        &self,
        target_id: &str,
        method: &str,
        url: &str,
        headers: HashMap<String, String>,
        body: impl Into<String>,
    ) -> Result<CallResponse> {
        let started = Instant::now();
        let reqid = uuid::Uuid::new_v4().to_string();

        // The slot must exist before the request can possibly be answered
        let (slot, response_rx) = oneshot::channel();
        self.pending.set(reqid.clone(), slot);
        let guard = PendingGuard {
            pending: self.pending.clone(),
            reqid: reqid.clone(),
        };

        let Some(conn) = self.tunnels.get(target_id) else {
            warn!("Connection controller for {} is not found", target_id);
            self.metrics.record_call(CallOutcome::TargetNotFound, 0).await;
            return Err(Error::TargetNotFound(target_id.to_string()));
        };

        let request = RequestMessage {
            reqid: reqid.clone(),
            method: method.to_string(),
            url: url.to_string(),
            headers,
            body: body.into(),
        };
        debug!("call {} -> {} {} {}", reqid, target_id, method, url);

        let bound = self.options.call_timeout;
        let exchange = async {
            if conn.is_closed() {
                return Err(Error::ConnectionClosed(target_id.to_string()));
            }
            conn.enqueue(request).await?;
            tokio::select! {
                biased;
                response = response_rx => {
                    response.map_err(|_| Error::ConnectionClosed(target_id.to_string()))
                }
                _ = conn.cancel.cancelled() => Err(Error::ConnectionClosed(target_id.to_string())),
            }
        };

        let result = match tokio::time::timeout(bound, exchange).await {
            Ok(Ok(response)) => Ok(CallResponse::from(response)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout {
                target: target_id.to_string(),
                after: bound,
            }),
        };
        drop(guard);

        let outcome = match &result {
            Ok(_) => CallOutcome::Ok,
            Err(Error::Timeout { .. }) => CallOutcome::TimedOut,
            Err(_) => CallOutcome::ConnectionClosed,
        };
        if let Err(e) = &result {
            warn!("call {} to {} failed: {}", reqid, target_id, e);
        }
        self.metrics
            .record_call(outcome, started.elapsed().as_micros() as u64)
            .await;

        result
    }
}

impl Default for ServerController {
    fn default() -> Self {
        Self::new(ServerOptions::default())
    }
}

/// Serialize queued requests onto the tunnel, one frame each.
async fn write_loop<W>(
    target_id: String,
    mut sink: W,
    mut rx: mpsc::Receiver<RequestMessage>,
    cancel: CancellationToken,
) where
    W: Sink<String> + Unpin,
    W::Error: Display,
{
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(request) => request,
                None => {
                    info!("Request queue for {} is closed, exiting loop", target_id);
                    break;
                }
            },
        };

        let frame = match protocol::encode(&request) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[{}] marshal {}: {}", target_id, request.reqid, e);
                continue;
            }
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = sink.send(frame) => sent,
        };
        if let Err(e) = sent {
            warn!("[{}] write: {}", target_id, e);
            break;
        }
    }

    // Later enqueues fail fast instead of waiting for the timeout
    drop(rx);
    cancel.cancel();
    let _ = sink.close().await;
}

/// Decode response frames and hand each to the call waiting on its id.
async fn read_loop<R, E>(
    target_id: String,
    mut stream: R,
    pending: Registry<PendingSlot>,
    metrics: Metrics,
    cancel: CancellationToken,
) where
    R: Stream<Item = std::result::Result<String, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("[{}] read: {}", target_id, e);
                break;
            }
            None => {
                info!("[{}] agent closed the tunnel", target_id);
                break;
            }
        };

        let response: ResponseMessage = match protocol::decode(&frame) {
            Ok(response) => response,
            Err(e) => {
                metrics.decode_error();
                warn!("[{}] unmarshal: {}", target_id, e);
                continue;
            }
        };

        match pending.take(&response.reqid) {
            Some(slot) => {
                let reqid = response.reqid.clone();
                if slot.send(response).is_err() {
                    debug!("[{}] caller for {} already gone", target_id, reqid);
                }
            }
            None => {
                metrics.unmatched_response();
                warn!("[{}] no pending call for {}, dropping response", target_id, response.reqid);
            }
        }
    }

    cancel.cancel();
}
