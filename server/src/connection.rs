//! Tunnel connection handle for the FdxTunnel server

use std::time::Instant;

use fdxtunnel_shared::{Error, RequestMessage, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Represents an active tunnel connection for one target id
#[derive(Clone)]
pub struct TunnelConnection {
    /// Distinguishes this connection from a later one for the same target
    pub id: String,
    /// Target identifier this agent registered under
    pub target_id: String,
    /// Outbound request queue, consumed by the single writer task
    tx: mpsc::Sender<RequestMessage>,
    /// Stops both loops of this connection
    pub cancel: CancellationToken,
    pub connected_at: Instant,
}

impl TunnelConnection {
    /// Create the handle together with the receiving end of its request queue.
    pub fn new(target_id: String, capacity: usize) -> (Self, mpsc::Receiver<RequestMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id: uuid::Uuid::new_v4().to_string(),
            target_id,
            tx,
            cancel: CancellationToken::new(),
            connected_at: Instant::now(),
        };
        (conn, rx)
    }

    /// Queue a request for the writer. Waits while the queue is full.
    pub async fn enqueue(&self, request: RequestMessage) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::ConnectionClosed(self.target_id.clone()))
    }

    /// True once the writer has stopped consuming the queue.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.cancel.is_cancelled()
    }
}
