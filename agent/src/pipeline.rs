//! Agent duplex pipeline.
//!
//! Three loops joined by two bounded queues:
//!
//! ```text
//! tunnel --read--> inbound --dispatch--> forward tasks --> outbound --write--> tunnel
//! ```
//!
//! The read loop decodes requests, the dispatch loop spawns one forwarding
//! task per request, and the write loop serializes every response back onto
//! the tunnel. Responses leave in completion order, not arrival order.

use std::fmt::Display;
use std::sync::Arc;

use fdxtunnel_shared::protocol::{self, DEFAULT_QUEUE_CAPACITY};
use fdxtunnel_shared::{Error, RequestMessage, ResponseMessage, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::forward::Forwarder;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Capacity of both the inbound and the outbound queue
    pub queue_capacity: usize,
    /// Bound on concurrent forwards; `None` spawns one task per request
    pub max_in_flight: Option<usize>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_in_flight: None,
        }
    }
}

pub struct AgentPipeline<F> {
    forwarder: Arc<F>,
    queue_capacity: usize,
    limiter: Option<Arc<Semaphore>>,
}

impl<F: Forwarder> AgentPipeline<F> {
    pub fn new(forwarder: F, options: PipelineOptions) -> Self {
        Self {
            forwarder: Arc::new(forwarder),
            queue_capacity: options.queue_capacity.max(1),
            limiter: options
                .max_in_flight
                .map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    /// Service the tunnel until it closes, fails or `cancel` fires.
    ///
    /// Returns `Ok(())` after cancellation or a clean close by the server,
    /// and the read or write failure otherwise. All three loops have stopped
    /// when this returns.
    pub async fn run<W, R, E>(&self, sink: W, stream: R, cancel: CancellationToken) -> Result<()>
    where
        W: Sink<String> + Send + Unpin + 'static,
        W::Error: Display + Send,
        R: Stream<Item = std::result::Result<String, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel(self.queue_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.queue_capacity);

        let reader = tokio::spawn(read_loop(stream, inbound_tx, cancel.clone()));
        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::clone(&self.forwarder),
            inbound_rx,
            outbound_tx,
            self.limiter.clone(),
        ));
        let writer = tokio::spawn(write_loop(sink, outbound_rx, cancel.clone()));

        let (read, dispatch, write) = tokio::join!(reader, dispatcher, writer);
        if let Err(e) = dispatch {
            warn!("dispatch loop: {}", e);
        }
        let read = read.unwrap_or_else(|e| Err(Error::Tunnel(format!("read loop: {}", e))));
        let write = write.unwrap_or_else(|e| Err(Error::Tunnel(format!("write loop: {}", e))));

        info!("proxy full duplex channel closing...");
        read.and(write)
    }
}

/// Perform one forward. Always yields a response carrying the request's id.
pub async fn forward_one<F: Forwarder>(forwarder: &F, request: RequestMessage) -> ResponseMessage {
    let reqid = request.reqid.clone();
    match forwarder.forward(request).await {
        Ok(out) => ResponseMessage {
            reqid,
            status: out.status,
            headers: out.headers,
            body: out.body,
        },
        Err(e) => {
            warn!("forwardRequest {} err: {}", reqid, e);
            ResponseMessage::failure(reqid)
        }
    }
}

async fn read_loop<R, E>(
    mut stream: R,
    inbound: mpsc::Sender<RequestMessage>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: Stream<Item = std::result::Result<String, E>> + Unpin,
    E: Display,
{
    let result = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            next = stream.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("read: {}", e);
                break Err(Error::Connection(format!("read: {}", e)));
            }
            None => {
                info!("server closed the tunnel");
                break Ok(());
            }
        };

        let request: RequestMessage = match protocol::decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!("unmarshal: {}", e);
                continue;
            }
        };
        debug!("request {} {} {}", request.reqid, request.method, request.url);

        // A full queue holds the reader here; cancellation still wins
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            sent = inbound.send(request) => {
                if sent.is_err() {
                    break Ok(());
                }
            }
        }
    };

    cancel.cancel();
    result
}

async fn dispatch_loop<F: Forwarder>(
    forwarder: Arc<F>,
    mut inbound: mpsc::Receiver<RequestMessage>,
    outbound: mpsc::Sender<ResponseMessage>,
    limiter: Option<Arc<Semaphore>>,
) {
    while let Some(request) = inbound.recv().await {
        let permit = match &limiter {
            Some(limiter) => match Arc::clone(limiter).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => break,
            },
            None => None,
        };

        let forwarder = Arc::clone(&forwarder);
        let outbound = outbound.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let response = forward_one(forwarder.as_ref(), request).await;
            let reqid = response.reqid.clone();
            if outbound.send(response).await.is_err() {
                debug!("response queue closed, dropping response {}", reqid);
            }
        });
    }
    debug!("request queue closed, dispatch stopped");
}

async fn write_loop<W>(
    mut sink: W,
    mut outbound: mpsc::Receiver<ResponseMessage>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: Sink<String> + Unpin,
    W::Error: Display,
{
    let result = loop {
        let response = tokio::select! {
            biased;
            next = outbound.recv() => match next {
                Some(response) => response,
                None => break Ok(()),
            },
            _ = cancel.cancelled() => break Ok(()),
        };

        let frame = match protocol::encode(&response) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("marshal {}: {}", response.reqid, e);
                continue;
            }
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            sent = sink.send(frame) => sent,
        };
        if let Err(e) = sent {
            warn!("write: {}", e);
            break Err(Error::Connection(format!("write: {}", e)));
        }
    };

    cancel.cancel();
    let _ = sink.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::Forwarded;
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct Stats {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    /// Answers with the url as body; `fail` in the url errors, `slow` delays.
    #[derive(Default)]
    struct Scripted {
        stats: Arc<Stats>,
    }

    impl Forwarder for Scripted {
        async fn forward(&self, request: RequestMessage) -> Result<Forwarded> {
            let now = self.stats.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.stats.peak.fetch_max(now, Ordering::SeqCst);
            if request.url.contains("slow") {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            self.stats.current.fetch_sub(1, Ordering::SeqCst);

            if request.url.contains("fail") {
                return Err(Error::Forward("connection refused".into()));
            }
            Ok(Forwarded {
                status: 200,
                headers: HashMap::from([("x".to_string(), "a, b".to_string())]),
                body: request.url,
            })
        }
    }

    /// In-memory stand-in for the server end of the tunnel
    struct FakeServer {
        to_agent: UnboundedSender<io::Result<String>>,
        from_agent: UnboundedReceiver<String>,
        cancel: CancellationToken,
        handle: JoinHandle<Result<()>>,
    }

    impl FakeServer {
        fn start(forwarder: Scripted, options: PipelineOptions) -> Self {
            let (to_agent, stream) = unbounded::<io::Result<String>>();
            let (sink, from_agent) = unbounded::<String>();
            let cancel = CancellationToken::new();
            let pipeline = AgentPipeline::new(forwarder, options);
            let token = cancel.clone();
            let handle = tokio::spawn(async move { pipeline.run(sink, stream, token).await });
            Self {
                to_agent,
                from_agent,
                cancel,
                handle,
            }
        }

        fn request(&self, reqid: &str, url: &str) {
            let req = RequestMessage {
                reqid: reqid.into(),
                method: "GET".into(),
                url: url.into(),
                headers: HashMap::new(),
                body: String::new(),
            };
            self.send_raw(&protocol::encode(&req).unwrap());
        }

        fn send_raw(&self, frame: &str) {
            self.to_agent.unbounded_send(Ok(frame.to_string())).unwrap();
        }

        async fn response(&mut self) -> ResponseMessage {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.from_agent.next())
                .await
                .expect("no response in time")
                .expect("tunnel closed");
            protocol::decode(&frame).unwrap()
        }

        async fn join(self) -> Result<()> {
            tokio::time::timeout(Duration::from_secs(5), self.handle)
                .await
                .expect("pipeline did not stop")
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_request_is_forwarded_and_answered() {
        let mut server = FakeServer::start(Scripted::default(), PipelineOptions::default());
        server.request("r1", "http://example/x");

        let resp = server.response().await;
        assert_eq!(resp.reqid, "r1");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "http://example/x");
        assert_eq!(resp.headers["x"], "a, b");

        server.cancel.cancel();
        assert!(server.join().await.is_ok());
    }

    #[tokio::test]
    async fn test_forward_failure_becomes_500() {
        let mut server = FakeServer::start(Scripted::default(), PipelineOptions::default());
        server.request("r-fail", "http://example/fail");

        let resp = server.response().await;
        assert_eq!(resp.reqid, "r-fail");
        assert_eq!(resp.status, 500);
        assert!(resp.body.is_empty());
        assert!(resp.headers.is_empty());
    }

    #[tokio::test]
    async fn test_responses_leave_in_completion_order() {
        let mut server = FakeServer::start(Scripted::default(), PipelineOptions::default());
        server.request("a", "http://example/slow");
        server.request("b", "http://example/fast");

        let first = server.response().await;
        let second = server.response().await;
        assert_eq!(first.reqid, "b");
        assert_eq!(first.body, "http://example/fast");
        assert_eq!(second.reqid, "a");
        assert_eq!(second.body, "http://example/slow");
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let mut server = FakeServer::start(Scripted::default(), PipelineOptions::default());
        server.send_raw("{\"reqid\": 42");
        server.send_raw("hello");
        server.request("ok", "http://example/");

        let resp = server.response().await;
        assert_eq!(resp.reqid, "ok");
        assert!(!server.handle.is_finished());
    }

    #[tokio::test]
    async fn test_cancel_stops_all_loops() {
        let mut server = FakeServer::start(Scripted::default(), PipelineOptions::default());
        server.request("r1", "http://example/");
        server.response().await;

        server.cancel.cancel();
        // the writer closes its side of the tunnel on the way out
        assert!(server.from_agent.next().await.is_none());
        assert!(server.join().await.is_ok());
    }

    #[tokio::test]
    async fn test_server_close_ends_pipeline() {
        let server = FakeServer::start(Scripted::default(), PipelineOptions::default());
        server.to_agent.close_channel();
        let cancel = server.cancel.clone();
        assert!(server.join().await.is_ok());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_read_error_is_reported() {
        let server = FakeServer::start(Scripted::default(), PipelineOptions::default());
        server
            .to_agent
            .unbounded_send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .unwrap();
        let err = server.join().await.unwrap_err();
        assert!(matches!(err, Error::Connection(ref msg) if msg.contains("reset")));
    }

    #[tokio::test]
    async fn test_write_error_is_reported() {
        let server = FakeServer::start(Scripted::default(), PipelineOptions::default());
        let FakeServer {
            to_agent,
            from_agent,
            cancel,
            handle,
        } = server;
        drop(from_agent);

        let req = RequestMessage {
            reqid: "r1".into(),
            method: "GET".into(),
            url: "http://example/".into(),
            headers: HashMap::new(),
            body: String::new(),
        };
        to_agent
            .unbounded_send(Ok(protocol::encode(&req).unwrap()))
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("pipeline did not stop")
            .unwrap();
        assert!(matches!(result, Err(Error::Connection(_))));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_fan_out_is_unbounded_by_default() {
        let forwarder = Scripted::default();
        let stats = Arc::clone(&forwarder.stats);
        let mut server = FakeServer::start(forwarder, PipelineOptions::default());
        for i in 0..3 {
            server.request(&format!("r{i}"), "http://example/slow");
        }
        for _ in 0..3 {
            server.response().await;
        }
        assert_eq!(stats.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_max_in_flight_bounds_forwards() {
        let forwarder = Scripted::default();
        let stats = Arc::clone(&forwarder.stats);
        let options = PipelineOptions {
            max_in_flight: Some(1),
            ..Default::default()
        };
        let mut server = FakeServer::start(forwarder, options);
        for i in 0..3 {
            server.request(&format!("r{i}"), "http://example/slow");
        }
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(server.response().await.reqid);
        }
        ids.sort();
        assert_eq!(ids, vec!["r0", "r1", "r2"]);
        assert_eq!(stats.peak.load(Ordering::SeqCst), 1);
    }
}
