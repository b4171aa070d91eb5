//! Outbound HTTP forwarding for tunneled requests

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use fdxtunnel_shared::{Error, RequestMessage, Result};
use reqwest::header::HeaderMap;
use reqwest::Method;
use tracing::info;

/// Result of a real HTTP call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarded {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Performs the real HTTP call behind a tunneled request.
pub trait Forwarder: Send + Sync + 'static {
    fn forward(&self, request: RequestMessage) -> impl Future<Output = Result<Forwarded>> + Send;
}

/// [`Forwarder`] backed by a shared `reqwest` client. No retries.
#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    /// `timeout` of `None` leaves requests unbounded.
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Forward(format!("client: {}", e)))?;
        Ok(Self { client })
    }
}

impl Forwarder for HttpForwarder {
    async fn forward(&self, request: RequestMessage) -> Result<Forwarded> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::Forward(format!("invalid method {:?}", request.method)))?;

        if method == Method::GET {
            info!("forward---> {} {}", request.method, request.url);
        } else {
            info!("forward---> {} {} ({} byte body)", request.method, request.url, request.body.len());
        }

        let mut builder = self.client.request(method, request.url.as_str());
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(|e| Error::Forward(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = flatten_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Forward(format!("read body: {}", e)))?;

        Ok(Forwarded {
            status,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

/// Collapse multi-value headers into one `", "`-joined value per name.
pub fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat = HashMap::with_capacity(headers.keys_len());
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()))
            .collect::<Vec<_>>()
            .join(", ");
        flat.insert(name.as_str().to_string(), joined);
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::StatusCode,
        response::AppendHeaders,
        routing::{get, post},
        Router,
    };
    use reqwest::header::HeaderValue;

    #[test]
    fn test_flatten_multi_value_header() {
        let mut headers = HeaderMap::new();
        headers.append("x", HeaderValue::from_static("a"));
        headers.append("x", HeaderValue::from_static("b"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        let flat = flatten_headers(&headers);
        assert_eq!(flat.len(), 2);
        assert_eq!(flat["x"], "a, b");
        assert_eq!(flat["content-type"], "text/plain");
    }

    async fn spawn_origin() -> std::net::SocketAddr {
        let app = Router::new()
            .route(
                "/multi",
                get(|| async { (AppendHeaders([("x", "a"), ("x", "b")]), "multi") }),
            )
            .route("/echo", post(|body: String| async move { (StatusCode::CREATED, body) }))
            .route(
                "/teapot",
                get(|| async { (StatusCode::IM_A_TEAPOT, "short and stout") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn request(method: &str, url: String, body: &str) -> RequestMessage {
        RequestMessage {
            reqid: "r1".into(),
            method: method.into(),
            url,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    #[tokio::test]
    async fn test_forward_flattens_response_headers() {
        let addr = spawn_origin().await;
        let fwd = HttpForwarder::new(Some(Duration::from_secs(5))).unwrap();

        let out = fwd
            .forward(request("GET", format!("http://{}/multi", addr), ""))
            .await
            .unwrap();
        assert_eq!(out.status, 200);
        assert_eq!(out.body, "multi");
        assert_eq!(out.headers["x"], "a, b");
    }

    #[tokio::test]
    async fn test_forward_sends_body_and_keeps_status() {
        let addr = spawn_origin().await;
        let fwd = HttpForwarder::new(None).unwrap();

        let out = fwd
            .forward(request("POST", format!("http://{}/echo", addr), "payload"))
            .await
            .unwrap();
        assert_eq!(out.status, 201);
        assert_eq!(out.body, "payload");

        let out = fwd
            .forward(request("GET", format!("http://{}/teapot", addr), ""))
            .await
            .unwrap();
        assert_eq!(out.status, 418);
    }

    #[tokio::test]
    async fn test_forward_errors() {
        let fwd = HttpForwarder::new(Some(Duration::from_secs(2))).unwrap();

        let err = fwd
            .forward(request("BAD METHOD", "http://127.0.0.1:1/".into(), ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forward(_)));

        let err = fwd
            .forward(request("GET", "not a url".into(), ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forward(_)));

        // nothing listens on port 1
        let err = fwd
            .forward(request("GET", "http://127.0.0.1:1/".into(), ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forward(_)));
    }
}
