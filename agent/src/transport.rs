//! Websocket dialer producing a text-frame sink/stream pair

use fdxtunnel_shared::protocol::CHANNEL_PATH;
use fdxtunnel_shared::{Error, Result};
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::info;

/// Channel URL for `target_id` on `server`. Accepts `host:port` or a ws(s) URL.
pub fn channel_url(server: &str, target_id: &str) -> String {
    let server = server.trim_end_matches('/');
    if server.starts_with("ws://") || server.starts_with("wss://") {
        format!("{}{}/{}", server, CHANNEL_PATH, target_id)
    } else {
        format!("ws://{}{}/{}", server, CHANNEL_PATH, target_id)
    }
}

/// Dial the server and register as `target_id`.
///
/// Close frames end the stream; binary frames are read as lossy UTF-8.
pub async fn connect(
    server: &str,
    target_id: &str,
) -> Result<(
    impl Sink<String, Error = WsError> + Send + Unpin + 'static,
    impl Stream<Item = std::result::Result<String, WsError>> + Send + Unpin + 'static,
)> {
    let url = channel_url(server, target_id);
    info!("connecting to {}", url);

    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|e| Error::Connection(format!("dial {}: {}", url, e)))?;
    info!("full duplex channel established.");

    let (sink, stream) = ws_stream.split();
    let sink = sink.with(|text: String| future::ready(Ok::<_, WsError>(Message::Text(text))));
    let stream = stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => Some(Ok(String::from_utf8_lossy(&data).into_owned())),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });
    Ok((sink, stream))
}
