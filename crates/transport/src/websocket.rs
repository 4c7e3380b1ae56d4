use futures::{SinkExt, StreamExt, future};
use snafu::ResultExt;
use tokio_tungstenite::tungstenite::Message;

use super::connector::{BoxFuture, Channel, Connector};
use super::error::{TransportError, TransportResult, WebSocketSnafu};
use super::frame::Frame;

/// Connects to the responder over a WebSocket and speaks JSON text frames.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim().to_string(),
        }
    }

    async fn open(&self) -> TransportResult<Channel> {
        let (socket, response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .context(WebSocketSnafu {
                stage: "websocket-handshake",
            })?;
        tracing::debug!(
            endpoint = %self.url,
            status = response.status().as_u16(),
            "websocket handshake completed"
        );

        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(|source| TransportError::WebSocket {
                stage: "websocket-write",
                source,
            })
            .with(|frame: Frame| future::ready(frame.encode().map(Message::Text)));

        let stream = stream.filter_map(|item| future::ready(map_incoming(item)));

        Ok(Channel::new(Box::pin(sink), Box::pin(stream)))
    }
}

impl Connector for WebSocketConnector {
    fn endpoint(&self) -> &str {
        &self.url
    }

    fn connect(&self) -> BoxFuture<'_, TransportResult<Channel>> {
        Box::pin(self.open())
    }
}

fn map_incoming(
    item: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<TransportResult<Frame>> {
    match item {
        Ok(Message::Text(text)) => match Frame::decode(&text) {
            Ok(frame) => Some(Ok(frame)),
            Err(error) => {
                // A single bad frame should not tear the channel down.
                tracing::warn!(error = %error, payload = %text, "skipping undecodable frame");
                None
            }
        },
        Ok(Message::Close(close)) => {
            tracing::debug!(?close, "peer sent close frame");
            None
        }
        Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(source) => Some(Err(TransportError::WebSocket {
            stage: "websocket-read",
            source,
        })),
    }
}
