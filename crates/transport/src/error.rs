use snafu::Snafu;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("no active channel on `{stage}`"))]
    NotConnected { stage: &'static str },
    #[snafu(display("transport to {endpoint} is unavailable on `{stage}`: {source}"))]
    TransportUnavailable {
        stage: &'static str,
        endpoint: String,
        #[snafu(source(from(TransportError, Box::new)))]
        source: Box<TransportError>,
    },
    #[snafu(display("handshake with {endpoint} did not complete within {timeout_ms}ms"))]
    HandshakeTimedOut {
        stage: &'static str,
        endpoint: String,
        timeout_ms: u64,
    },
    #[snafu(display("connection to {endpoint} was refused"))]
    Refused {
        stage: &'static str,
        endpoint: String,
    },
    #[snafu(display("websocket failure on `{stage}`, {source}"))]
    WebSocket {
        stage: &'static str,
        source: tungstenite::Error,
    },
    #[snafu(display("peer reported a transport failure: {message}"))]
    PeerFailure {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("channel closed on `{stage}`"))]
    ChannelClosed { stage: &'static str },
    #[snafu(display("failed to encode frame on `{stage}`: {source}"))]
    EncodeFrame {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode frame on `{stage}`: {source}"))]
    DecodeFrame {
        stage: &'static str,
        source: serde_json::Error,
    },
}

pub type TransportResult<T> = Result<T, TransportError>;
