use parley_storage::TurnId;
use parley_transport::TransportError;
use snafu::Snafu;

use crate::history::HistoryError;

/// Failures surfaced by the chat session to its presentation layer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("not connected on `{stage}`: {source}"))]
    NotConnected {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("transport unavailable on `{stage}`: {source}"))]
    TransportUnavailable {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("responder reported an error: {message}"))]
    RemoteError {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("history fetch failed on `{stage}`: {source}"))]
    HistoryFetchFailed {
        stage: &'static str,
        source: HistoryError,
    },
    #[snafu(display("no reply to turn {turn_id} within {timeout_ms}ms"))]
    ReplyTimedOut {
        stage: &'static str,
        turn_id: TurnId,
        timeout_ms: u64,
    },
    #[snafu(display("connection lost while awaiting a reply: {reason}"))]
    ConnectionLost {
        stage: &'static str,
        reason: String,
    },
    #[snafu(display("turn {turn_id} is not a resendable user turn"))]
    NotResendable {
        stage: &'static str,
        turn_id: TurnId,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Coarse classification carried by presentation updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatErrorKind {
    NotConnected,
    TransportUnavailable,
    RemoteError,
    HistoryFetchFailed,
    ReplyTimedOut,
    ConnectionLost,
    NotResendable,
}

impl ChatError {
    pub fn kind(&self) -> ChatErrorKind {
        match self {
            Self::NotConnected { .. } => ChatErrorKind::NotConnected,
            Self::TransportUnavailable { .. } => ChatErrorKind::TransportUnavailable,
            Self::RemoteError { .. } => ChatErrorKind::RemoteError,
            Self::HistoryFetchFailed { .. } => ChatErrorKind::HistoryFetchFailed,
            Self::ReplyTimedOut { .. } => ChatErrorKind::ReplyTimedOut,
            Self::ConnectionLost { .. } => ChatErrorKind::ConnectionLost,
            Self::NotResendable { .. } => ChatErrorKind::NotResendable,
        }
    }

    /// Maps a transport failure to the session taxonomy.
    pub(crate) fn from_transport(stage: &'static str, source: TransportError) -> Self {
        match source {
            TransportError::NotConnected { .. } => Self::NotConnected { stage, source },
            source => Self::TransportUnavailable { stage, source },
        }
    }
}
