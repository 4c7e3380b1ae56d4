use parley_storage::TurnId;
use parley_transport::ConnectionStatus;

use crate::chat::view::Delivery;
use crate::error::{ChatError, ChatErrorKind};

/// An error as shown to the user: its class plus a printable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfacedError {
    pub kind: ChatErrorKind,
    pub message: String,
}

impl From<&ChatError> for SurfacedError {
    fn from(error: &ChatError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Change notifications for the presentation layer, in the order they were applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    TurnAppended {
        turn_id: TurnId,
        /// The view was following the tail, so it should scroll to show the new turn.
        autoscroll: bool,
    },
    /// Older turns were merged at the top; the view should compensate its offset.
    HistoryPrepended { count: usize, has_more: bool },
    Cleared,
    StatusChanged(ConnectionStatus),
    PendingChanged { awaiting_reply: bool },
    DeliveryChanged { turn_id: TurnId, delivery: Delivery },
    Error(SurfacedError),
}
