use parley_storage::{Role, Turn, TurnId};
use parley_transport::ConnectionStatus;

use crate::chat::events::SurfacedError;

/// Transmission outcome of a user turn. The turn itself never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Delivery {
    #[default]
    Sent,
    Failed,
}

/// Actions the rendering layer may offer for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TurnActions {
    pub resend: bool,
    pub copy: bool,
}

/// One rendered row. Each author kind carries its own presentation data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnView {
    User { turn: Turn, delivery: Delivery },
    /// Rendered as markdown.
    Assistant { turn: Turn },
    /// Local marker for a failure surfaced into the transcript.
    Error { turn: Turn },
}

impl TurnView {
    pub fn new(turn: Turn, delivery: Delivery) -> Self {
        if turn.is_error {
            return Self::Error { turn };
        }

        match turn.role {
            Role::User => Self::User { turn, delivery },
            Role::Assistant => Self::Assistant { turn },
        }
    }

    pub fn turn(&self) -> &Turn {
        match self {
            Self::User { turn, .. } | Self::Assistant { turn } | Self::Error { turn } => turn,
        }
    }

    pub fn id(&self) -> &TurnId {
        &self.turn().id
    }

    pub fn actions(&self) -> TurnActions {
        match self {
            Self::User { delivery, .. } => TurnActions {
                resend: *delivery == Delivery::Failed,
                copy: true,
            },
            Self::Assistant { .. } => TurnActions {
                resend: false,
                copy: true,
            },
            Self::Error { .. } => TurnActions::default(),
        }
    }

    pub fn renders_markdown(&self) -> bool {
        matches!(self, Self::Assistant { .. })
    }

    /// Short author label for line-oriented front ends.
    pub fn label(&self) -> &'static str {
        match self {
            Self::User { .. } => "you",
            Self::Assistant { .. } => "bot",
            Self::Error { .. } => "error",
        }
    }
}

/// Everything a renderer needs to draw the session at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub turns: Vec<TurnView>,
    pub status: ConnectionStatus,
    pub pending_turn: Option<TurnId>,
    pub has_more: bool,
    pub loading_history: bool,
    pub following_bottom: bool,
    pub unread: usize,
    pub last_error: Option<SurfacedError>,
}

impl SessionSnapshot {
    pub fn is_awaiting_reply(&self) -> bool {
        self.pending_turn.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.status.is_reconnecting()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn variants_follow_role_and_error_marker() {
        let now = Utc::now();

        let user = TurnView::new(Turn::user("hi", now), Delivery::Failed);
        let reply = TurnView::new(Turn::assistant("**hello**", now), Delivery::Sent);
        let marker = TurnView::new(Turn::error_marker("boom", now), Delivery::Sent);

        assert!(user.actions().resend);
        assert!(!reply.actions().resend);
        assert!(reply.renders_markdown());
        assert!(matches!(marker, TurnView::Error { .. }));
        assert_eq!(marker.actions(), TurnActions::default());
    }

    #[test]
    fn sent_user_turn_offers_no_resend() {
        let view = TurnView::new(Turn::user("hi", Utc::now()), Delivery::Sent);

        assert_eq!(
            view.actions(),
            TurnActions {
                resend: false,
                copy: true,
            }
        );
        assert_eq!(view.label(), "you");
    }
}
