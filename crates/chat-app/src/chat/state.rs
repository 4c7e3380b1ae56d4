use parley_storage::TurnId;

/// Whether a user turn is still waiting for its untagged reply.
///
/// Replies carry no correlation id, so at most one request may be outstanding per session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReplyState {
    #[default]
    Idle,
    AwaitingReply(TurnId),
}

/// State transition input for the reply lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTransition {
    /// A user turn was handed to the connection.
    Dispatch(TurnId),
    /// The next inbound assistant turn arrived.
    Resolve,
    /// The pending request failed: transmission error, remote error, timeout or lost channel.
    Fail(TurnId),
}

/// Rejection reason for illegal reply transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTransitionRejection {
    AlreadyAwaiting { active: TurnId, attempted: TurnId },
    NoPendingReply,
    TurnMismatch { active: TurnId, attempted: TurnId },
}

pub type ReplyTransitionResult = Result<ReplyState, ReplyTransitionRejection>;

impl ReplyState {
    pub fn pending_turn(&self) -> Option<&TurnId> {
        match self {
            Self::AwaitingReply(turn_id) => Some(turn_id),
            Self::Idle => None,
        }
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(self, Self::AwaitingReply(_))
    }

    /// True when a failure reported for `turn_id` still applies to the pending request.
    pub fn is_pending(&self, turn_id: &TurnId) -> bool {
        matches!(self, Self::AwaitingReply(active) if active == turn_id)
    }

    pub fn apply(&self, transition: ReplyTransition) -> ReplyTransitionResult {
        match transition {
            ReplyTransition::Dispatch(turn_id) => self.apply_dispatch(turn_id),
            ReplyTransition::Resolve => self.apply_resolve(),
            ReplyTransition::Fail(turn_id) => self.apply_fail(turn_id),
        }
    }

    fn apply_dispatch(&self, turn_id: TurnId) -> ReplyTransitionResult {
        match self {
            Self::AwaitingReply(active) if *active != turn_id => {
                Err(ReplyTransitionRejection::AlreadyAwaiting {
                    active: active.clone(),
                    attempted: turn_id,
                })
            }
            Self::AwaitingReply(_) => Ok(self.clone()),
            Self::Idle => Ok(Self::AwaitingReply(turn_id)),
        }
    }

    fn apply_resolve(&self) -> ReplyTransitionResult {
        match self {
            Self::AwaitingReply(_) => Ok(Self::Idle),
            Self::Idle => Err(ReplyTransitionRejection::NoPendingReply),
        }
    }

    fn apply_fail(&self, turn_id: TurnId) -> ReplyTransitionResult {
        match self {
            Self::AwaitingReply(active) if *active == turn_id => Ok(Self::Idle),
            Self::AwaitingReply(active) => Err(ReplyTransitionRejection::TurnMismatch {
                active: active.clone(),
                attempted: turn_id,
            }),
            Self::Idle => Err(ReplyTransitionRejection::NoPendingReply),
        }
    }
}
