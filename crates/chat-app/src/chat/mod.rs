/// Presentation update contracts.
pub mod events;
/// Backwards history loading and merge bookkeeping.
pub mod paginator;
pub mod session;
/// Deterministic reply lifecycle.
pub mod state;
pub mod view;
pub mod viewport;

pub use events::{SessionUpdate, SurfacedError};
pub use paginator::{HistoryPaginator, PageOutcome, PageRequest, PaginationState};
pub use session::{
    ChatSession, DEFAULT_PAGE_SIZE, DEFAULT_REPLY_TIMEOUT, IgnoredSend, LoadOutcome,
    SendOutcome, SessionConfig, SessionUpdates,
};
pub use state::{ReplyState, ReplyTransition, ReplyTransitionRejection, ReplyTransitionResult};
pub use view::{Delivery, SessionSnapshot, TurnActions, TurnView};
pub use viewport::{Viewport, ViewportMetrics};
