use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_storage::{
    MessageLog, Role, StateStore, Turn, TurnId, clear_message_log, load_message_log,
    save_message_log,
};
use parley_transport::{
    ConnectionEvent, ConnectionEvents, ConnectionManager, ConnectionStatus, Frame,
    ReconnectOutcome,
};
use snafu::OptionExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::chat::events::{SessionUpdate, SurfacedError};
use crate::chat::paginator::{HistoryPaginator, PageOutcome, PaginationState};
use crate::chat::state::{ReplyState, ReplyTransition};
use crate::chat::view::{Delivery, SessionSnapshot, TurnView};
use crate::chat::viewport::{Viewport, ViewportMetrics};
use crate::error::{ChatError, ChatResult, NotResendableSnafu};
use crate::history::HistorySource;

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// `None` waits for a reply indefinitely.
    pub reply_timeout: Option<Duration>,
    pub page_size: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Some(DEFAULT_REPLY_TIMEOUT),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(TurnId),
    Ignored(IgnoredSend),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoredSend {
    BlankContent,
    AwaitingReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A load was already running or history is exhausted.
    Skipped,
    Loaded { inserted: usize, has_more: bool },
    /// The log was cleared while the page was in flight.
    Stale,
}

/// Receiving end of a session's presentation updates.
pub struct SessionUpdates {
    updates: mpsc::UnboundedReceiver<SessionUpdate>,
}

impl SessionUpdates {
    pub async fn recv(&mut self) -> Option<SessionUpdate> {
        self.updates.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionUpdate> {
        self.updates.try_recv().ok()
    }
}

#[derive(Debug, Clone, Default)]
enum PersistRequest {
    #[default]
    Idle,
    Save(Arc<Vec<Turn>>),
    Remove,
}

struct SessionState {
    log: MessageLog,
    reply: ReplyState,
    delivery: HashMap<TurnId, Delivery>,
    pagination: PaginationState,
    viewport: Viewport,
    status: ConnectionStatus,
    last_error: Option<SurfacedError>,
    reply_timer: Option<JoinHandle<()>>,
}

impl SessionState {
    /// Wall clock, but never earlier than the newest turn already in the log.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        self.log
            .latest_timestamp()
            .map_or(now, |latest| latest.max(now))
    }

    fn disarm_reply_timer(&mut self) {
        if let Some(timer) = self.reply_timer.take() {
            timer.abort();
        }
    }
}

struct SessionInner {
    connection: ConnectionManager,
    paginator: HistoryPaginator,
    config: SessionConfig,
    state: Mutex<SessionState>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    persist: watch::Sender<PersistRequest>,
}

/// Orchestrates one chat session: local log, reply lifecycle, history paging and
/// connectivity, exposed to a rendering layer through snapshots and updates.
///
/// All state lives behind one lock that is never held across an await point, so inbound
/// events, timers and user operations apply one at a time.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    /// Loads the persisted log and starts the inbound event loop and the persistence writer.
    pub async fn restore(
        connection: ConnectionManager,
        events: ConnectionEvents,
        history: Arc<dyn HistorySource>,
        store: Arc<dyn StateStore>,
        config: SessionConfig,
    ) -> (Self, SessionUpdates) {
        let log = load_message_log(store.as_ref()).await;
        tracing::info!(turns = log.len(), "restored local message log");

        let pagination = PaginationState::for_log(&log, Utc::now());
        let status = connection.status();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (persist_tx, persist_rx) = watch::channel(PersistRequest::Idle);

        let inner = Arc::new(SessionInner {
            connection,
            paginator: HistoryPaginator::new(history, config.page_size),
            config,
            state: Mutex::new(SessionState {
                log,
                reply: ReplyState::Idle,
                delivery: HashMap::new(),
                pagination,
                viewport: Viewport::new(),
                status,
                last_error: None,
                reply_timer: None,
            }),
            updates: updates_tx,
            persist: persist_tx,
        });

        tokio::spawn(run_persist_writer(store, persist_rx));
        tokio::spawn(run_event_loop(Arc::downgrade(&inner), events));

        (Self { inner }, SessionUpdates {
            updates: updates_rx,
        })
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub async fn connect(&self) -> ChatResult<()> {
        self.inner
            .connection
            .connect()
            .await
            .map_err(|source| self.inner.report(ChatError::from_transport("connect", source)))
    }

    pub async fn reconnect(&self) -> ChatResult<ReconnectOutcome> {
        self.inner
            .connection
            .reconnect()
            .await
            .map_err(|source| self.inner.report(ChatError::from_transport("reconnect", source)))
    }

    pub async fn disconnect(&self) {
        self.inner.connection.disconnect().await;
    }

    /// Appends a user turn and transmits it.
    ///
    /// Blank input and input while a reply is pending are ignored. When transmission fails
    /// the turn stays in the log marked failed, the session returns to idle and the error
    /// is returned.
    pub fn send_message(&self, content: &str) -> ChatResult<SendOutcome> {
        if content.trim().is_empty() {
            tracing::debug!("ignoring blank message");
            return Ok(SendOutcome::Ignored(IgnoredSend::BlankContent));
        }

        let mut state = self.inner.state();
        if let Some(pending) = state.reply.pending_turn() {
            tracing::debug!(pending_turn = %pending, "ignoring send while awaiting a reply");
            return Ok(SendOutcome::Ignored(IgnoredSend::AwaitingReply));
        }

        let turn = Turn::user(content, state.next_timestamp());
        let turn_id = turn.id.clone();
        state.log.append(turn.clone());
        state.viewport.request_scroll_to_bottom();
        self.inner.emit(SessionUpdate::TurnAppended {
            turn_id: turn_id.clone(),
            autoscroll: true,
        });
        self.inner.persist_log(&state);

        self.inner.dispatch(&mut state, turn, "send-message")?;
        Ok(SendOutcome::Sent(turn_id))
    }

    /// Re-transmits a user turn that is already in the log without adding a new entry.
    pub fn resend(&self, turn_id: &TurnId) -> ChatResult<SendOutcome> {
        let mut state = self.inner.state();
        if state.reply.is_awaiting() {
            tracing::debug!(turn_id = %turn_id, "ignoring resend while awaiting a reply");
            return Ok(SendOutcome::Ignored(IgnoredSend::AwaitingReply));
        }

        let turn = state
            .log
            .get(turn_id)
            .filter(|turn| turn.role == Role::User && !turn.is_error)
            .cloned()
            .context(NotResendableSnafu {
                stage: "resend",
                turn_id: turn_id.clone(),
            })?;

        tracing::info!(turn_id = %turn_id, "resending turn");
        self.inner.dispatch(&mut state, turn, "resend")?;
        Ok(SendOutcome::Sent(turn_id.clone()))
    }

    /// Most recent user turn whose transmission or reply failed.
    pub fn last_failed_turn(&self) -> Option<TurnId> {
        let state = self.inner.state();
        state
            .log
            .turns()
            .iter()
            .rev()
            .find(|turn| state.delivery.get(&turn.id) == Some(&Delivery::Failed))
            .map(|turn| turn.id.clone())
    }

    /// Fetches the next page of older turns and merges it at the top of the log.
    pub async fn load_more(&self) -> ChatResult<LoadOutcome> {
        let request = {
            let mut state = self.inner.state();
            let Some(request) = state.pagination.begin(self.inner.paginator.page_size()) else {
                tracing::debug!(
                    loading = state.pagination.is_loading(),
                    has_more = state.pagination.has_more(),
                    "skipping history load"
                );
                return Ok(LoadOutcome::Skipped);
            };
            request
        };

        let result = self.inner.paginator.fetch(request).await;

        let mut guard = self.inner.state();
        let state = &mut *guard;
        match state.pagination.finish(request, result, &mut state.log) {
            PageOutcome::Merged {
                inserted,
                duplicates,
                has_more,
            } => {
                tracing::info!(inserted, duplicates, has_more, "merged history page");
                if inserted > 0 {
                    self.inner.persist_log(state);
                }
                self.inner.emit(SessionUpdate::HistoryPrepended {
                    count: inserted,
                    has_more,
                });
                Ok(LoadOutcome::Loaded { inserted, has_more })
            }
            PageOutcome::Stale => {
                tracing::debug!("dropping history page that arrived after a clear");
                Ok(LoadOutcome::Stale)
            }
            PageOutcome::Failed(source) => {
                let error = ChatError::HistoryFetchFailed {
                    stage: "load-more",
                    source,
                };
                tracing::warn!(error = %error, "history fetch failed");
                self.inner.surface(state, &error);
                Err(error)
            }
        }
    }

    /// Empties the log and restarts pagination from now. Connectivity is untouched.
    pub fn clear_messages(&self) {
        let mut state = self.inner.state();
        let cleared = state.log.len();
        state.log.clear();
        state.delivery.clear();
        state.pagination.reset(Utc::now());
        state.viewport.reset();
        state.last_error = None;

        self.inner.persist.send_replace(PersistRequest::Remove);
        self.inner.emit(SessionUpdate::Cleared);
        tracing::info!(cleared, "cleared local message log");
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.state();
        SessionSnapshot {
            turns: state
                .log
                .turns()
                .iter()
                .map(|turn| {
                    let delivery = state.delivery.get(&turn.id).copied().unwrap_or_default();
                    TurnView::new(turn.clone(), delivery)
                })
                .collect(),
            status: state.status,
            pending_turn: state.reply.pending_turn().cloned(),
            has_more: state.pagination.has_more(),
            loading_history: state.pagination.is_loading(),
            following_bottom: state.viewport.is_following_bottom(),
            unread: state.viewport.unread_count(),
            last_error: state.last_error.clone(),
        }
    }

    pub fn is_awaiting_reply(&self) -> bool {
        self.inner.state().reply.is_awaiting()
    }

    pub fn update_viewport(&self, metrics: ViewportMetrics) {
        self.inner.state().viewport.update_follow_state(metrics);
    }

    pub fn scroll_to_bottom(&self) {
        self.inner.state().viewport.request_scroll_to_bottom();
    }

    pub fn apply_pending_scroll(&self) -> Option<f32> {
        self.inner.state().viewport.apply_pending_scroll()
    }

    /// Offset that keeps the previously visible turn anchored after a prepend grew the
    /// content by `height_delta`.
    pub fn compensate_prepend(&self, height_delta: f32) -> f32 {
        self.inner.state().viewport.compensate_prepend(height_delta)
    }
}

impl SessionInner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    fn persist_log(&self, state: &SessionState) {
        self.persist
            .send_replace(PersistRequest::Save(Arc::new(state.log.turns().to_vec())));
    }

    fn surface(&self, state: &mut SessionState, error: &ChatError) {
        let surfaced = SurfacedError::from(error);
        state.last_error = Some(surfaced.clone());
        self.emit(SessionUpdate::Error(surfaced));
    }

    fn report(&self, error: ChatError) -> ChatError {
        tracing::warn!(error = %error, "connection request failed");
        let mut state = self.state();
        self.surface(&mut state, &error);
        error
    }

    fn set_delivery(&self, state: &mut SessionState, turn_id: &TurnId, delivery: Delivery) {
        if state.delivery.insert(turn_id.clone(), delivery) != Some(delivery) {
            self.emit(SessionUpdate::DeliveryChanged {
                turn_id: turn_id.clone(),
                delivery,
            });
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        state: &mut SessionState,
        turn: Turn,
        stage: &'static str,
    ) -> ChatResult<()> {
        let turn_id = turn.id.clone();
        match state.reply.apply(ReplyTransition::Dispatch(turn_id.clone())) {
            Ok(next) => state.reply = next,
            Err(rejection) => {
                tracing::debug!(?rejection, "dispatch rejected");
                return Ok(());
            }
        }

        match self.connection.send(Frame::Message(turn)) {
            Ok(()) => {
                tracing::debug!(turn_id = %turn_id, "turn transmitted; awaiting reply");
                self.set_delivery(state, &turn_id, Delivery::Sent);
                self.emit(SessionUpdate::PendingChanged {
                    awaiting_reply: true,
                });
                self.arm_reply_timer(state, turn_id);
                Ok(())
            }
            Err(source) => {
                let error = ChatError::from_transport(stage, source);
                tracing::warn!(turn_id = %turn_id, error = %error, "turn not transmitted; kept for resend");
                state.reply = state
                    .reply
                    .apply(ReplyTransition::Fail(turn_id.clone()))
                    .unwrap_or_default();
                self.set_delivery(state, &turn_id, Delivery::Failed);
                self.surface(state, &error);
                Err(error)
            }
        }
    }

    fn arm_reply_timer(self: &Arc<Self>, state: &mut SessionState, turn_id: TurnId) {
        state.disarm_reply_timer();
        let Some(timeout) = self.config.reply_timeout else {
            return;
        };

        let session = Arc::downgrade(self);
        state.reply_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = session.upgrade() {
                session.reply_timed_out(turn_id, timeout);
            }
        }));
    }

    fn reply_timed_out(&self, turn_id: TurnId, timeout: Duration) {
        let mut state = self.state();
        if !state.reply.is_pending(&turn_id) {
            return;
        }
        // This task owns the handle; dropping it must not abort the running timer.
        state.reply_timer = None;

        let marker = format!("No reply received within {}s.", timeout.as_secs());
        let error = ChatError::ReplyTimedOut {
            stage: "reply-timeout",
            turn_id: turn_id.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };
        self.fail_pending(&mut state, &turn_id, marker, error);
    }

    /// Ends the pending request with a visible marker and makes its turn resendable.
    fn fail_pending(
        &self,
        state: &mut SessionState,
        turn_id: &TurnId,
        marker: String,
        error: ChatError,
    ) {
        match state.reply.apply(ReplyTransition::Fail(turn_id.clone())) {
            Ok(next) => state.reply = next,
            Err(rejection) => {
                tracing::debug!(?rejection, "ignoring failure for a request that is no longer pending");
                return;
            }
        }

        state.disarm_reply_timer();
        self.set_delivery(state, turn_id, Delivery::Failed);
        let marker = Turn::error_marker(marker, state.next_timestamp());
        self.append_turn(state, marker);
        self.emit(SessionUpdate::PendingChanged {
            awaiting_reply: false,
        });

        tracing::error!(turn_id = %turn_id, error = %error, "reply failed");
        self.surface(state, &error);
    }

    fn append_turn(&self, state: &mut SessionState, turn: Turn) -> bool {
        let turn_id = turn.id.clone();
        if state.log.append(turn).is_none() {
            tracing::debug!(turn_id = %turn_id, "ignoring duplicate turn");
            return false;
        }

        let autoscroll = state.viewport.note_appended(1);
        self.emit(SessionUpdate::TurnAppended {
            turn_id,
            autoscroll,
        });
        self.persist_log(state);
        true
    }

    fn handle_connection_event(&self, event: ConnectionEvent) {
        let mut state = self.state();
        match event {
            ConnectionEvent::StatusChanged(status) => {
                state.status = status;
                self.emit(SessionUpdate::StatusChanged(status));
            }
            ConnectionEvent::Message(turn) => match unusable_reply(&turn) {
                Some(reason) => tracing::warn!(
                    turn_id = %turn.id,
                    role = ?turn.role,
                    reason,
                    "ignoring inbound message"
                ),
                None => self.handle_reply(&mut state, turn),
            },
            ConnectionEvent::RemoteError(message) => {
                self.handle_remote_error(&mut state, message)
            }
            ConnectionEvent::ChannelLost(reason) => {
                let Some(turn_id) = state.reply.pending_turn().cloned() else {
                    return;
                };
                let error = ChatError::ConnectionLost {
                    stage: "channel-lost",
                    reason: reason.to_string(),
                };
                self.fail_pending(
                    &mut state,
                    &turn_id,
                    "Connection lost before a reply arrived.".to_string(),
                    error,
                );
            }
        }
    }

    fn handle_reply(&self, state: &mut SessionState, turn: Turn) {
        let turn_id = turn.id.clone();
        if !self.append_turn(state, turn) {
            return;
        }

        match state.reply.apply(ReplyTransition::Resolve) {
            Ok(next) => {
                state.reply = next;
                state.disarm_reply_timer();
                tracing::debug!(turn_id = %turn_id, "reply received");
                self.emit(SessionUpdate::PendingChanged {
                    awaiting_reply: false,
                });
            }
            Err(_) => {
                tracing::debug!(turn_id = %turn_id, "message arrived with no request pending");
            }
        }
    }

    fn handle_remote_error(&self, state: &mut SessionState, message: String) {
        let error = ChatError::RemoteError {
            stage: "remote-error",
            message: message.clone(),
        };

        if let Some(turn_id) = state.reply.pending_turn().cloned() {
            self.fail_pending(state, &turn_id, message, error);
            return;
        }

        let marker = Turn::error_marker(message, state.next_timestamp());
        self.append_turn(state, marker);
        tracing::error!(error = %error, "responder reported an error");
        self.surface(state, &error);
    }
}

/// Why an inbound turn cannot be taken as a reply. Such turns are neither stored nor
/// allowed to end the wait; the reply timeout still guards the pending request.
fn unusable_reply(turn: &Turn) -> Option<&'static str> {
    if turn.role != Role::Assistant {
        Some("not an assistant turn")
    } else if turn.is_error {
        Some("carries the local error flag")
    } else if turn.content.trim().is_empty() {
        Some("blank content")
    } else {
        None
    }
}

async fn run_event_loop(session: Weak<SessionInner>, mut events: ConnectionEvents) {
    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.handle_connection_event(event);
    }
    tracing::debug!("session event loop stopped");
}

/// Writes only the newest requested state; intermediate snapshots are skipped.
async fn run_persist_writer(
    store: Arc<dyn StateStore>,
    mut requests: watch::Receiver<PersistRequest>,
) {
    while requests.changed().await.is_ok() {
        let request = requests.borrow_and_update().clone();
        let result = match request {
            PersistRequest::Idle => continue,
            PersistRequest::Save(turns) => save_message_log(store.as_ref(), &turns).await,
            PersistRequest::Remove => clear_message_log(store.as_ref()).await,
        };

        if let Err(error) = result {
            tracing::warn!(error = %error, "failed to persist local message log");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::TimeZone;
    use parley_storage::{MESSAGES_KEY, MemoryStateStore};
    use parley_transport::{ConnectionConfig, MemoryServer, loopback};
    use tokio::sync::Notify;

    use super::*;
    use crate::error::ChatErrorKind;
    use crate::history::{BoxFuture, HistoryPage, HistoryResult, UnavailableSnafu};

    #[derive(Default)]
    struct ScriptedHistory {
        turns: Vec<Turn>,
        requests: Mutex<Vec<DateTime<Utc>>>,
        gate: Option<Arc<Notify>>,
        failing: AtomicBool,
    }

    impl ScriptedHistory {
        fn requests(&self) -> Vec<DateTime<Utc>> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl HistorySource for ScriptedHistory {
        fn fetch_before(
            &self,
            before: DateTime<Utc>,
            limit: u32,
        ) -> BoxFuture<'_, HistoryResult<HistoryPage>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(before);
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                if self.failing.load(Ordering::SeqCst) {
                    return UnavailableSnafu {
                        stage: "scripted-history",
                        message: "offline",
                    }
                    .fail();
                }

                let older = self
                    .turns
                    .iter()
                    .filter(|turn| turn.timestamp < before)
                    .cloned()
                    .collect::<Vec<_>>();
                let start = older.len().saturating_sub(limit as usize);
                Ok(HistoryPage {
                    has_more: start > 0,
                    messages: older[start..].to_vec(),
                })
            })
        }
    }

    struct Harness {
        session: ChatSession,
        updates: SessionUpdates,
        server: MemoryServer,
    }

    async fn harness_with(
        store: Arc<MemoryStateStore>,
        history: Arc<ScriptedHistory>,
        config: SessionConfig,
    ) -> Harness {
        let (connector, server) = loopback();
        let (connection, events) =
            ConnectionManager::new(Arc::new(connector), ConnectionConfig::default());
        let (session, updates) =
            ChatSession::restore(connection, events, history, store, config).await;
        Harness {
            session,
            updates,
            server,
        }
    }

    async fn harness() -> Harness {
        harness_with(
            Arc::new(MemoryStateStore::new()),
            Arc::new(ScriptedHistory::default()),
            SessionConfig::default(),
        )
        .await
    }

    async fn next_update(
        updates: &mut SessionUpdates,
        predicate: impl Fn(&SessionUpdate) -> bool,
    ) -> SessionUpdate {
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                let update = updates.recv().await.expect("update feed closed");
                if predicate(&update) {
                    return update;
                }
            }
        })
        .await
        .expect("expected update never arrived")
    }

    fn is_error(update: &SessionUpdate, kind: ChatErrorKind) -> bool {
        matches!(update, SessionUpdate::Error(error) if error.kind == kind)
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
    }

    fn history_turn(index: i64) -> Turn {
        Turn::new(
            TurnId::parse(&format!("history-{index}")).unwrap(),
            if index % 2 == 0 { Role::User } else { Role::Assistant },
            format!("turn {index}"),
            at(-index),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn blank_message_changes_nothing() {
        let mut h = harness().await;
        h.session.connect().await.unwrap();

        let outcome = h.session.send_message("   \n\t").unwrap();

        assert_eq!(outcome, SendOutcome::Ignored(IgnoredSend::BlankContent));
        let snapshot = h.session.snapshot();
        assert!(snapshot.turns.is_empty());
        assert!(!snapshot.is_awaiting_reply());
        while let Some(update) = h.updates.try_recv() {
            assert!(!matches!(update, SessionUpdate::TurnAppended { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_send_while_awaiting_is_ignored() {
        let mut h = harness().await;
        h.session.connect().await.unwrap();
        let mut peer = h.server.accept().await.unwrap();

        let SendOutcome::Sent(first) = h.session.send_message("hi").unwrap() else {
            panic!("first send should be transmitted");
        };
        let second = h.session.send_message("again").unwrap();

        assert_eq!(second, SendOutcome::Ignored(IgnoredSend::AwaitingReply));
        let snapshot = h.session.snapshot();
        assert_eq!(snapshot.turns.len(), 1);
        assert_eq!(snapshot.pending_turn, Some(first.clone()));

        let Some(Frame::Message(sent)) = peer.recv().await else {
            panic!("peer should receive the first turn");
        };
        assert_eq!(sent.id, first);
        assert_eq!(sent.content, "hi");
        assert_eq!(peer.try_recv(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_reply_is_appended_and_clears_pending() {
        let mut h = harness().await;
        h.session.connect().await.unwrap();
        let peer = h.server.accept().await.unwrap();
        h.session.send_message("hi").unwrap();

        let reply = Turn::assistant("hello there", Utc::now() + chrono::Duration::seconds(1));
        peer.send(Frame::Message(reply.clone()));

        next_update(&mut h.updates, |update| {
            matches!(update, SessionUpdate::TurnAppended { turn_id, .. } if *turn_id == reply.id)
        })
        .await;

        let snapshot = h.session.snapshot();
        assert!(!snapshot.is_awaiting_reply());
        assert_eq!(snapshot.turns.len(), 2);
        assert!(matches!(&snapshot.turns[1], TurnView::Assistant { turn } if turn.id == reply.id));
    }

    #[tokio::test(start_paused = true)]
    async fn echoed_or_blank_messages_do_not_end_the_wait() {
        let mut h = harness().await;
        h.session.connect().await.unwrap();
        let peer = h.server.accept().await.unwrap();
        let SendOutcome::Sent(pending) = h.session.send_message("hi").unwrap() else {
            panic!("send should be transmitted");
        };

        let later = Utc::now() + chrono::Duration::seconds(1);
        peer.send(Frame::Message(Turn::user("hi", later)));
        peer.send(Frame::Message(Turn::user("", later)));
        peer.send(Frame::Message(Turn::assistant("  \n", later)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snapshot = h.session.snapshot();
        assert_eq!(snapshot.pending_turn, Some(pending));
        assert_eq!(snapshot.turns.len(), 1);

        let reply = Turn::assistant("hello", later);
        peer.send(Frame::Message(reply.clone()));
        next_update(&mut h.updates, |update| {
            matches!(update, SessionUpdate::TurnAppended { turn_id, .. } if *turn_id == reply.id)
        })
        .await;

        let snapshot = h.session.snapshot();
        assert!(!snapshot.is_awaiting_reply());
        assert_eq!(snapshot.turns.len(), 2);
        assert!(snapshot.turns.iter().all(|view| !view.turn().content.trim().is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_disconnected_keeps_turn_for_resend() {
        let mut h = harness().await;

        let error = h.session.send_message("hi").unwrap_err();

        assert_eq!(error.kind(), ChatErrorKind::NotConnected);
        let snapshot = h.session.snapshot();
        assert_eq!(snapshot.turns.len(), 1);
        assert!(!snapshot.is_awaiting_reply());
        assert!(matches!(
            &snapshot.turns[0],
            TurnView::User {
                delivery: Delivery::Failed,
                ..
            }
        ));
        assert_eq!(
            snapshot.last_error.map(|error| error.kind),
            Some(ChatErrorKind::NotConnected)
        );

        let turn_id = snapshot.turns[0].id().clone();
        assert_eq!(h.session.last_failed_turn(), Some(turn_id.clone()));

        h.session.connect().await.unwrap();
        let mut peer = h.server.accept().await.unwrap();
        assert_eq!(
            h.session.resend(&turn_id).unwrap(),
            SendOutcome::Sent(turn_id.clone())
        );

        let Some(Frame::Message(sent)) = peer.recv().await else {
            panic!("peer should receive the resent turn");
        };
        assert_eq!(sent.id, turn_id);
        let snapshot = h.session.snapshot();
        assert_eq!(snapshot.turns.len(), 1);
        assert_eq!(snapshot.pending_turn, Some(turn_id));
        assert!(!snapshot.turns[0].actions().resend);
    }

    #[tokio::test(start_paused = true)]
    async fn resend_rejects_unknown_turns() {
        let h = harness().await;

        let error = h
            .session
            .resend(&TurnId::parse("missing").unwrap())
            .unwrap_err();

        assert_eq!(error.kind(), ChatErrorKind::NotResendable);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_error_becomes_visible_marker() {
        let mut h = harness().await;
        h.session.connect().await.unwrap();
        let peer = h.server.accept().await.unwrap();
        h.session.send_message("hi").unwrap();

        peer.send(Frame::remote_error("model overloaded"));
        next_update(&mut h.updates, |update| {
            is_error(update, ChatErrorKind::RemoteError)
        })
        .await;

        let snapshot = h.session.snapshot();
        assert!(!snapshot.is_awaiting_reply());
        assert_eq!(snapshot.turns.len(), 2);
        assert!(matches!(
            &snapshot.turns[1],
            TurnView::Error { turn } if turn.content == "model overloaded"
        ));
        assert!(snapshot.turns[0].actions().resend);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_timeout_fails_turn_and_late_reply_is_kept() {
        let mut h = harness().await;
        h.session.connect().await.unwrap();
        let peer = h.server.accept().await.unwrap();
        h.session.send_message("hi").unwrap();

        tokio::time::sleep(DEFAULT_REPLY_TIMEOUT + Duration::from_secs(1)).await;

        let snapshot = h.session.snapshot();
        assert!(!snapshot.is_awaiting_reply());
        assert_eq!(snapshot.turns.len(), 2);
        assert!(matches!(&snapshot.turns[1], TurnView::Error { .. }));
        assert_eq!(
            snapshot.last_error.map(|error| error.kind),
            Some(ChatErrorKind::ReplyTimedOut)
        );

        let late = Turn::assistant("sorry, slow", Utc::now() + chrono::Duration::seconds(1));
        peer.send(Frame::Message(late.clone()));
        next_update(&mut h.updates, |update| {
            matches!(update, SessionUpdate::TurnAppended { turn_id, .. } if *turn_id == late.id)
        })
        .await;

        let snapshot = h.session.snapshot();
        assert_eq!(snapshot.turns.len(), 3);
        assert!(!snapshot.is_awaiting_reply());
    }

    #[tokio::test(start_paused = true)]
    async fn channel_loss_while_awaiting_fails_pending_turn() {
        let mut h = harness().await;
        h.session.connect().await.unwrap();
        let peer = h.server.accept().await.unwrap();
        h.session.send_message("hi").unwrap();

        peer.fail("connection reset");
        next_update(&mut h.updates, |update| {
            is_error(update, ChatErrorKind::ConnectionLost)
        })
        .await;

        let snapshot = h.session.snapshot();
        assert!(!snapshot.is_awaiting_reply());
        assert!(snapshot.turns[0].actions().resend);
        assert!(matches!(&snapshot.turns[1], TurnView::Error { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_while_retrying_reports_attempt_in_flight() {
        let mut h = harness().await;
        h.session.connect().await.unwrap();
        let peer = h.server.accept().await.unwrap();

        h.server.set_refusing(true);
        peer.fail("connection reset");
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(
            h.session.reconnect().await.unwrap(),
            ReconnectOutcome::AlreadyInFlight
        );
        assert!(h.session.snapshot().is_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn load_more_walks_history_backwards() {
        let store = Arc::new(MemoryStateStore::new());
        let anchor = Turn::new(TurnId::parse("local").unwrap(), Role::User, "latest", at(0));
        save_message_log(store.as_ref(), std::slice::from_ref(&anchor))
            .await
            .unwrap();
        let history = Arc::new(ScriptedHistory {
            turns: (1..=25).rev().map(history_turn).collect(),
            ..ScriptedHistory::default()
        });
        let h = harness_with(store, history.clone(), SessionConfig::default()).await;

        let first = h.session.load_more().await.unwrap();

        assert_eq!(
            first,
            LoadOutcome::Loaded {
                inserted: 10,
                has_more: true,
            }
        );
        assert_eq!(history.requests(), vec![at(0)]);
        let snapshot = h.session.snapshot();
        assert_eq!(snapshot.turns.len(), 11);
        assert!(snapshot.turns[..10].iter().all(|view| view.turn().timestamp < at(0)));
        assert!(
            snapshot
                .turns
                .windows(2)
                .all(|pair| pair[0].turn().timestamp <= pair[1].turn().timestamp)
        );

        h.session.load_more().await.unwrap();
        assert_eq!(history.requests(), vec![at(0), at(-10)]);

        let last = h.session.load_more().await.unwrap();
        assert_eq!(
            last,
            LoadOutcome::Loaded {
                inserted: 5,
                has_more: false,
            }
        );
        assert_eq!(h.session.load_more().await.unwrap(), LoadOutcome::Skipped);
        assert_eq!(h.session.snapshot().turns.len(), 26);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_history_fetch_keeps_has_more() {
        let history = Arc::new(ScriptedHistory {
            failing: AtomicBool::new(true),
            ..ScriptedHistory::default()
        });
        let h = harness_with(
            Arc::new(MemoryStateStore::new()),
            history,
            SessionConfig::default(),
        )
        .await;

        let error = h.session.load_more().await.unwrap_err();

        assert_eq!(error.kind(), ChatErrorKind::HistoryFetchFailed);
        let snapshot = h.session.snapshot();
        assert!(snapshot.has_more);
        assert!(!snapshot.loading_history);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_resets_pagination_and_drops_late_page() {
        let gate = Arc::new(Notify::new());
        let history = Arc::new(ScriptedHistory {
            turns: (1..=5).map(history_turn).collect(),
            gate: Some(gate.clone()),
            ..ScriptedHistory::default()
        });
        let store = Arc::new(MemoryStateStore::new());
        let mut h = harness_with(store.clone(), history.clone(), SessionConfig::default()).await;
        h.session.connect().await.unwrap();
        let _peer = h.server.accept().await;
        h.session.send_message("hi").unwrap();

        let loader = tokio::spawn({
            let session = h.session.clone();
            async move { session.load_more().await }
        });
        while history.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(h.session.snapshot().loading_history);
        assert_eq!(h.session.load_more().await.unwrap(), LoadOutcome::Skipped);

        h.session.clear_messages();
        gate.notify_one();

        assert_eq!(loader.await.unwrap().unwrap(), LoadOutcome::Stale);
        let snapshot = h.session.snapshot();
        assert!(snapshot.turns.is_empty());
        assert!(snapshot.has_more);
        assert!(!snapshot.loading_history);
        assert!(h.session.connection().is_connected());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.load(MESSAGES_KEY).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn send_during_history_load_does_not_cancel_it() {
        let gate = Arc::new(Notify::new());
        let history = Arc::new(ScriptedHistory {
            turns: (1..=5).rev().map(history_turn).collect(),
            gate: Some(gate.clone()),
            ..ScriptedHistory::default()
        });
        let mut h = harness_with(
            Arc::new(MemoryStateStore::new()),
            history.clone(),
            SessionConfig::default(),
        )
        .await;
        h.session.connect().await.unwrap();
        let _peer = h.server.accept().await;

        let loader = tokio::spawn({
            let session = h.session.clone();
            async move { session.load_more().await }
        });
        while history.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let SendOutcome::Sent(pending) = h.session.send_message("hi").unwrap() else {
            panic!("send should be transmitted while history loads");
        };
        assert!(h.session.snapshot().loading_history);
        gate.notify_one();

        assert_eq!(
            loader.await.unwrap().unwrap(),
            LoadOutcome::Loaded {
                inserted: 5,
                has_more: false,
            }
        );
        let snapshot = h.session.snapshot();
        assert_eq!(snapshot.turns.len(), 6);
        assert_eq!(snapshot.turns[5].id(), &pending);
        assert_eq!(snapshot.pending_turn, Some(pending));
        assert!(!snapshot.loading_history);
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_log_survives_restart() {
        let store = Arc::new(MemoryStateStore::new());
        let history = Arc::new(ScriptedHistory::default());
        let mut h = harness_with(store.clone(), history.clone(), SessionConfig::default()).await;
        h.session.connect().await.unwrap();
        let peer = h.server.accept().await.unwrap();
        h.session.send_message("hi").unwrap();
        let reply = Turn::assistant("hello", Utc::now() + chrono::Duration::seconds(1));
        peer.send(Frame::Message(reply.clone()));
        next_update(&mut h.updates, |update| {
            matches!(update, SessionUpdate::TurnAppended { turn_id, .. } if *turn_id == reply.id)
        })
        .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let before = h.session.snapshot().turns;

        let restarted = harness_with(store, history, SessionConfig::default()).await;

        assert_eq!(restarted.session.snapshot().turns, before);
    }
}
