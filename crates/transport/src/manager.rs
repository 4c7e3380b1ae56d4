use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use parley_storage::Turn;
use snafu::{OptionExt, ResultExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::connector::Connector;
use super::error::{
    HandshakeTimedOutSnafu, NotConnectedSnafu, TransportResult, TransportUnavailableSnafu,
};
use super::frame::Frame;
use super::heartbeat::{ChannelWorker, HeartbeatTiming};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub watchdog_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ConnectionConfig {
    fn heartbeat_timing(&self) -> HeartbeatTiming {
        HeartbeatTiming {
            interval: self.heartbeat_interval,
            watchdog_interval: self.watchdog_interval,
            timeout: self.heartbeat_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_reconnecting(self) -> bool {
        matches!(self, Self::Reconnecting)
    }
}

/// What a manual reconnect request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// A channel is open when the call returns.
    Established,
    /// An automatic or manual reconnection was already running; nothing was attempted.
    AlreadyInFlight,
}

/// Why a live channel stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Requested,
    HeartbeatTimeout,
    PeerClosed,
    TransportError(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => formatter.write_str("closed on request"),
            Self::HeartbeatTimeout => formatter.write_str("heartbeat acknowledgment timed out"),
            Self::PeerClosed => formatter.write_str("peer closed the channel"),
            Self::TransportError(message) => write!(formatter, "transport error: {message}"),
        }
    }
}

impl CloseReason {
    /// Only failures the transport itself reported are retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PeerClosed | Self::TransportError(_))
    }
}

/// Everything the manager reports to its owner, in transport order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StatusChanged(ConnectionStatus),
    ChannelLost(CloseReason),
    Message(Turn),
    RemoteError(String),
}

/// Receiving end of the manager's event feed.
pub struct ConnectionEvents {
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl ConnectionEvents {
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ConnectionEvent> {
        self.events.try_recv().ok()
    }
}

struct ActiveChannel {
    generation: u64,
    outbound: mpsc::UnboundedSender<Frame>,
    shutdown: oneshot::Sender<()>,
    worker: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveChannel>,
    generation: u64,
    retry_count: u32,
    reconnect_task: Option<JoinHandle<()>>,
}

pub(crate) struct Shared {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    status: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    slot: Mutex<Slot>,
    // Serializes handshakes so concurrent connect calls cannot open two channels.
    handshake: tokio::sync::Mutex<()>,
    reconnect_in_flight: AtomicBool,
}

/// Owns the single logical channel of a session.
///
/// Cloning is cheap and every clone refers to the same channel.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
    ) -> (Self, ConnectionEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);

        let manager = Self {
            shared: Arc::new(Shared {
                connector,
                config,
                status: status_tx,
                events: events_tx,
                slot: Mutex::new(Slot::default()),
                handshake: tokio::sync::Mutex::new(()),
                reconnect_in_flight: AtomicBool::new(false),
            }),
        };

        (manager, ConnectionEvents { events: events_rx })
    }

    pub fn endpoint(&self) -> &str {
        self.shared.connector.endpoint()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.status().is_reconnecting()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Number of automatic attempts made since the last successful handshake.
    pub fn retry_count(&self) -> u32 {
        self.shared.slot().retry_count
    }

    /// Opens the channel unless one is already active.
    pub async fn connect(&self) -> TransportResult<()> {
        let result = self.shared.establish("connect").await;
        if result.is_err() {
            self.shared.set_status(ConnectionStatus::Disconnected);
        }
        result
    }

    /// Queues a frame on the active channel without waiting for the peer.
    pub fn send(&self, frame: Frame) -> TransportResult<()> {
        let slot = self.shared.slot();
        let active = slot.active.as_ref().context(NotConnectedSnafu { stage: "send" })?;
        active
            .outbound
            .send(frame)
            .ok()
            .context(NotConnectedSnafu {
                stage: "send-closed-channel",
            })
    }

    /// Tears down the channel and any automatic reconnection. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        self.shared.cancel_reconnect();

        let active = {
            let _handshake = self.shared.handshake.lock().await;
            self.shared.slot().active.take()
        };

        if let Some(active) = active {
            tracing::info!(
                endpoint = %self.endpoint(),
                generation = active.generation,
                "closing channel on request"
            );
            let _ = active.shutdown.send(());
            drop(active.outbound);
            if let Err(error) = active.worker.await {
                tracing::warn!(error = %error, "channel worker ended abnormally");
            }
        }

        self.shared.set_status(ConnectionStatus::Disconnected);
    }

    /// User-triggered re-establishment. Reports [`ReconnectOutcome::AlreadyInFlight`] without
    /// touching the channel while another reconnection is running.
    pub async fn reconnect(&self) -> TransportResult<ReconnectOutcome> {
        if !self.shared.begin_reconnect() {
            tracing::debug!("reconnect requested while another attempt is in flight");
            return Ok(ReconnectOutcome::AlreadyInFlight);
        }

        self.shared.set_status(ConnectionStatus::Reconnecting);
        let result = self.shared.establish("reconnect").await;
        self.shared.finish_reconnect();

        if let Err(error) = &result {
            tracing::warn!(endpoint = %self.endpoint(), error = %error, "manual reconnect failed");
            self.shared.set_status(ConnectionStatus::Disconnected);
        }
        result.map(|()| ReconnectOutcome::Established)
    }
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, next: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });

        if changed {
            tracing::debug!(status = ?next, "connection status changed");
            let _ = self.events.send(ConnectionEvent::StatusChanged(next));
        }
    }

    fn begin_reconnect(&self) -> bool {
        self.reconnect_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn finish_reconnect(&self) {
        self.reconnect_in_flight.store(false, Ordering::SeqCst);
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.slot().reconnect_task.take() {
            task.abort();
            self.finish_reconnect();
        }
    }

    async fn establish(self: &Arc<Self>, stage: &'static str) -> TransportResult<()> {
        let _handshake = self.handshake.lock().await;

        if self.slot().active.is_some() {
            self.set_status(ConnectionStatus::Connected);
            return Ok(());
        }

        if !self.status.borrow().is_reconnecting() {
            self.set_status(ConnectionStatus::Connecting);
        }

        let endpoint = self.connector.endpoint().to_string();
        let timeout = self.config.connect_timeout;
        let channel = match tokio::time::timeout(timeout, self.connector.connect()).await {
            Ok(result) => result,
            Err(_) => HandshakeTimedOutSnafu {
                stage,
                endpoint: endpoint.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }
            .fail(),
        }
        .context(TransportUnavailableSnafu {
            stage,
            endpoint: endpoint.clone(),
        })?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let mut slot = self.slot();
        slot.generation += 1;
        slot.retry_count = 0;
        let generation = slot.generation;

        let worker = ChannelWorker {
            generation,
            channel,
            outbound: outbound_rx,
            shutdown: shutdown_rx,
            events: self.events.clone(),
            timing: self.config.heartbeat_timing(),
            shared: Arc::downgrade(self),
        };
        slot.active = Some(ActiveChannel {
            generation,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            worker: tokio::spawn(worker.run()),
        });
        drop(slot);

        tracing::info!(endpoint = %endpoint, generation, "channel connected");
        self.set_status(ConnectionStatus::Connected);
        Ok(())
    }

    /// Called by a worker whose channel died without being asked to.
    pub(crate) fn channel_closed(self: &Arc<Self>, generation: u64, reason: CloseReason) {
        let mut slot = self.slot();
        let is_current = slot
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation);
        if !is_current {
            tracing::debug!(generation, ?reason, "ignoring close from a stale channel");
            return;
        }
        slot.active = None;

        let retry = reason.is_retryable()
            && self.config.reconnect_attempts > 0
            && self.begin_reconnect();
        if retry {
            slot.reconnect_task = Some(tokio::spawn(run_reconnect_loop(self.clone())));
        }
        drop(slot);

        tracing::info!(generation, ?reason, retry, "channel lost");
        self.set_status(ConnectionStatus::Disconnected);
        let _ = self.events.send(ConnectionEvent::ChannelLost(reason));
    }
}

async fn run_reconnect_loop(shared: Arc<Shared>) {
    let attempts = shared.config.reconnect_attempts;

    for attempt in 1..=attempts {
        tokio::time::sleep(shared.config.reconnect_delay).await;

        shared.slot().retry_count = attempt;
        shared.set_status(ConnectionStatus::Reconnecting);

        match shared.establish("auto-reconnect").await {
            Ok(()) => {
                tracing::info!(attempt, "automatic reconnect succeeded");
                shared.slot().reconnect_task = None;
                shared.finish_reconnect();
                return;
            }
            Err(error) => {
                tracing::warn!(attempt, attempts, error = %error, "automatic reconnect failed");
            }
        }
    }

    tracing::info!(attempts, "reconnect attempts exhausted; waiting for manual reconnect");
    shared.slot().reconnect_task = None;
    shared.finish_reconnect();
    shared.set_status(ConnectionStatus::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::memory::{MemoryServer, loopback};

    use chrono::Utc;

    fn manager_with_loopback() -> (ConnectionManager, ConnectionEvents, MemoryServer) {
        let (connector, server) = loopback();
        let (manager, events) =
            ConnectionManager::new(Arc::new(connector), ConnectionConfig::default());
        (manager, events, server)
    }

    fn drain(events: &mut ConnectionEvents) -> Vec<ConnectionEvent> {
        std::iter::from_fn(|| events.try_recv()).collect()
    }

    async fn next_matching(
        events: &mut ConnectionEvents,
        predicate: impl Fn(&ConnectionEvent) -> bool,
    ) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                let event = events.recv().await.expect("event feed closed");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event never arrived")
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let (manager, mut events, server) = manager_with_loopback();

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert_eq!(server.connect_attempts(), 1);
        assert_eq!(manager.status(), ConnectionStatus::Connected);
        assert_eq!(
            drain(&mut events),
            vec![
                ConnectionEvent::StatusChanged(ConnectionStatus::Connecting),
                ConnectionEvent::StatusChanged(ConnectionStatus::Connected),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_share_one_handshake() {
        let (manager, _events, server) = manager_with_loopback();

        let (first, second) = tokio::join!(manager.connect(), manager.connect());

        first.unwrap();
        second.unwrap();
        assert_eq!(server.connect_attempts(), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn send_without_channel_is_rejected() {
        let (manager, _events, _server) = manager_with_loopback();

        let error = manager.send(Frame::Ping).unwrap_err();

        assert!(matches!(error, TransportError::NotConnected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn frames_flow_both_ways() {
        let (manager, mut events, mut server) = manager_with_loopback();
        manager.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        let outgoing = parley_storage::Turn::user("hello", Utc::now());
        manager.send(Frame::Message(outgoing.clone())).unwrap();
        assert_eq!(peer.recv().await, Some(Frame::Message(outgoing)));

        let reply = parley_storage::Turn::assistant("hi there", Utc::now());
        peer.send(Frame::Message(reply.clone()));
        let event = next_matching(&mut events, |event| {
            matches!(event, ConnectionEvent::Message(_))
        })
        .await;
        assert_eq!(event, ConnectionEvent::Message(reply));

        peer.send(Frame::Error(crate::frame::RemoteErrorPayload {
            message: "responder crashed".to_string(),
        }));
        let event = next_matching(&mut events, |event| {
            matches!(event, ConnectionEvent::RemoteError(_))
        })
        .await;
        assert_eq!(
            event,
            ConnectionEvent::RemoteError("responder crashed".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn answered_heartbeats_keep_channel_open() {
        let (manager, _events, mut server) = manager_with_loopback();
        manager.connect().await.unwrap();
        let _peer = server.accept().await.unwrap();

        tokio::time::sleep(Duration::from_secs(300)).await;

        assert!(manager.is_connected());
        assert_eq!(server.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_disconnected_once_by_watchdog() {
        let (manager, mut events, mut server) = manager_with_loopback();
        server.set_auto_pong(false);
        manager.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();
        drain(&mut events);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(manager.is_connected());
        assert_eq!(peer.try_recv(), Some(Frame::Ping));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        tokio::time::sleep(Duration::from_secs(120)).await;
        let seen = drain(&mut events);
        let disconnects = seen
            .iter()
            .filter(|event| {
                **event == ConnectionEvent::StatusChanged(ConnectionStatus::Disconnected)
            })
            .count();
        assert_eq!(disconnects, 1);
        assert!(seen.contains(&ConnectionEvent::ChannelLost(CloseReason::HeartbeatTimeout)));
        assert_eq!(server.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_triggers_automatic_reconnect() {
        let (manager, mut events, mut server) = manager_with_loopback();
        manager.connect().await.unwrap();
        let peer = server.accept().await.unwrap();

        peer.fail("connection reset");

        next_matching(&mut events, |event| {
            matches!(event, ConnectionEvent::ChannelLost(CloseReason::TransportError(_)))
        })
        .await;
        next_matching(&mut events, |event| {
            *event == ConnectionEvent::StatusChanged(ConnectionStatus::Reconnecting)
        })
        .await;
        next_matching(&mut events, |event| {
            *event == ConnectionEvent::StatusChanged(ConnectionStatus::Connected)
        })
        .await;

        assert!(manager.is_connected());
        assert_eq!(server.connect_attempts(), 2);
        assert_eq!(manager.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_bounded_attempts() {
        let (manager, _events, mut server) = manager_with_loopback();
        manager.connect().await.unwrap();
        let peer = server.accept().await.unwrap();

        server.set_refusing(true);
        peer.close();

        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(server.connect_attempts(), 1 + DEFAULT_RECONNECT_ATTEMPTS as usize);
        assert_eq!(manager.retry_count(), DEFAULT_RECONNECT_ATTEMPTS);

        server.set_refusing(false);
        assert_eq!(
            manager.reconnect().await.unwrap(),
            ReconnectOutcome::Established
        );
        assert!(manager.is_connected());
        assert_eq!(manager.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_reconnect_during_automatic_retries_is_reported() {
        let (manager, _events, mut server) = manager_with_loopback();
        manager.connect().await.unwrap();
        let peer = server.accept().await.unwrap();

        server.set_refusing(true);
        peer.fail("connection reset");
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let attempts = server.connect_attempts();

        assert_eq!(
            manager.reconnect().await.unwrap(),
            ReconnectOutcome::AlreadyInFlight
        );
        assert_eq!(server.connect_attempts(), attempts);
        assert!(!manager.is_connected());

        server.set_refusing(false);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_reports_unavailable() {
        let (manager, _events, server) = manager_with_loopback();
        server.set_refusing(true);

        let error = manager.connect().await.unwrap_err();

        assert!(matches!(error, TransportError::TransportUnavailable { .. }));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent_and_does_not_reconnect() {
        let (manager, mut events, mut server) = manager_with_loopback();
        manager.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();
        drain(&mut events);

        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(peer.recv().await, None);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(server.connect_attempts(), 1);
        assert_eq!(
            drain(&mut events),
            vec![ConnectionEvent::StatusChanged(ConnectionStatus::Disconnected)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn manual_reconnect_opens_fresh_channel() {
        let (manager, _events, mut server) = manager_with_loopback();
        manager.connect().await.unwrap();
        let _first = server.accept().await.unwrap();
        manager.disconnect().await;

        assert_eq!(
            manager.reconnect().await.unwrap(),
            ReconnectOutcome::Established
        );

        assert!(manager.is_connected());
        assert!(server.accept().await.is_some());
        assert_eq!(server.connect_attempts(), 2);
    }
}
