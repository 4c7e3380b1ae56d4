//! Connection management for the chat client: one logical channel to the responder, kept
//! alive by an application-level heartbeat and re-established within a bounded budget.

pub mod connector;
pub mod error;
pub mod frame;
mod heartbeat;
pub mod manager;
pub mod memory;
pub mod websocket;

pub use connector::{BoxFuture, Channel, Connector, FrameSink, FrameStream};
pub use error::{TransportError, TransportResult};
pub use frame::{Frame, RemoteErrorPayload};
pub use heartbeat::HeartbeatTiming;
pub use manager::{
    CloseReason, ConnectionConfig, ConnectionEvent, ConnectionEvents, ConnectionManager,
    ConnectionStatus, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY,
    DEFAULT_WATCHDOG_INTERVAL, ReconnectOutcome,
};
pub use memory::{MemoryConnector, MemoryPeer, MemoryServer, loopback};
pub use websocket::WebSocketConnector;
