//! In-process loopback transport.
//!
//! `MemoryConnector` hands out channels whose far end is a [`MemoryPeer`] accepted from the
//! paired [`MemoryServer`]. Tests drive the far end directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::{sink, stream};
use tokio::sync::mpsc;

use super::connector::{BoxFuture, Channel, Connector};
use super::error::{TransportError, TransportResult};
use super::frame::Frame;

const MEMORY_ENDPOINT: &str = "memory://loopback";

#[derive(Debug, Default)]
struct Switches {
    refusing: AtomicBool,
    auto_pong: AtomicBool,
    attempts: AtomicUsize,
}

/// Client side of the loopback transport.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    switches: Arc<Switches>,
}

/// Accepts loopback channels and controls how the fake peer behaves.
#[derive(Debug)]
pub struct MemoryServer {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    switches: Arc<Switches>,
}

/// Far end of one loopback channel.
#[derive(Debug)]
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<Frame>,
    to_client: mpsc::UnboundedSender<TransportResult<Frame>>,
}

/// Creates a connected connector/server pair. Pings are answered automatically by default.
pub fn loopback() -> (MemoryConnector, MemoryServer) {
    let (peers_tx, peers_rx) = mpsc::unbounded_channel();
    let switches = Arc::new(Switches::default());
    switches.auto_pong.store(true, Ordering::SeqCst);

    (
        MemoryConnector {
            peers: peers_tx,
            switches: switches.clone(),
        },
        MemoryServer {
            peers: peers_rx,
            switches,
        },
    )
}

impl MemoryConnector {
    fn open(&self) -> TransportResult<Channel> {
        self.switches.attempts.fetch_add(1, Ordering::SeqCst);
        if self.switches.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Refused {
                stage: "memory-handshake",
                endpoint: MEMORY_ENDPOINT.to_string(),
            });
        }

        let (client_tx, from_client) = mpsc::unbounded_channel::<Frame>();
        let (to_client, client_rx) = mpsc::unbounded_channel::<TransportResult<Frame>>();

        // The sink keeps only a weak handle so dropping the peer still ends the client stream.
        let pong_tx = to_client.downgrade();
        let switches = self.switches.clone();

        let peer = MemoryPeer {
            from_client,
            to_client,
        };
        if self.peers.send(peer).is_err() {
            return Err(TransportError::Refused {
                stage: "memory-handshake-no-server",
                endpoint: MEMORY_ENDPOINT.to_string(),
            });
        }

        let frame_sink = sink::unfold(
            (client_tx, pong_tx, switches),
            |(client_tx, pong_tx, switches), frame: Frame| async move {
                if frame == Frame::Ping && switches.auto_pong.load(Ordering::SeqCst) {
                    if let Some(pong_tx) = pong_tx.upgrade() {
                        let _ = pong_tx.send(Ok(Frame::Pong));
                    }
                } else if client_tx.send(frame).is_err() {
                    return Err(TransportError::ChannelClosed {
                        stage: "memory-write",
                    });
                }
                Ok((client_tx, pong_tx, switches))
            },
        );

        let frame_stream = stream::unfold(client_rx, |mut client_rx| async move {
            client_rx.recv().await.map(|item| (item, client_rx))
        });

        Ok(Channel::new(Box::pin(frame_sink), Box::pin(frame_stream)))
    }
}

impl Connector for MemoryConnector {
    fn endpoint(&self) -> &str {
        MEMORY_ENDPOINT
    }

    fn connect(&self) -> BoxFuture<'_, TransportResult<Channel>> {
        Box::pin(async move { self.open() })
    }
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.peers.try_recv().ok()
    }

    /// Makes subsequent handshakes fail until switched back.
    pub fn set_refusing(&self, refusing: bool) {
        self.switches.refusing.store(refusing, Ordering::SeqCst);
    }

    /// When disabled, pings reach the peer and nobody answers them.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.switches.auto_pong.store(enabled, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.switches.attempts.load(Ordering::SeqCst)
    }
}

impl MemoryPeer {
    /// Next frame written by the client, or `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.from_client.try_recv().ok()
    }

    pub fn send(&self, frame: Frame) -> bool {
        self.to_client.send(Ok(frame)).is_ok()
    }

    /// Surfaces a transport error on the client's read side.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.to_client
            .send(Err(TransportError::PeerFailure {
                stage: "memory-peer-fail",
                message: message.into(),
            }))
            .is_ok()
    }

    /// Closes the channel from the peer side.
    pub fn close(self) {
        drop(self);
    }
}
