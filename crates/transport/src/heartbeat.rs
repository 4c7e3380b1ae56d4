use std::sync::Weak;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use super::connector::Channel;
use super::frame::Frame;
use super::manager::{CloseReason, ConnectionEvent, Shared};

/// Timing knobs for the liveness loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTiming {
    pub interval: Duration,
    pub watchdog_interval: Duration,
    pub timeout: Duration,
}

/// Owns one live channel: pumps outbound frames, probes liveness, forwards inbound events.
pub(crate) struct ChannelWorker {
    pub(crate) generation: u64,
    pub(crate) channel: Channel,
    pub(crate) outbound: mpsc::UnboundedReceiver<Frame>,
    pub(crate) shutdown: oneshot::Receiver<()>,
    pub(crate) events: mpsc::UnboundedSender<ConnectionEvent>,
    pub(crate) timing: HeartbeatTiming,
    pub(crate) shared: Weak<Shared>,
}

impl ChannelWorker {
    pub(crate) async fn run(self) {
        let Self {
            generation,
            channel,
            mut outbound,
            mut shutdown,
            events,
            timing,
            shared,
        } = self;
        let Channel {
            mut sink,
            mut stream,
        } = channel;

        let started = Instant::now();
        let mut heartbeat = interval_at(started + timing.interval, timing.interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watchdog = interval_at(
            started + timing.watchdog_interval,
            timing.watchdog_interval,
        );
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = started;

        let reason = loop {
            tokio::select! {
                _ = &mut shutdown => break CloseReason::Requested,
                _ = heartbeat.tick() => {
                    tracing::debug!(generation, "sending heartbeat ping");
                    if let Err(error) = sink.send(Frame::Ping).await {
                        break CloseReason::TransportError(error.to_string());
                    }
                }
                _ = watchdog.tick() => {
                    let silent_for = last_seen.elapsed();
                    if silent_for > timing.timeout {
                        tracing::warn!(
                            generation,
                            silent_for_ms = silent_for.as_millis() as u64,
                            "no heartbeat acknowledgment within timeout; closing channel"
                        );
                        break CloseReason::HeartbeatTimeout;
                    }
                }
                Some(frame) = outbound.recv() => {
                    let event = frame.name();
                    if let Err(error) = sink.send(frame).await {
                        tracing::warn!(generation, event, error = %error, "failed to write frame");
                        break CloseReason::TransportError(error.to_string());
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Frame::Pong)) => {
                        last_seen = Instant::now();
                        tracing::debug!(generation, "received heartbeat pong");
                    }
                    Some(Ok(Frame::Ping)) => {
                        if let Err(error) = sink.send(Frame::Pong).await {
                            break CloseReason::TransportError(error.to_string());
                        }
                    }
                    Some(Ok(Frame::Message(turn))) => {
                        let _ = events.send(ConnectionEvent::Message(turn));
                    }
                    Some(Ok(Frame::Error(payload))) => {
                        let _ = events.send(ConnectionEvent::RemoteError(payload.message));
                    }
                    Some(Err(error)) => {
                        tracing::warn!(generation, error = %error, "channel read failed");
                        break CloseReason::TransportError(error.to_string());
                    }
                    None => break CloseReason::PeerClosed,
                },
            }
        };

        if matches!(reason, CloseReason::Requested | CloseReason::HeartbeatTimeout) {
            let _ = sink.close().await;
        }
        drop(stream);

        if reason == CloseReason::Requested {
            return;
        }

        if let Some(shared) = shared.upgrade() {
            shared.channel_closed(generation, reason);
        }
    }
}
