use std::future::Future;
use std::pin::Pin;

use futures::{Sink, Stream};

use super::error::TransportResult;
use super::frame::Frame;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = super::error::TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = TransportResult<Frame>> + Send>>;

/// Both halves of an established channel. The stream ending means the peer closed it.
pub struct Channel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Channel {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Performs the transport handshake for one new channel.
pub trait Connector: Send + Sync {
    fn endpoint(&self) -> &str;
    fn connect(&self) -> BoxFuture<'_, TransportResult<Channel>>;
}
