//! # Channel Dispatch
//!
//! Routes channel-open requests by channel type. Types without a registered
//! handler are rejected with "unknown channel type".
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelStream};

use crate::forwarding::{
    AcceptedChannel, ForwardBridge, ForwardError, ForwardRequest, OpenFailureReason,
    PendingChannel,
};

/// Channel type of TCP/IP forwarding requested by the client (`ssh -L`, `ssh -J`).
pub const DIRECT_TCPIP: &str = "direct-tcpip";

/// Result of handling one channel-open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpenOutcome {
    Accepted,
    Rejected(OpenFailureReason, String),
    /// The peer went away before the channel could be accepted.
    Cancelled,
}

impl From<ForwardError> for ChannelOpenOutcome {
    fn from(error: ForwardError) -> Self {
        match error.rejection() {
            Some((reason, message)) => ChannelOpenOutcome::Rejected(reason, message),
            None => ChannelOpenOutcome::Cancelled,
        }
    }
}

/// A handler for one channel type.
#[async_trait]
pub trait ChannelOpenHandler<R>: Send + Sync {
    async fn open(&self, request: R) -> ChannelOpenOutcome;
}

/// Table from channel-type string to handler.
pub struct ChannelHandlers<R> {
    handlers: HashMap<&'static str, Arc<dyn ChannelOpenHandler<R>>>,
}

impl<R: Send + 'static> ChannelHandlers<R> {
    pub fn new() -> Self {
        ChannelHandlers {
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for `channel_type`, replacing any previous one.
    pub fn register(&mut self, channel_type: &'static str, handler: Arc<dyn ChannelOpenHandler<R>>) {
        self.handlers.insert(channel_type, handler);
    }

    pub fn is_registered(&self, channel_type: &str) -> bool {
        self.handlers.contains_key(channel_type)
    }

    pub async fn dispatch(&self, channel_type: &str, request: R) -> ChannelOpenOutcome {
        match self.handlers.get(channel_type) {
            Some(handler) => handler.open(request).await,
            None => ChannelOpenOutcome::Rejected(
                OpenFailureReason::UnknownChannelType,
                format!("Unsupported channel type {}", channel_type),
            ),
        }
    }
}

impl<R: Send + 'static> Default for ChannelHandlers<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// A channel-open as delivered by russh.
pub struct ChannelOpenRequest {
    pub channel: Channel<Msg>,
    pub handle: Handle,
    /// The raw type-specific channel-open data.
    pub payload: Vec<u8>,
}

/// russh confirms the channel once the handler returns, so accepting only
/// wraps it into a byte stream.
pub struct RusshPendingChannel {
    channel: Channel<Msg>,
    handle: Handle,
}

#[async_trait]
impl PendingChannel for RusshPendingChannel {
    type Stream = ChannelStream<Msg>;

    async fn accept(self) -> io::Result<AcceptedChannel<Self::Stream>> {
        let id = self.channel.id();
        let handle = self.handle;
        Ok(
            AcceptedChannel::new(self.channel.into_stream()).on_close(async move {
                let _ = handle.close(id).await;
            }),
        )
    }
}

/// Forwards `direct-tcpip` channels through the bridge.
pub struct DirectTcpipHandler {
    bridge: Arc<ForwardBridge>,
}

impl DirectTcpipHandler {
    pub fn new(bridge: Arc<ForwardBridge>) -> Self {
        DirectTcpipHandler { bridge }
    }
}

#[async_trait]
impl ChannelOpenHandler<ChannelOpenRequest> for DirectTcpipHandler {
    async fn open(&self, request: ChannelOpenRequest) -> ChannelOpenOutcome {
        let forward = match ForwardRequest::decode(&request.payload) {
            Ok(forward) => forward,
            Err(e) => {
                debug!("malformed direct-tcpip request: {}", e);
                return ForwardError::from(e).into();
            }
        };
        let pending = RusshPendingChannel {
            channel: request.channel,
            handle: request.handle,
        };
        match self.bridge.forward(forward, pending).await {
            Ok(_forwarding) => ChannelOpenOutcome::Accepted,
            Err(e) => e.into(),
        }
    }
}
