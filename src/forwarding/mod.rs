//! # Forwarding
//!
//! This module turns `direct-tcpip` channels into TCP connections: the request
//! payload is decoded by [`request`], and [`bridge`] dials the destination and
//! relays bytes until either side closes.
use std::time::Duration;

use serde::Deserialize;

pub mod bridge;
pub mod request;

pub use bridge::{
    AcceptedChannel, ForwardBridge, ForwardError, Forwarding, OpenFailureReason, PendingChannel,
    RelaySession, RelayStats, SessionHandle,
};
pub use request::{ForwardRequest, ParseError, direct_tcpip_payload};

/// How long a channel-open waits for its dial before the channel is confirmed.
pub const DEFAULT_REJECT_WINDOW: Duration = Duration::from_secs(2);

fn default_reject_window() -> Duration {
    DEFAULT_REJECT_WINDOW
}

/// Settings for outbound connections. The hardening knobs are off unless
/// configured.
#[derive(Deserialize, Debug, Clone)]
pub struct ForwardingConfig {
    /// Gives up on a destination that does not answer within this time.
    #[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
    pub dial_timeout: Option<Duration>,
    /// A dial that settles within this window decides whether the channel is
    /// confirmed or rejected. Slower dials continue after the channel has been
    /// confirmed, and a late failure closes it.
    #[serde(
        default = "default_reject_window",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub reject_window: Duration,
    /// Maximum number of concurrently relayed channels across all clients.
    #[serde(default)]
    pub max_sessions: Option<usize>,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        ForwardingConfig {
            dial_timeout: None,
            reject_window: DEFAULT_REJECT_WINDOW,
            max_sessions: None,
        }
    }
}
