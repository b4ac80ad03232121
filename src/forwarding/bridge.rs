//! # Forward Bridge
//!
//! Realizes one forwarding session: dial the destination, accept the pending
//! channel and relay bytes in both directions.
//!
//! A dial that settles within the reject window decides the channel-open
//! answer. A slower dial keeps running on its own task so the caller can
//! confirm the channel and return; if that dial fails the channel is closed
//! right after it is accepted.
//!
//! The two copy directions run as independent tasks that share a
//! [`SessionHandle`]. Whichever direction ends first closes the handle, the other
//! direction stops, both write halves are shut down and every endpoint is dropped.
//! A reaper task then runs the channel's close action once.
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinError, JoinHandle};

use super::ForwardingConfig;
use super::request::{ForwardRequest, ParseError};

const BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound for shutting down a write half once the session is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Channel open failure reasons (RFC 4254, section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailureReason {
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

impl OpenFailureReason {
    /// The numeric reason code sent on the wire.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for OpenFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OpenFailureReason::ConnectFailed => "connection failed",
            OpenFailureReason::UnknownChannelType => "unknown channel type",
            OpenFailureReason::ResourceShortage => "resource shortage",
        };
        f.write_str(text)
    }
}

/// Errors that end a forward before any byte is relayed.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Failed to parse channel data: {0}")]
    Malformed(#[from] ParseError),
    #[error("Failed to connect to {destination}: {source}")]
    Dial {
        destination: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to connect to {destination}: timed out after {timeout:?}")]
    DialTimeout {
        destination: String,
        timeout: Duration,
    },
    #[error("Too many forwarding sessions (limit {0})")]
    SessionLimit(usize),
    #[error("channel went away before it was accepted: {0}")]
    Accept(#[source] io::Error),
}

impl ForwardError {
    /// How the channel-open should be rejected, or `None` if the peer already
    /// gave up on it.
    pub fn rejection(&self) -> Option<(OpenFailureReason, String)> {
        match self {
            ForwardError::Malformed(_) => Some((
                OpenFailureReason::ConnectFailed,
                "Failed to parse channel data".to_string(),
            )),
            ForwardError::Dial { .. } | ForwardError::DialTimeout { .. } => {
                Some((OpenFailureReason::ConnectFailed, self.to_string()))
            }
            ForwardError::SessionLimit(_) => {
                Some((OpenFailureReason::ResourceShortage, self.to_string()))
            }
            ForwardError::Accept(_) => None,
        }
    }
}

/// Future that closes the logical channel once the relay has ended.
pub type CloseAction = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A channel the transport has confirmed.
pub struct AcceptedChannel<S> {
    stream: S,
    on_close: Option<CloseAction>,
}

impl<S> AcceptedChannel<S> {
    pub fn new(stream: S) -> Self {
        AcceptedChannel {
            stream,
            on_close: None,
        }
    }

    /// Runs `action` after both relay directions have stopped.
    pub fn on_close<F>(mut self, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.on_close = Some(Box::pin(action));
        self
    }

    /// Drops the stream and runs the close action without relaying.
    async fn abandon(self) {
        drop(self.stream);
        if let Some(on_close) = self.on_close {
            on_close.await;
        }
    }
}

/// A channel-open the transport is holding until the bridge decides.
#[async_trait]
pub trait PendingChannel: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Confirms the channel. Fails if the peer cancelled in the meantime.
    async fn accept(self) -> io::Result<AcceptedChannel<Self::Stream>>;
}

/// Shared fate of the two relay directions.
#[derive(Debug)]
pub struct SessionHandle {
    closed: watch::Sender<bool>,
}

impl SessionHandle {
    fn new() -> Self {
        let (closed, _) = watch::channel(false);
        SessionHandle { closed }
    }

    /// Closes the session. Safe to call any number of times; returns `true`
    /// only for the call that closed it.
    pub fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Byte counts of a finished relay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub to_destination: u64,
    pub to_client: u64,
}

/// A running relay between one channel and one outbound connection.
///
/// Dropping it leaves the relay running.
pub struct RelaySession {
    handle: Arc<SessionHandle>,
    reaper: JoinHandle<RelayStats>,
}

impl RelaySession {
    /// Tears the session down from outside.
    pub fn close(&self) -> bool {
        self.handle.close()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Waits until both endpoints are closed.
    pub async fn finished(self) -> RelayStats {
        self.reaper.await.unwrap_or_default()
    }
}

/// Result of [`ForwardBridge::forward`].
pub enum Forwarding {
    /// The dial finished within the reject window and the relay is running.
    Relaying(RelaySession),
    /// The dial outlasted the reject window. The task accepts the channel once
    /// the dial settles, and closes it again if the dial failed.
    Dialing(JoinHandle<Result<RelaySession, ForwardError>>),
}

/// Dials destinations and splices them onto accepted channels.
#[derive(Debug, Clone)]
pub struct ForwardBridge {
    dial_timeout: Option<Duration>,
    reject_window: Duration,
    sessions: Option<(Arc<Semaphore>, usize)>,
}

impl ForwardBridge {
    pub fn new(config: &ForwardingConfig) -> Self {
        ForwardBridge {
            dial_timeout: config.dial_timeout,
            reject_window: config.reject_window,
            sessions: config
                .max_sessions
                .map(|max| (Arc::new(Semaphore::new(max)), max)),
        }
    }

    /// Opens a TCP connection to the requested destination. No retry.
    pub async fn dial(&self, request: &ForwardRequest) -> Result<TcpStream, ForwardError> {
        let destination = request.destination();
        let connect = TcpStream::connect((
            request.destination_host.as_str(),
            request.destination_port,
        ));
        let result = match self.dial_timeout {
            None => connect.await,
            Some(timeout) => match tokio::time::timeout(timeout, connect).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(ForwardError::DialTimeout {
                        destination,
                        timeout,
                    });
                }
            },
        };
        result.map_err(|source| ForwardError::Dial {
            destination,
            source,
        })
    }

    /// Forwards `pending` to the destination of `request`.
    ///
    /// Returns once the dial has settled or the reject window has passed,
    /// whichever comes first. On error nothing has been accepted and no
    /// outbound connection is left open; the caller rejects the channel
    /// according to [`ForwardError::rejection`]. On [`Forwarding::Dialing`]
    /// the caller confirms the channel.
    pub async fn forward<C: PendingChannel>(
        &self,
        request: ForwardRequest,
        pending: C,
    ) -> Result<Forwarding, ForwardError> {
        let permit = self.reserve_session()?;
        let bridge = self.clone();
        let target = request.clone();
        let mut dial = tokio::spawn(async move { bridge.dial(&target).await });

        match tokio::time::timeout(self.reject_window, &mut dial).await {
            Ok(joined) => {
                let outbound = dial_result(&request, joined)?;
                splice(&request, pending, outbound, permit)
                    .await
                    .map(Forwarding::Relaying)
            }
            Err(_) => {
                debug!(
                    "dial to {} still pending after {}, confirming the channel",
                    request.destination(),
                    humantime::format_duration(self.reject_window)
                );
                Ok(Forwarding::Dialing(tokio::spawn(async move {
                    match dial_result(&request, dial.await) {
                        Ok(outbound) => splice(&request, pending, outbound, permit).await,
                        Err(e) => {
                            warn!(
                                "closing confirmed channel to {}: {}",
                                request.destination(),
                                e
                            );
                            if let Ok(accepted) = pending.accept().await {
                                accepted.abandon().await;
                            }
                            Err(e)
                        }
                    }
                })))
            }
        }
    }

    fn reserve_session(&self) -> Result<Option<OwnedSemaphorePermit>, ForwardError> {
        match &self.sessions {
            None => Ok(None),
            Some((semaphore, max)) => semaphore
                .clone()
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| ForwardError::SessionLimit(*max)),
        }
    }
}

fn dial_result(
    request: &ForwardRequest,
    joined: Result<Result<TcpStream, ForwardError>, JoinError>,
) -> Result<TcpStream, ForwardError> {
    joined.unwrap_or_else(|e| {
        Err(ForwardError::Dial {
            destination: request.destination(),
            source: io::Error::other(e),
        })
    })
}

/// Accepts `pending` and relays it to the connected `outbound` stream.
async fn splice<C: PendingChannel>(
    request: &ForwardRequest,
    pending: C,
    outbound: TcpStream,
    permit: Option<OwnedSemaphorePermit>,
) -> Result<RelaySession, ForwardError> {
    let accepted = match pending.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
            drop(outbound);
            debug!(
                "channel to {} cancelled before accept: {}",
                request.destination(),
                e
            );
            return Err(ForwardError::Accept(e));
        }
    };

    let resolved = outbound
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| request.destination());
    info!(
        "Proxying connection from {} to {} ({})",
        request.originator(),
        request.destination(),
        resolved
    );
    let label = format!("{} -> {}", request.originator(), resolved);
    Ok(relay(accepted, outbound, permit, label))
}

fn relay<S>(
    accepted: AcceptedChannel<S>,
    outbound: TcpStream,
    permit: Option<OwnedSemaphorePermit>,
    label: String,
) -> RelaySession
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let AcceptedChannel { stream, on_close } = accepted;
    let handle = Arc::new(SessionHandle::new());
    let started = Instant::now();

    let (channel_read, channel_write) = tokio::io::split(stream);
    let (outbound_read, outbound_write) = outbound.into_split();
    let upstream = tokio::spawn(pump(
        channel_read,
        outbound_write,
        handle.clone(),
        "client -> destination",
    ));
    let downstream = tokio::spawn(pump(
        outbound_read,
        channel_write,
        handle.clone(),
        "destination -> client",
    ));

    let reaper = tokio::spawn(async move {
        let stats = RelayStats {
            to_destination: upstream.await.unwrap_or(0),
            to_client: downstream.await.unwrap_or(0),
        };
        if let Some(on_close) = on_close {
            on_close.await;
        }
        drop(permit);
        let elapsed = Duration::from_millis(started.elapsed().as_millis() as u64);
        debug!(
            "session {} closed after {} ({} bytes to destination, {} bytes to client)",
            label,
            humantime::format_duration(elapsed),
            stats.to_destination,
            stats.to_client
        );
        stats
    });

    RelaySession { handle, reaper }
}

/// Copies one direction until EOF, an error, or the session closing, then
/// closes the session and shuts down the write half it owns.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    session: Arc<SessionHandle>,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0;
    tokio::select! {
        result = copy_counting(&mut reader, &mut writer, &mut copied) => match result {
            Ok(()) => trace!("{}: end of stream", direction),
            Err(e) => trace!("{}: {}", direction, e),
        },
        _ = session.closed() => trace!("{}: session closed", direction),
    }
    session.close();
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
    copied
}

async fn copy_counting<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}
