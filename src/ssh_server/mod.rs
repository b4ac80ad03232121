//! # SSH Jump Server
//!
//! This module provides the SSH side of the jump host: the accept loop, the
//! russh configuration and the per-connection handler. Clients authenticate
//! with a user certificate and may then open `direct-tcpip` channels, which
//! are relayed to their destination. Every other channel type is rejected.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use russh::keys::ssh_key::HashAlg;
use russh::keys::{Certificate, PrivateKey, PublicKey};
use russh::server::{Auth, Handler, Msg, Server, Session};
use russh::{Channel, MethodKind, MethodSet};
use tokio::net::TcpListener;

use crate::certificate_authority::{AuthContext, CertificateAuthenticator, OfferedCredential};
use crate::forwarding::{ForwardBridge, direct_tcpip_payload};

pub mod config;
pub mod dispatch;
use config::SshServerConfig;
use dispatch::{
    ChannelHandlers, ChannelOpenOutcome, ChannelOpenRequest, DIRECT_TCPIP, DirectTcpipHandler,
};

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The jump server.
///
/// Holds everything connections share: the configuration, the host key, the
/// certificate authenticator and the channel dispatch table.
pub struct JumpServer {
    config: SshServerConfig,
    host_key: PrivateKey,
    authenticator: Arc<CertificateAuthenticator>,
    channel_handlers: Arc<ChannelHandlers<ChannelOpenRequest>>,
    client_ids: usize,
}

/// A handler for a single client connection.
pub struct ConnectionHandler {
    id: usize,
    peer: Option<SocketAddr>,
    username: Option<String>,
    authenticator: Arc<CertificateAuthenticator>,
    channel_handlers: Arc<ChannelHandlers<ChannelOpenRequest>>,
}

impl JumpServer {
    /// Creates a new `JumpServer` and loads its host key.
    ///
    /// # Arguments
    ///
    /// * `config` - The SSH server configuration.
    /// * `authenticator` - Decides which offered certificates are admitted.
    /// * `bridge` - Relays accepted `direct-tcpip` channels.
    pub fn new(
        config: SshServerConfig,
        authenticator: Arc<CertificateAuthenticator>,
        bridge: Arc<ForwardBridge>,
    ) -> Result<Self> {
        let host_key = russh::keys::load_secret_key(&config.private_key, None)
            .with_context(|| format!("failed to load host key {:?}", config.private_key))?;
        info!(
            "loaded host key {:?} ({})",
            config.private_key,
            host_key.public_key().fingerprint(HashAlg::Sha256)
        );

        let mut channel_handlers: ChannelHandlers<ChannelOpenRequest> = ChannelHandlers::new();
        channel_handlers.register(DIRECT_TCPIP, Arc::new(DirectTcpipHandler::new(bridge)));

        Ok(JumpServer {
            config,
            host_key,
            authenticator,
            channel_handlers: Arc::new(channel_handlers),
            client_ids: 0,
        })
    }

    /// The russh configuration: public key authentication only.
    pub fn russh_config(&self) -> russh::server::Config {
        let mut auth_methods = MethodSet::empty();
        auth_methods.push(MethodKind::PublicKey);

        russh::server::Config {
            inactivity_timeout: self.config.inactivity_timeout,
            auth_rejection_time: self.config.auth_rejection_time,
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            max_auth_attempts: self.config.max_auth_attempts,
            methods: auth_methods,
            keys: vec![self.host_key.clone()],
            preferred: russh::Preferred::default(),
            ..Default::default()
        }
    }

    /// Listens on the configured address until Ctrl-C.
    pub async fn run(&mut self) -> Result<()> {
        let listener = TcpListener::bind((self.config.bind.as_str(), self.config.port))
            .await
            .with_context(|| {
                format!("failed to bind {}:{}", self.config.bind, self.config.port)
            })?;
        self.run_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("received Ctrl-C");
        })
        .await
    }

    /// Accepts connections on `listener` until `shutdown` resolves.
    ///
    /// Each connection runs on its own task. Sessions that are already
    /// established keep running after shutdown.
    pub async fn run_until<F>(&mut self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let ssh_config = Arc::new(self.russh_config());
        info!("starting ssh server at {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("no longer accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = self.new_client(Some(peer));
                        let ssh_config = ssh_config.clone();
                        tokio::spawn(async move {
                            let _ = stream.set_nodelay(true);
                            match russh::server::run_stream(ssh_config, stream, handler).await {
                                Ok(session) => {
                                    if let Err(e) = session.await {
                                        debug!("connection from {} ended: {}", peer, e);
                                    }
                                }
                                Err(e) => warn!("SSH handshake with {} failed: {}", peer, e),
                            }
                        });
                    }
                    Err(e) => {
                        warn!("failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }
}

impl Server for JumpServer {
    type Handler = ConnectionHandler;

    /// Creates a new `ConnectionHandler` for a new client connection.
    fn new_client(&mut self, peer: Option<SocketAddr>) -> ConnectionHandler {
        self.client_ids += 1;
        match peer {
            Some(peer) => debug!("new client {}: {}", self.client_ids, peer),
            None => debug!("new client {}: unknown address", self.client_ids),
        }
        ConnectionHandler {
            id: self.client_ids,
            peer,
            username: None,
            authenticator: self.authenticator.clone(),
            channel_handlers: self.channel_handlers.clone(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        warn!("Session error: {}", error);
    }
}

impl ConnectionHandler {
    fn authenticate(&mut self, user: &str, credential: OfferedCredential) -> Auth {
        let ctx = AuthContext {
            user,
            peer: self.peer.map(|peer| peer.ip()),
        };
        if self.authenticator.authenticate(&ctx, &credential) {
            self.username = Some(user.to_string());
            Auth::Accept
        } else {
            Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }
        }
    }

    /// Routes a channel-open through the dispatch table. russh can only answer
    /// yes or no and always reports "administratively prohibited: Rejected", so
    /// the reject reason and message are logged here.
    async fn open_channel(&self, channel_type: &str, request: ChannelOpenRequest) -> bool {
        match self.channel_handlers.dispatch(channel_type, request).await {
            ChannelOpenOutcome::Accepted => true,
            ChannelOpenOutcome::Rejected(reason, message) => {
                warn!(
                    "client {} ({}): rejected {} channel, {} ({}): {}",
                    self.id,
                    self.username.as_deref().unwrap_or("-"),
                    channel_type,
                    reason,
                    reason.code(),
                    message
                );
                false
            }
            ChannelOpenOutcome::Cancelled => false,
        }
    }
}

impl Handler for ConnectionHandler {
    type Error = russh::Error;

    /// Plain public keys are never admitted, only logged and rejected.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let credential = match key.to_openssh() {
            Ok(openssh_key) => OfferedCredential::from_openssh(&openssh_key),
            Err(e) => OfferedCredential::Unparseable(e.to_string()),
        };
        Ok(self.authenticate(user, credential))
    }

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        let credential = match certificate.to_openssh() {
            Ok(openssh_cert) => OfferedCredential::from_openssh(&openssh_cert),
            Err(e) => OfferedCredential::Unparseable(e.to_string()),
        };
        Ok(self.authenticate(user, credential))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let request = ChannelOpenRequest {
            channel,
            handle: session.handle(),
            payload: Vec::new(),
        };
        Ok(self.open_channel("session", request).await)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let request = ChannelOpenRequest {
            channel,
            handle: session.handle(),
            payload: direct_tcpip_payload(
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            ),
        };
        Ok(self.open_channel(DIRECT_TCPIP, request).await)
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        debug!("client {} disconnected", self.id);
    }
}
