#![allow(dead_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use russh::client::{AuthResult, Handle};
use russh::keys::ssh_key::certificate::{Builder as CertBuilder, CertType};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{Certificate, PrivateKey};
use tempfile::{TempDir, tempdir};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use ssh_jump_server::certificate_authority::CertificateAuthenticator;
use ssh_jump_server::config::read_config;
use ssh_jump_server::forwarding::ForwardBridge;
use ssh_jump_server::ssh_server::JumpServer;

pub mod client_handler;
use client_handler::ClientHandler;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn random_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

/// Key material and configuration file of a jump server in a temporary directory.
pub struct Fixture {
    pub dir: TempDir,
    pub config_path: PathBuf,
    pub ca_key: PrivateKey,
    pub host_key: PrivateKey,
}

impl Fixture {
    /// Writes `host_key`, `ca.pub` and `config.toml`. `extra` is appended to the
    /// configuration.
    pub fn new(extra: &str) -> Self {
        let dir = tempdir().unwrap();
        let ca_key = random_key();
        let host_key = random_key();

        fs::write(
            dir.path().join("host_key"),
            host_key.to_openssh(LineEnding::LF).unwrap().as_bytes(),
        )
        .unwrap();
        fs::write(
            dir.path().join("ca.pub"),
            ca_key.public_key().to_openssh().unwrap(),
        )
        .unwrap();

        let config_path = dir.path().join("config.toml");
        let config = format!(
            r#"
[ssh]
bind = "127.0.0.1"
port = 0
private_key = "host_key"
auth_rejection_time = "10ms"

[ca]
public_key = "ca.pub"
{}
"#,
            extra
        );
        fs::write(&config_path, config).unwrap();

        Fixture {
            dir,
            config_path,
            ca_key,
            host_key,
        }
    }
}

/// A jump server running on an ephemeral port.
pub struct TestBastion {
    pub fixture: Fixture,
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl TestBastion {
    pub async fn start() -> Self {
        Self::start_with(Fixture::new("")).await
    }

    pub async fn start_with(fixture: Fixture) -> Self {
        init_logging();
        let config = read_config(fixture.config_path.to_str().unwrap()).unwrap();
        let authenticator = CertificateAuthenticator::from_config(&config.ca).unwrap();
        let bridge = ForwardBridge::new(&config.forwarding);
        let mut server =
            JumpServer::new(config.ssh, Arc::new(authenticator), Arc::new(bridge)).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, stop) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            server
                .run_until(listener, async {
                    let _ = stop.await;
                })
                .await
        });

        TestBastion {
            fixture,
            addr,
            shutdown: Some(shutdown),
            server,
        }
    }

    /// A user certificate for `user_key` signed by the trusted CA.
    pub fn user_certificate(&self, user_key: &PrivateKey, principals: &[&str]) -> Certificate {
        sign_user_certificate(&self.fixture.ca_key, user_key, principals, &[])
    }

    pub async fn connect(&self) -> Handle<ClientHandler> {
        let config = Arc::new(russh::client::Config::default());
        let handler = ClientHandler {
            host_key: self.fixture.host_key.public_key().clone(),
        };
        russh::client::connect(config, self.addr, handler)
            .await
            .expect("Failed to connect to server")
    }

    /// Connects and authenticates with `certificate`, returning whether the
    /// server admitted it.
    pub async fn login(
        &self,
        user: &str,
        user_key: &PrivateKey,
        certificate: Certificate,
    ) -> (Handle<ClientHandler>, bool) {
        let mut session = self.connect().await;
        let auth = session
            .authenticate_openssh_cert(user, Arc::new(user_key.clone()), certificate)
            .await
            .expect("Failed to authenticate to server");
        let admitted = matches!(auth, AuthResult::Success);
        (session, admitted)
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let result = tokio::time::timeout(WAIT, &mut self.server).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// A user certificate valid for the next hour.
pub fn sign_user_certificate(
    ca_key: &PrivateKey,
    user_key: &PrivateKey,
    principals: &[&str],
    critical_options: &[(&str, &str)],
) -> Certificate {
    let now = unix_now();
    sign_certificate(
        ca_key,
        user_key,
        CertType::User,
        principals,
        (now - 60, now + 3600),
        critical_options,
    )
}

pub fn sign_certificate(
    ca_key: &PrivateKey,
    user_key: &PrivateKey,
    cert_type: CertType,
    principals: &[&str],
    (valid_after, valid_before): (u64, u64),
    critical_options: &[(&str, &str)],
) -> Certificate {
    let mut builder = CertBuilder::new_with_random_nonce(
        &mut OsRng,
        user_key.public_key(),
        valid_after,
        valid_before,
    )
    .unwrap();
    builder.serial(42).unwrap();
    builder.key_id("integration-test").unwrap();
    builder.cert_type(cert_type).unwrap();
    for principal in principals {
        builder.valid_principal(*principal).unwrap();
    }
    if principals.is_empty() {
        builder.all_principals_valid().unwrap();
    }
    for (name, data) in critical_options {
        builder.critical_option(*name, *data).unwrap();
    }
    builder.extension("permit-port-forwarding", "").unwrap();
    builder.sign(ca_key).unwrap()
}

/// Listener that echoes every connection back to itself.
pub async fn echo_listener() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A listener whose accept queue is full, so further connects hang in the
/// handshake. The returned streams hold the queue slots.
pub async fn stalled_listener() -> (TcpListener, Vec<TcpStream>) {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let addr = listener.local_addr().unwrap();
    let mut queued = Vec::new();
    while let Ok(Ok(stream)) =
        tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await
    {
        queued.push(stream);
        assert!(queued.len() < 64, "accept queue never filled up");
    }
    (listener, queued)
}

/// Reads from `socket` until EOF or error. Returns false on timeout.
pub async fn closes_within(socket: &mut TcpStream, wait: Duration) -> bool {
    let mut buf = [0u8; 4096];
    tokio::time::timeout(wait, async {
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await
    .is_ok()
}
