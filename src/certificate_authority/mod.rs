//! # Certificate Authority
//!
//! This module holds the root of trust of the jump server: the public key of the
//! certificate authority whose user certificates are admitted. It also classifies
//! the key material a client offers during authentication.
use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::debug;
use ssh_key::certificate::CertType;
use ssh_key::public::KeyData;
use ssh_key::{Certificate, Fingerprint, HashAlg, PublicKey};
use thiserror::Error;

/// The admission gate for offered credentials.
pub mod authenticator;
/// Configuration types for the trusted authority.
pub mod config;

pub use authenticator::{AuthContext, CertificateAuthenticator, DenyReason};

/// Errors that can occur while loading the trusted authority.
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// The CA key file could not be read.
    #[error("failed to read CA public key {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// The CA key is not a valid OpenSSH public key.
    #[error("invalid CA public key: {0}")]
    InvalidKey(#[from] ssh_key::Error),
}

/// The certificate authority trusted to sign user certificates.
///
/// Built once at startup and shared read-only between all connections.
#[derive(Debug, Clone)]
pub struct TrustedAuthority {
    public_key: PublicKey,
    fingerprint: Fingerprint,
}

impl TrustedAuthority {
    /// Creates a `TrustedAuthority` from an OpenSSH public key line, e.g. the
    /// content of `ca.pub`.
    pub fn from_openssh(openssh_key: &str) -> Result<Self, AuthorityError> {
        let public_key = PublicKey::from_openssh(openssh_key.trim())?;
        let fingerprint = public_key.fingerprint(HashAlg::Sha256);
        debug!("trusted CA fingerprint: {}", fingerprint);
        Ok(TrustedAuthority {
            public_key,
            fingerprint,
        })
    }

    /// Reads the CA public key from a file.
    pub fn from_file(path: &Path) -> Result<Self, AuthorityError> {
        let io_error = |source| AuthorityError::Io {
            path: path.to_string_lossy().to_string(),
            source,
        };
        let mut key_file = File::open(path).map_err(io_error)?;
        let mut openssh_key = String::new();
        key_file.read_to_string(&mut openssh_key).map_err(io_error)?;
        Self::from_openssh(&openssh_key)
    }

    /// The raw key data of the CA key.
    pub fn key_data(&self) -> &KeyData {
        self.public_key.key_data()
    }

    /// The SHA-256 fingerprint of the CA key.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Returns `true` if `certificate` names this authority as its signer.
    ///
    /// This only compares keys, the signature itself is verified by the
    /// authenticator.
    pub fn is_signer_of(&self, certificate: &Certificate) -> bool {
        certificate.signature_key() == self.key_data()
    }
}

/// The key material a client offered during authentication, decoded into the
/// shapes the gate distinguishes.
#[derive(Debug, Clone)]
pub enum OfferedCredential {
    /// A bare public key without a certificate.
    PlainKey,
    /// A certificate of type user.
    UserCertificate(Certificate),
    /// A certificate of type host.
    HostCertificate(Certificate),
    /// Anything that is neither a public key nor a certificate.
    Unparseable(String),
}

const UNREPRESENTABLE_VALIDITY: &str =
    "certificate validity period out of range (certificates valid forever are not supported)";

impl OfferedCredential {
    /// Decodes an offered key from its OpenSSH text form
    /// (`<algorithm> <base64> [comment]`).
    pub fn from_openssh(openssh_key: &str) -> Self {
        match Certificate::from_openssh(openssh_key) {
            Ok(certificate) if certificate.cert_type() == CertType::User => {
                OfferedCredential::UserCertificate(certificate)
            }
            Ok(certificate) => OfferedCredential::HostCertificate(certificate),
            // Timestamps above i64::MAX, such as the "forever" valid_before
            // written by `ssh-keygen -s` without `-V`, cannot be decoded.
            Err(ssh_key::Error::Time) => {
                OfferedCredential::Unparseable(UNREPRESENTABLE_VALIDITY.to_string())
            }
            Err(cert_error) => match PublicKey::from_openssh(openssh_key) {
                Ok(_) => OfferedCredential::PlainKey,
                Err(_) => OfferedCredential::Unparseable(cert_error.to_string()),
            },
        }
    }

    /// A short name of the variant, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            OfferedCredential::PlainKey => "plain key",
            OfferedCredential::UserCertificate(_) => "user certificate",
            OfferedCredential::HostCertificate(_) => "host certificate",
            OfferedCredential::Unparseable(_) => "unparseable key",
        }
    }
}
