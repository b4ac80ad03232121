//! # Certificate Authenticator
//!
//! The admission gate of the jump server. Every key a client offers during
//! authentication is checked here, and only user certificates issued by the
//! trusted CA for the connecting user are admitted.
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};
use ssh_key::{Certificate, HashAlg};
use thiserror::Error;

use super::{AuthorityError, OfferedCredential, TrustedAuthority, config};

/// Critical option restricting the addresses a certificate may be used from.
const SOURCE_ADDRESS: &str = "source-address";

/// Largest timestamp humantime can render as RFC 3339 (9999-12-31T23:59:59Z).
const MAX_RFC3339_SECS: u64 = 253_402_300_799;

/// The connection a credential is offered on.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    /// The username the client is logging in as.
    pub user: &'a str,
    /// The address of the client, if the transport knows it.
    pub peer: Option<IpAddr>,
}

/// Why an offered credential was not admitted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DenyReason {
    #[error("offered key is not a certificate")]
    NotACertificate,
    #[error("offered key could not be parsed: {0}")]
    Unparseable(String),
    #[error("certificate is a host certificate")]
    HostCertificate,
    #[error("certificate is not signed by the trusted CA (signer {0})")]
    UntrustedSigner(String),
    #[error("user {0} is not a principal of the certificate")]
    PrincipalMismatch(String),
    #[error("certificate is not valid before {0}")]
    NotYetValid(String),
    #[error("certificate expired at {0}")]
    Expired(String),
    #[error("unsupported critical option {0}")]
    UnsupportedCriticalOption(String),
    #[error("source address {0} is not permitted by the certificate")]
    SourceAddressMismatch(String),
    #[error("malformed source-address option {0:?}")]
    InvalidSourceAddress(String),
    #[error("certificate signature is invalid: {0}")]
    InvalidSignature(String),
}

/// Decides whether an offered credential is admitted.
///
/// The authenticator is stateless apart from the shared [`TrustedAuthority`], so
/// one instance serves every connection.
#[derive(Debug, Clone)]
pub struct CertificateAuthenticator {
    authority: Arc<TrustedAuthority>,
    permitted_critical_options: Vec<String>,
}

impl CertificateAuthenticator {
    /// Creates a new `CertificateAuthenticator`.
    ///
    /// # Arguments
    ///
    /// * `authority` - The CA whose user certificates are admitted.
    /// * `permitted_critical_options` - Critical options accepted without
    ///   enforcement. Any other option except `source-address` denies.
    pub fn new(authority: Arc<TrustedAuthority>, permitted_critical_options: Vec<String>) -> Self {
        CertificateAuthenticator {
            authority,
            permitted_critical_options,
        }
    }

    /// Loads the CA key named in the configuration and builds the authenticator.
    pub fn from_config(ca_config: &config::Ca) -> Result<Self, AuthorityError> {
        let authority = TrustedAuthority::from_file(&ca_config.public_key)?;
        info!("trusting user certificates signed by {}", authority.fingerprint());
        Ok(Self::new(
            Arc::new(authority),
            ca_config.permitted_critical_options.clone(),
        ))
    }

    /// The trusted authority.
    pub fn authority(&self) -> &TrustedAuthority {
        &self.authority
    }

    /// Checks `credential` against the current system time.
    pub fn authenticate(&self, ctx: &AuthContext, credential: &OfferedCredential) -> bool {
        self.authenticate_at(ctx, credential, unix_now())
    }

    /// Checks `credential` at the given unix time and logs the outcome.
    pub fn authenticate_at(
        &self,
        ctx: &AuthContext,
        credential: &OfferedCredential,
        now: u64,
    ) -> bool {
        match self.check(ctx, credential, now) {
            Ok(certificate) => {
                info!(
                    "accepted certificate {:?} (serial {}) for user {}",
                    certificate.key_id(),
                    certificate.serial(),
                    ctx.user
                );
                true
            }
            Err(reason) => {
                warn!(
                    "denied {} for user {}: {}",
                    credential.kind(),
                    ctx.user,
                    reason
                );
                false
            }
        }
    }

    /// Runs every check and returns the admitted certificate, or the first
    /// reason to deny it.
    pub fn check<'c>(
        &self,
        ctx: &AuthContext,
        credential: &'c OfferedCredential,
        now: u64,
    ) -> Result<&'c Certificate, DenyReason> {
        let certificate = match credential {
            OfferedCredential::PlainKey => return Err(DenyReason::NotACertificate),
            OfferedCredential::Unparseable(e) => return Err(DenyReason::Unparseable(e.clone())),
            OfferedCredential::HostCertificate(_) => return Err(DenyReason::HostCertificate),
            OfferedCredential::UserCertificate(certificate) => certificate,
        };

        if !self.authority.is_signer_of(certificate) {
            return Err(DenyReason::UntrustedSigner(
                certificate
                    .signature_key()
                    .fingerprint(HashAlg::Sha256)
                    .to_string(),
            ));
        }

        check_principals(certificate, ctx.user)?;
        check_validity_window(certificate, now)?;
        self.check_critical_options(certificate, ctx.peer)?;

        certificate
            .validate_at(now, [self.authority.fingerprint()])
            .map_err(|e| DenyReason::InvalidSignature(e.to_string()))?;

        Ok(certificate)
    }

    fn check_critical_options(
        &self,
        certificate: &Certificate,
        peer: Option<IpAddr>,
    ) -> Result<(), DenyReason> {
        for (name, value) in certificate.critical_options().iter() {
            if name == SOURCE_ADDRESS {
                check_source_address(value, peer)?;
            } else if !self.permitted_critical_options.iter().any(|o| o == name) {
                return Err(DenyReason::UnsupportedCriticalOption(name.clone()));
            }
        }
        Ok(())
    }
}

/// An empty principal list admits every user.
fn check_principals(certificate: &Certificate, user: &str) -> Result<(), DenyReason> {
    let principals = certificate.valid_principals();
    if principals.is_empty() || principals.iter().any(|p| p == user) {
        Ok(())
    } else {
        Err(DenyReason::PrincipalMismatch(user.to_string()))
    }
}

fn check_validity_window(certificate: &Certificate, now: u64) -> Result<(), DenyReason> {
    if now < certificate.valid_after() {
        return Err(DenyReason::NotYetValid(format_timestamp(
            certificate.valid_after(),
        )));
    }
    if now >= certificate.valid_before() {
        return Err(DenyReason::Expired(format_timestamp(
            certificate.valid_before(),
        )));
    }
    Ok(())
}

fn check_source_address(allowed: &str, peer: Option<IpAddr>) -> Result<(), DenyReason> {
    let peer = peer
        .ok_or_else(|| DenyReason::SourceAddressMismatch("unknown".to_string()))?
        .to_canonical();
    let mut permitted = false;
    for entry in allowed.split(',') {
        match address_matches(entry.trim(), peer) {
            Some(true) => permitted = true,
            Some(false) => {}
            None => return Err(DenyReason::InvalidSourceAddress(allowed.to_string())),
        }
    }
    if permitted {
        Ok(())
    } else {
        Err(DenyReason::SourceAddressMismatch(peer.to_string()))
    }
}

/// Matches `peer` against an address or CIDR block. `None` if `entry` is malformed.
fn address_matches(entry: &str, peer: IpAddr) -> Option<bool> {
    let (address, prefix) = match entry.split_once('/') {
        Some((address, prefix)) => (address, Some(prefix.parse::<u32>().ok()?)),
        None => (entry, None),
    };
    match (address.parse::<IpAddr>().ok()?, peer) {
        (IpAddr::V4(network), peer) => {
            let prefix = prefix.unwrap_or(32);
            if prefix > 32 {
                return None;
            }
            let IpAddr::V4(peer) = peer else {
                return Some(false);
            };
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            Some(u32::from(network) & mask == u32::from(peer) & mask)
        }
        (IpAddr::V6(network), peer) => {
            let prefix = prefix.unwrap_or(128);
            if prefix > 128 {
                return None;
            }
            let IpAddr::V6(peer) = peer else {
                return Some(false);
            };
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            Some(u128::from(network) & mask == u128::from(peer) & mask)
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn format_timestamp(secs: u64) -> String {
    if secs > MAX_RFC3339_SECS {
        return secs.to_string();
    }
    humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(secs)).to_string()
}
