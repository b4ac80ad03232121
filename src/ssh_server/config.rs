//! # SSH Server Configuration
//!
//! This module defines the configuration for the SSH listener.
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::config::InsertConfigRoot;

fn default_auth_rejection_time() -> Duration {
    Duration::from_secs(3)
}

fn default_inactivity_timeout() -> Option<Duration> {
    Some(Duration::from_secs(3600))
}

fn default_max_auth_attempts() -> usize {
    6
}

/// Configuration for the SSH server.
#[derive(Deserialize, Debug, Clone)]
pub struct SshServerConfig {
    /// The address to bind the SSH server to.
    pub bind: String,
    /// The port to bind the SSH server to.
    pub port: u16,
    /// The path to the server's private host key.
    pub private_key: PathBuf,
    /// Delay before answering a failed authentication attempt.
    #[serde(
        default = "default_auth_rejection_time",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub auth_rejection_time: Duration,
    /// Idle connections are dropped after this time.
    #[serde(
        default = "default_inactivity_timeout",
        deserialize_with = "duration_str::deserialize_option_duration"
    )]
    pub inactivity_timeout: Option<Duration>,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: usize,
}

impl InsertConfigRoot for SshServerConfig {
    /// Resolves the host key path relative to the configuration file.
    fn insert_config_path(&mut self, config_root: &PathBuf) -> Result<()> {
        if !self.private_key.has_root() {
            let mut host_key_path = config_root.clone();
            host_key_path.push(&self.private_key);
            self.private_key = host_key_path;
        }
        Ok(())
    }

    fn check_paths(&self) -> Result<()> {
        if self.private_key.exists() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("host key file {:?} not found", self.private_key),
            )
            .into())
        }
    }
}
