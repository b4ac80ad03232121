//! # CA Configuration
//!
//! This module defines the configuration of the trusted certificate authority.
use std::io;
use std::path::PathBuf;

use anyhow::Result;
use serde::Deserialize;

use crate::config::InsertConfigRoot;

/// Configuration for the trusted Certificate Authority.
#[derive(Deserialize, Debug, Clone)]
pub struct Ca {
    /// The path to the CA's public key in OpenSSH format.
    pub public_key: PathBuf,
    /// Critical options that are accepted on user certificates without being
    /// enforced. `source-address` is always enforced and need not be listed.
    #[serde(default)]
    pub permitted_critical_options: Vec<String>,
}

impl InsertConfigRoot for Ca {
    /// Resolves the CA key path relative to the configuration file.
    fn insert_config_path(&mut self, config_root: &PathBuf) -> Result<()> {
        if !self.public_key.has_root() {
            let mut ca_key_path = config_root.clone();
            ca_key_path.push(&self.public_key);
            self.public_key = ca_key_path;
        }
        Ok(())
    }

    fn check_paths(&self) -> Result<()> {
        if self.public_key.exists() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("CA public key file {:?} not found", self.public_key),
            )
            .into())
        }
    }
}
