//! # Configuration
//!
//! This module handles the reading and parsing of the main configuration file.
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::certificate_authority::config::Ca;
use crate::forwarding::ForwardingConfig;
use crate::ssh_server::config::SshServerConfig;

/// The main configuration for the jump server.
#[derive(Deserialize, Debug)]
pub struct Config {
    /// The SSH server configuration.
    pub ssh: SshServerConfig,
    /// The trusted Certificate Authority (CA) configuration.
    pub ca: Ca,
    /// Limits for forwarded connections.
    #[serde(default)]
    pub forwarding: ForwardingConfig,
}

/// A trait for inserting the configuration root path into a configuration struct.
///
/// This is used to resolve relative paths in the configuration.
pub(crate) trait InsertConfigRoot {
    /// Inserts the configuration root path into the configuration struct.
    ///
    /// # Arguments
    ///
    /// * `config_root` - The root path of the configuration file.
    fn insert_config_path(&mut self, config_root: &PathBuf) -> Result<()>;
    /// Checks if the paths in the configuration are valid.
    fn check_paths(&self) -> Result<()>;
}

/// Reads and parses the main configuration file.
///
/// Relative key paths are resolved against the directory of the file and
/// both key files must exist.
///
/// # Arguments
///
/// * `file_path` - The path to the configuration file.
pub fn read_config(file_path: &str) -> Result<Config> {
    let config_path = PathBuf::from(file_path);
    if !config_path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Config file {} not found", file_path),
        )
        .into());
    }
    let config_root = config_path
        .parent()
        .map(|parent| parent.to_path_buf())
        .unwrap_or_default();

    let mut config_file = File::open(&config_path)?;
    let mut config = String::new();
    config_file.read_to_string(&mut config)?;

    let mut config: Config =
        toml::from_str(&config).with_context(|| format!("invalid config file {}", file_path))?;
    config.ssh.insert_config_path(&config_root)?;
    config.ca.insert_config_path(&config_root)?;
    config.ssh.check_paths()?;
    config.ca.check_paths()?;

    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn read_config_test() {
        let dir = tempdir().unwrap();
        write_file(&dir, "host_key", "host key data");
        let ca_path = write_file(&dir, "ca.pub", "ca key data");
        let config_path = write_file(
            &dir,
            "config.toml",
            &format!(
                r#"
[ssh]
bind = "127.0.0.1"
port = 2222
private_key = "host_key"
auth_rejection_time = "1s"
inactivity_timeout = "10m"
max_auth_attempts = 3

[ca]
public_key = "{}"
permitted_critical_options = ["verify-required"]

[forwarding]
dial_timeout = "5s"
reject_window = "500ms"
max_sessions = 64
"#,
                ca_path.to_str().unwrap()
            ),
        );

        let config = read_config(config_path.to_str().unwrap()).unwrap();
        assert_eq!(config.ssh.private_key, dir.path().join("host_key"));
        assert_eq!(config.ssh.auth_rejection_time, Duration::from_secs(1));
        assert_eq!(config.ssh.inactivity_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.ssh.max_auth_attempts, 3);
        assert_eq!(config.ca.public_key, ca_path);
        assert_eq!(config.ca.permitted_critical_options, vec!["verify-required"]);
        assert_eq!(config.forwarding.dial_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.forwarding.reject_window, Duration::from_millis(500));
        assert_eq!(config.forwarding.max_sessions, Some(64));
    }

    #[test]
    fn read_config_defaults() {
        let dir = tempdir().unwrap();
        write_file(&dir, "host_key", "host key data");
        write_file(&dir, "ca.pub", "ca key data");
        let config_path = write_file(
            &dir,
            "config.toml",
            r#"
[ssh]
bind = "0.0.0.0"
port = 22

private_key = "host_key"

[ca]
public_key = "ca.pub"
"#,
        );

        let config = read_config(config_path.to_str().unwrap()).unwrap();
        assert_eq!(config.ca.public_key, dir.path().join("ca.pub"));
        assert_eq!(config.ssh.auth_rejection_time, Duration::from_secs(3));
        assert_eq!(config.ssh.inactivity_timeout, Some(Duration::from_secs(3600)));
        assert_eq!(config.ssh.max_auth_attempts, 6);
        assert!(config.ca.permitted_critical_options.is_empty());
        assert!(config.forwarding.dial_timeout.is_none());
        assert_eq!(config.forwarding.reject_window, Duration::from_secs(2));
        assert!(config.forwarding.max_sessions.is_none());
    }

    #[test]
    fn read_config_missing_key_file() {
        let dir = tempdir().unwrap();
        write_file(&dir, "host_key", "host key data");
        let config_path = write_file(
            &dir,
            "config.toml",
            r#"
[ssh]
bind = "0.0.0.0"
port = 22
private_key = "host_key"

[ca]
public_key = "missing.pub"
"#,
        );

        let error = read_config(config_path.to_str().unwrap()).unwrap_err();
        assert!(error.to_string().contains("missing.pub"));
    }

    #[test]
    fn read_config_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        assert!(read_config(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn read_config_rejects_unknown_duration() {
        let dir = tempdir().unwrap();
        write_file(&dir, "host_key", "host key data");
        write_file(&dir, "ca.pub", "ca key data");
        let config_path = write_file(
            &dir,
            "config.toml",
            r#"
[ssh]
bind = "0.0.0.0"
port = 22
private_key = "host_key"
auth_rejection_time = "soon"

[ca]
public_key = "ca.pub"
"#,
        );

        assert!(read_config(config_path.to_str().unwrap()).is_err());
    }
}
