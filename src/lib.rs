use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

pub mod certificate_authority;
pub mod config;
pub mod forwarding;
pub mod ssh_server;

use crate::certificate_authority::CertificateAuthenticator;
use crate::forwarding::ForwardBridge;
use crate::ssh_server::JumpServer;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// config file path
    #[arg(short = 'c', long)]
    pub config_file: String,
    /// load the configuration and all keys, then exit
    #[arg(long, default_value_t = false)]
    pub check_config: bool,
}

/// Loads the configuration and keys, then serves until Ctrl-C.
pub async fn run_server(args: CliArgs) -> Result<()> {
    if env::var("RUST_LOG").is_err() {
        // no other thread reads the environment yet
        unsafe {
            env::set_var("RUST_LOG", "info");
        }
    }
    let _ = env_logger::try_init();

    let config = config::read_config(&args.config_file)
        .with_context(|| format!("failed to read config file {}", args.config_file))?;

    let authenticator = CertificateAuthenticator::from_config(&config.ca)
        .with_context(|| format!("failed to load CA key {:?}", config.ca.public_key))?;
    let bridge = ForwardBridge::new(&config.forwarding);
    let mut server = JumpServer::new(config.ssh, Arc::new(authenticator), Arc::new(bridge))?;

    if args.check_config {
        info!("configuration {} is valid", args.config_file);
        return Ok(());
    }

    info!("starting server");
    server.run().await
}
