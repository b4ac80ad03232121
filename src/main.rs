use std::process::ExitCode;

use clap::Parser;
use log::error;

use ssh_jump_server::{CliArgs, run_server};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    match run_server(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
