//! Command-line front-end for the Portunnel proxy.
//!
//! Connects to a Portunnel host, registers a fresh client id and relays traffic for
//! `{gateway}/{clientId}/...` to the forward URL until interrupted.
//!
//! # Usage
//!
//! ```text
//! portunnel --gateway-url https://gateway.example.com/portunnel --api-key <KEY> --forward-url http://localhost:5000
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

mod console;

use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use portunnel_proxy::{
    ConnectError, ConnectionOptions, RegisterError, RelayExecutor, RequestLogger, validate_url,
};
use thiserror::Error;

use crate::console::ConsoleLogDestination;

fn parse_url(value: &str) -> Result<String, String> {
    validate_url(value)
        .map(|_| value.trim().trim_end_matches('/').to_string())
        .map_err(|e| e.to_string())
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Host URL including the prefix, e.g. `https://gateway.example.com/portunnel`.
    #[arg(long, value_parser = parse_url)]
    gateway_url: String,

    /// Secret shared with the host.
    #[arg(long)]
    api_key: String,

    /// Local service to expose, e.g. `http://localhost:5000`.
    #[arg(long, value_parser = parse_url)]
    forward_url: String,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("Failed to connect: {0}")]
    Connect(#[from] ConnectError),
    #[error("Failed to register: {0}")]
    Register(#[from] RegisterError),
}

async fn run(args: Args) -> Result<(), CliError> {
    let gateway_url = args.gateway_url.clone();

    let executor = RelayExecutor::new(
        ConnectionOptions {
            host_url: args.gateway_url,
            host_api_key: args.api_key,
            target_service_url: args.forward_url,
        },
        RequestLogger::new(vec![Arc::new(ConsoleLogDestination)]),
    );

    executor.connect().await?;

    let client_id = match executor.register().await {
        Ok(client_id) => client_id,
        Err(e) => {
            let _ = executor.disconnect().await;
            return Err(e.into());
        }
    };

    println!("Connection URL is: '{gateway_url}/{client_id}'");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    log::error!("Failed to listen for ctrl-c: {e}");
                }
                log::info!("Shutting down");
                break;
            }
            () = tokio::time::sleep(Duration::from_secs(1)) => {
                if !executor.is_connected() {
                    log::info!("Host connection lost");
                    break;
                }
            }
        }
    }

    if let Err(e) = executor.disconnect().await {
        log::debug!("Disconnect: {e}");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("portunnel=info,portunnel_proxy=info"),
    )
    .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn command_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test_log::test]
    fn trailing_slash_is_trimmed_from_urls() {
        let args = Args::try_parse_from([
            "portunnel",
            "--gateway-url",
            "https://gateway.example.com/portunnel/",
            "--api-key",
            "secret",
            "--forward-url",
            "http://localhost:5000",
        ])
        .unwrap();

        assert_eq!(args.gateway_url, "https://gateway.example.com/portunnel");
        assert_eq!(args.forward_url, "http://localhost:5000");
    }

    #[test_log::test]
    fn invalid_urls_are_rejected() {
        let result = Args::try_parse_from([
            "portunnel",
            "--gateway-url",
            "ftp://gateway.example.com",
            "--api-key",
            "secret",
            "--forward-url",
            "http://localhost:5000",
        ]);

        assert!(result.is_err());
    }
}
