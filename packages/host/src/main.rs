#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::{env, sync::Arc};

use actix_web::{App, middleware};
use portunnel_host::{CANCELLATION_TOKEN, HostConfig, HostState, IngressTranslator, configure};

fn env_usize(name: &str) -> Result<Option<usize>, std::io::Error> {
    env::var(name)
        .ok()
        .map(|value| {
            value.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Invalid {name} environment variable: '{value}'"),
                )
            })
        })
        .transpose()
}

fn main() -> Result<(), std::io::Error> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("portunnel_host=info,actix_web=info"),
    )
    .init();

    let service_port: u16 = {
        let args: Vec<String> = env::args().collect();

        let port = if args.len() > 1 {
            Some(args[1].clone())
        } else {
            env::var("PORT").ok()
        };

        port.map_or(Ok(8000), |port| {
            port.parse().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Invalid port: '{port}'"),
                )
            })
        })?
    };

    let config = HostConfig::from_env().map_err(std::io::Error::other)?;
    log::info!(
        "Relaying under prefix '{}' (failure policy: {})",
        config.prefix,
        config.failure_policy.as_ref()
    );

    let threads = env_usize("MAX_THREADS")?.unwrap_or(64);
    log::debug!("Running with {threads} max blocking threads");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(threads)
        .build()?;

    actix_web::rt::System::with_tokio_rt(move || runtime).block_on(async move {
        let state = Arc::new(HostState::new(config));

        let app = move || {
            let state = state.clone();

            App::new()
                .wrap(IngressTranslator::new(state.clone()))
                .wrap(middleware::Logger::default())
                .configure(move |cfg| configure(cfg, state))
        };

        let mut http_server = actix_web::HttpServer::new(app);

        if let Some(workers) = env_usize("ACTIX_WORKERS")? {
            log::debug!("Running with {workers} Actix workers");
            http_server = http_server.workers(workers);
        }

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string());

        let http_server = http_server.bind((bind_addr, service_port))?.run();

        let resp = http_server.await;

        log::debug!("Cancelling token...");
        CANCELLATION_TOKEN.cancel();

        log::debug!("Server shut down");

        resp
    })
}
