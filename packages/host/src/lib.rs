#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Public gateway of the Portunnel reverse tunnel.
//!
//! Proxies dial the control endpoint at the configured prefix and register a service id.
//! External traffic to `{prefix}/{serviceId}/...` is then relayed over that proxy's control
//! connection by the [`ingress::IngressTranslator`] middleware.

use std::sync::{Arc, LazyLock};

use actix_web::web;
use tokio_util::sync::CancellationToken;

pub mod api;
pub mod config;
pub mod connection;
pub mod controller;
pub mod ingress;
pub mod queue;
pub mod registry;

pub use config::{ConfigError, FailurePolicy, HostConfig};
pub use ingress::IngressTranslator;

pub static CANCELLATION_TOKEN: LazyLock<CancellationToken> = LazyLock::new(CancellationToken::new);

pub type HostRegistry = registry::ConnectionRegistry<connection::ControlConnection, actix_ws::Session>;

/// State shared by the control endpoint and the ingress middleware.
pub struct HostState {
    pub config: HostConfig,
    pub registry: HostRegistry,
}

impl HostState {
    #[must_use]
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            registry: HostRegistry::new(),
        }
    }
}

/// Mounts the control endpoint and the health check.
///
/// The ingress middleware is wrapped separately around the whole app with
/// [`IngressTranslator::new`].
pub fn configure(cfg: &mut web::ServiceConfig, state: Arc<HostState>) {
    let prefix = state.config.prefix.clone();

    cfg.app_data(web::Data::from(state))
        .service(api::health_endpoint)
        .service(web::resource(prefix).route(web::get().to(controller::control_endpoint)));
}
