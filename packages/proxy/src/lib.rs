#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Private side of the Portunnel reverse tunnel.
//!
//! A [`RelayExecutor`] keeps one outbound control connection to the host, registers a client
//! id and replays every forwarded HTTP request and WebSocket frame against a local target.

pub mod executor;
pub mod forward;
pub mod link;
pub mod options;
pub mod request_logger;
pub mod sockets;
pub mod url_validator;

pub use executor::{
    ConnectError, DisconnectError, RegisterError, RegistrationStatus, RelayExecutor,
    UnregisterError,
};
pub use options::{ConnectionOptions, OptionsProvider};
pub use request_logger::{LogDestination, RequestLogger};
pub use url_validator::{UrlValidationError, validate_url};
