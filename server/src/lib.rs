#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! relaygate library: gateway reactor, relay protocol and backend tunnel
//! client, usable by the `relaygate` binary and by embedders.
//!
//! - `tunnel`: relay protocol, gateway hub, HTTP bridge, backend client
//! - `registry`: persistent device id → backend id mapping
//! - `identity`: the backend's own persistent device id
//! - `auth`: shared-secret and bridge credential checks
//! - `config`: configuration loading
//! - `routes`: health endpoint

pub mod auth;
pub mod config;
pub mod identity;
pub mod registry;
pub mod routes;
pub mod state;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use registry::Registry;
pub use state::GatewayState;
pub use tunnel::client::{
    ApiKeyValidator, ClientObserver, CredentialValidator, LocalHttpForwarder, MessageHandler,
    ProxyHandler, TunnelClient, TunnelHandle, TunnelStatus,
};
pub use tunnel::hub::{Hub, HubHandle, HubSettings};
