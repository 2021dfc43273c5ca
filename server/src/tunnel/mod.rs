//! Relay gateway and backend tunnel.
//!
//! - **Gateway** (`relaygate serve`): [`hub`] owns all relay state, [`relay`]
//!   serves `/ws` and builds the router, [`bridge`] turns HTTP calls into
//!   tunnel round trips.
//! - **Backend** (`relaygate connect`): [`client`] keeps an outbound relay
//!   connection open, optionally through [`socks`].

pub mod bridge;
pub mod client;
pub mod hub;
pub mod protocol;
pub mod ratelimit;
pub mod relay;
pub mod socks;
pub mod table;
