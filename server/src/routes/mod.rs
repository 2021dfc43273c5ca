//! HTTP route handlers outside the relay protocol.

pub mod health;
