//! Frontgate - a readiness-gated reverse proxy for a single supervised backend
//!
//! This library provides the front door for a service that only listens on loopback:
//! - Starts the backend process and watches its output for readiness markers
//! - Answers the orchestrator's readiness probe without touching the backend
//! - Forwards ordinary HTTP requests over a fresh backend connection each
//! - Splices protocol-upgrade (WebSocket) connections byte for byte, adding
//!   forwarding headers on the way in
//! - Bootstraps the backend's settings file so it trusts the proxy's headers

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod forward;
pub mod health;
pub mod proxy;
pub mod readiness;
pub mod supervisor;
pub mod tunnel;
pub mod upstream;
