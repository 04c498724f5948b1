//! Forkgate - TLS front door for a pool of local worker processes
//!
//! This library provides the front door of a small site-hosting system:
//! - Forks a fixed pool of worker processes and respawns them when they exit
//! - Probes each worker's liveness endpoint and tracks its health
//! - Terminates TLS and reverse-proxies requests round-robin to healthy workers
//! - Retries a failed request once on a different worker
//! - Routes the form submission prefix to a separate local service

pub mod backoff;
pub mod config;
pub mod error;
pub mod healthcheck;
pub mod proxy;
pub mod registry;
pub mod routing;
pub mod supervisor;
pub mod tls;
pub mod upstream;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
