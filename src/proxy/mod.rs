//! Proxy server implementation
//!
//! This module provides the multi-uplink forward proxy:
//! - Round-robin uplink dispatch
//! - Upstream fetches bound to an uplink's source address
//! - Per-request handling with 4xx/5xx mapping
//! - Optional CONNECT tunnels
//! - Session lifecycle with graceful shutdown

pub mod dispatcher;
pub mod fetcher;
pub mod handler;
pub mod lifecycle;
pub mod server;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::Dispatcher;
pub use fetcher::{FetchedResponse, FetcherConfig, UpstreamClient, UpstreamFetcher, UpstreamRequest};
pub use handler::{ProxyHandler, ProxyHandlerConfig};
pub use lifecycle::LifecycleController;
pub use server::ProxyServer;
pub use tunnel::TunnelHandler;
