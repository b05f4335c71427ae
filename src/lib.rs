//! NetFusion - Multi-Uplink Forward Proxy
//!
//! A local HTTP forward proxy that spreads requests across several network
//! uplinks by binding each outbound connection to a different source address.
//!
//! ## Features
//!
//! - Round-robin dispatch over an ordered set of IPv4 uplinks
//! - Listens on loopback only, plain HTTP/1.1 forward-proxy semantics
//! - Per-request timeouts with 502 on upstream failure
//! - Start/stop lifecycle with cancellation of in-flight fetches
//! - Status and error events for an external UI, plus session statistics

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;

pub use config::Config;
pub use error::{FusionError, Result};
pub use models::{EventSink, ProxyEvent, ProxyState, StatsSnapshot, Uplink, UplinkSet};
pub use proxy::LifecycleController;
