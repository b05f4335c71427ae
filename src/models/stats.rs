use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use super::uplink::{Uplink, UplinkSet};

/// Per-uplink counters
#[derive(Debug, Default)]
struct UplinkCounters {
    dispatched: u64,
    failed: u64,
    bytes: u64,
}

/// Live counters for one proxy session
///
/// Updated concurrently by every connection task.
#[derive(Debug)]
pub struct SessionStats {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    order: Vec<Uplink>,
    requests: AtomicU64,
    succeeded: AtomicU64,
    upstream_failures: AtomicU64,
    rejected: AtomicU64,
    faults: AtomicU64,
    uplinks: DashMap<Ipv4Addr, UplinkCounters>,
}

impl SessionStats {
    pub fn new(session_id: Uuid, uplinks: &UplinkSet) -> Self {
        let counters = DashMap::with_capacity(uplinks.len());
        for uplink in uplinks.iter() {
            counters.insert(uplink.address(), UplinkCounters::default());
        }

        Self {
            session_id,
            started_at: Utc::now(),
            order: uplinks.to_vec(),
            requests: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            upstream_failures: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            uplinks: counters,
        }
    }

    /// Count one inbound request, whatever its outcome
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request turned away before any uplink was used
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request that failed inside the proxy itself
    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a dispatch decision for an uplink
    pub fn record_dispatch(&self, address: Ipv4Addr) {
        if let Some(mut counters) = self.uplinks.get_mut(&address) {
            counters.dispatched += 1;
        }
    }

    /// Count a completed upstream exchange
    pub fn record_success(&self, address: Ipv4Addr, bytes: u64) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        if let Some(mut counters) = self.uplinks.get_mut(&address) {
            counters.bytes += bytes;
        }
    }

    /// Count an upstream transport failure
    pub fn record_failure(&self, address: Ipv4Addr) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
        if let Some(mut counters) = self.uplinks.get_mut(&address) {
            counters.failed += 1;
        }
    }

    /// Add bytes relayed through a tunnel after it closed
    pub fn record_bytes(&self, address: Ipv4Addr, bytes: u64) {
        if let Some(mut counters) = self.uplinks.get_mut(&address) {
            counters.bytes += bytes;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let uplinks = self
            .order
            .iter()
            .map(|uplink| {
                let (dispatched, failed, bytes) = self
                    .uplinks
                    .get(&uplink.address())
                    .map(|c| (c.dispatched, c.failed, c.bytes))
                    .unwrap_or_default();
                UplinkStats {
                    label: uplink.label().to_string(),
                    address: uplink.address().to_string(),
                    dispatched,
                    failed,
                    bytes,
                }
            })
            .collect();

        StatsSnapshot {
            session_id: self.session_id,
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            requests: self.requests.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            uplinks,
        }
    }
}

/// Point-in-time copy of session statistics
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    /// Requests handled, including rejected ones
    pub requests: u64,
    /// Upstream exchanges that completed (any upstream status)
    pub succeeded: u64,
    /// Upstream transport failures (502s)
    pub upstream_failures: u64,
    /// Requests refused before dispatch
    pub rejected: u64,
    /// Internal faults (500s)
    pub faults: u64,
    pub uplinks: Vec<UplinkStats>,
}

/// Counters for one uplink, in rotation order
#[derive(Debug, Clone, Serialize)]
pub struct UplinkStats {
    pub label: String,
    pub address: String,
    pub dispatched: u64,
    pub failed: u64,
    pub bytes: u64,
}
