//! Round-robin uplink dispatch

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{FusionError, Result};
use crate::models::{Uplink, UplinkSet};

/// Chooses the uplink that serves each inbound request
///
/// Uses an atomic counter so concurrent connection tasks can dispatch
/// without locking. The uplink set is fixed for the session.
#[derive(Debug)]
pub struct Dispatcher {
    uplinks: Arc<UplinkSet>,
    index: AtomicUsize,
}

impl Dispatcher {
    pub fn new(uplinks: Arc<UplinkSet>) -> Self {
        Self {
            uplinks,
            index: AtomicUsize::new(0),
        }
    }

    /// Pick the next uplink in rotation order
    ///
    /// Returns an error only if the set is empty.
    pub fn choose(&self) -> Result<&Uplink> {
        let len = self.uplinks.len();
        if len == 0 {
            return Err(FusionError::NoUplinks);
        }

        // Atomically increment and get the previous value, then wrap around
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % len;

        self.uplinks.get(idx).ok_or(FusionError::NoUplinks)
    }

    pub fn available_count(&self) -> usize {
        self.uplinks.len()
    }
}
