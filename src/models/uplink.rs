use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::ops::Deref;

use serde::Serialize;

use crate::config::UplinkConfig;
use crate::error::{FusionError, Result};

/// One local network interface, identified by its bound IPv4 address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Uplink {
    label: String,
    address: Ipv4Addr,
}

impl Uplink {
    /// Create an uplink, rejecting addresses that can never be a usable source
    ///
    /// An empty label falls back to the address text.
    pub fn new(label: impl Into<String>, address: Ipv4Addr) -> Result<Self> {
        if address.is_link_local() {
            return Err(FusionError::InvalidUplink(format!(
                "{} is link-local",
                address
            )));
        }
        if address.is_unspecified() || address.is_broadcast() || address.is_multicast() {
            return Err(FusionError::InvalidUplink(format!(
                "{} is not a unicast host address",
                address
            )));
        }

        let label = label.into().trim().to_string();
        let label = if label.is_empty() {
            address.to_string()
        } else {
            label
        };

        Ok(Self { label, address })
    }

    /// Parse an uplink from a label and an address string
    pub fn parse(label: &str, address: &str) -> Result<Self> {
        let address: Ipv4Addr = address.trim().parse().map_err(|_| {
            FusionError::InvalidUplink(format!("'{}' is not an IPv4 address", address.trim()))
        })?;
        Self::new(label, address)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Check that the address is currently assigned to this host
    ///
    /// Binding an ephemeral UDP socket succeeds only for local addresses.
    pub fn probe(&self) -> Result<()> {
        UdpSocket::bind(SocketAddr::from((self.address, 0)))
            .map(|_| ())
            .map_err(|e| {
                FusionError::InvalidUplink(format!(
                    "{} ({}) is not assigned to this host: {}",
                    self.label, self.address, e
                ))
            })
    }
}

impl std::fmt::Display for Uplink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.label == self.address.to_string() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{} ({})", self.label, self.address)
        }
    }
}

/// Ordered collection of distinct uplinks for one session
///
/// The order defines dispatch rotation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UplinkSet {
    uplinks: Vec<Uplink>,
}

impl UplinkSet {
    /// Build a set, rejecting duplicate addresses
    pub fn new(uplinks: Vec<Uplink>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(uplinks.len());
        for uplink in &uplinks {
            if !seen.insert(uplink.address) {
                return Err(FusionError::InvalidUplink(format!(
                    "{} is listed more than once",
                    uplink.address
                )));
            }
        }
        Ok(Self { uplinks })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a set from configuration entries
    pub fn from_config(entries: &[UplinkConfig]) -> Result<Self> {
        let uplinks = entries
            .iter()
            .map(|entry| Uplink::parse(&entry.label, &entry.address))
            .collect::<Result<Vec<_>>>()?;
        Self::new(uplinks)
    }

    /// Check every address is assigned to this host
    pub fn probe(&self) -> Result<()> {
        self.uplinks.iter().try_for_each(Uplink::probe)
    }
}

impl Deref for UplinkSet {
    type Target = [Uplink];

    fn deref(&self) -> &Self::Target {
        &self.uplinks
    }
}
