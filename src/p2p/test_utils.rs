//! Test utilities for P2P testing
//!
//! Registry and config builders shared by the unit tests. Every test peer lives on
//! `127.0.0.1`, so only the port has to be spelled out.

use crate::p2p::p2p_config::KeeperConfig;
use crate::p2p::registry::{Address, PeerRegistry};

/// Local address on `port`
pub fn addr(port: u16) -> Address {
    Address::new("127.0.0.1", port)
}

/// Registry from `(name, port)` pairs
pub fn registry(entries: &[(&str, u16)]) -> PeerRegistry {
    entries
        .iter()
        .map(|(name, port)| (name.to_string(), addr(*port)))
        .collect()
}

/// Config for `node` with key sharing on (6s cadence)
pub fn test_config(node: &str, entries: &[(&str, u16)]) -> KeeperConfig {
    KeeperConfig {
        auto_key_sharing: true,
        ..KeeperConfig::new(node, registry(entries))
    }
}
