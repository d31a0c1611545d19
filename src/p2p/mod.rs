//! P2P connection keeping
//!
//! Keeps this node's live remotes in line with a static peer registry:
//! - Registry of peer names and addresses
//! - Reconciliation of the registry against the transport's remotes
//! - Nice joins, so two peers don't dial each other at the same time
//! - The periodic connection maintainer that retries whatever is unhealthy

pub mod connection_maintainer;
pub mod dial_tracker;
pub mod loopback;
pub mod nice_join;
pub mod p2p_config;
pub mod reconcile;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub mod test_utils;

pub use connection_maintainer::{
    run_connection_maintainer, ConnectTarget, ConnectionMaintainer, MaintainerStats,
    RegistryHandle,
};
pub use dial_tracker::{DialEvent, DialKind, DialTracker, RetryRecord};
pub use loopback::LoopbackTransport;
pub use nice_join::{distributed_connection_map, nice_peers_for, NiceWindow};
pub use p2p_config::{load_keeper_config, KeeperConfig, RatchetConfig};
pub use reconcile::{classify, reconcile, Reconciliation};
pub use registry::{Address, AddressParseError, PeerRegistry};
pub use transport::{
    CountingTransport, RemoteConnection, RemoteId, RemotePhase, RemoteState, Transport,
    TransportCounters,
};
