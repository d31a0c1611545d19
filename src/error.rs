//! Error types shared by the registry, reconciler and maintainer.

use thiserror::Error;

use crate::p2p::registry::Address;
use crate::p2p::transport::RemoteId;

/// Failures surfaced by a [`Transport`](crate::p2p::transport::Transport) implementation.
///
/// The maintainer never propagates these to the host; they are logged and the affected
/// remote is retried on the next unhealthy-connection pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("unknown remote {0}")]
    UnknownRemote(RemoteId),

    #[error("address {0} is not in the registry")]
    Unregistered(Address),

    #[error("remote {0} must be joined before it can be allowed")]
    NotJoined(RemoteId),

    #[error("handshake with remote {id} failed: {reason}")]
    Handshake { id: RemoteId, reason: String },
}

/// Structural faults found while maintaining connections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeeperError {
    /// Two or more registry names share one address.
    #[error("more than one registry entry with address {address}: {names:?}")]
    AmbiguousAddress { address: Address, names: Vec<String> },

    /// A live remote claims a registry name but sits at a different address.
    #[error("address for {name} doesn't match: remote is at {actual} but registry says {expected}")]
    ConflictingAddress {
        name: String,
        actual: Address,
        expected: Address,
    },

    /// The reconciliation count invariant did not hold.
    #[error(
        "reconciliation mismatch: {missing} missing + {matched} matched + {conflicting} conflicting != {registered} registered"
    )]
    Inconsistent {
        missing: usize,
        matched: usize,
        conflicting: usize,
        registered: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The maintainer owning the registry channel has been dropped.
    #[error("connection maintainer is no longer running")]
    MaintainerGone,
}

impl KeeperError {
    /// Configuration faults exclude entries from matching but never stop the loop.
    pub fn is_configuration_fault(&self) -> bool {
        matches!(
            self,
            KeeperError::AmbiguousAddress { .. } | KeeperError::InvalidConfig(_)
        )
    }
}
