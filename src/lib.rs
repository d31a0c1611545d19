//! peer-keeper: connection maintenance for a permissioned peer-to-peer node.
//!
//! Given a registry of peer names and addresses, the [`ConnectionMaintainer`](p2p::ConnectionMaintainer)
//! keeps driving the transport's live remotes toward it. See [`p2p`] for the moving parts and
//! [`util`] for the retry primitives they share.

pub mod error;
pub mod p2p;
pub mod util;

pub use error::{KeeperError, TransportError};
