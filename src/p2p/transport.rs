//! Transport seam - what the maintainer needs from the handshake layer
//!
//! The handshake protocol itself (join/allow transactions, framing, sockets) lives behind
//! [`Transport`]. The maintainer only reads per-remote state and asks for handshake steps to
//! be initiated; it never waits for them to finish.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::error::TransportError;
use crate::p2p::registry::Address;

/// Opaque, stable identifier for a remote. Assigned by the transport at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteId(pub u64);

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handshake health flags, owned and mutated only by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteState {
    pub joined: bool,
    pub allowed: bool,
    pub alive: bool,
    pub join_in_progress: bool,
    pub allow_in_progress: bool,
}

/// Where a remote stands, as seen by one maintenance tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePhase {
    Healthy,
    JoinPending,
    AllowPending,
    /// Joined but not yet allowed; the next retry is an allow.
    AwaitingAllow,
    /// Never joined, join failed, or the link died; the next retry is a join.
    Unjoined,
}

impl RemoteState {
    /// A remote is connected if it is joined, allowed and alive.
    pub fn is_connected(&self) -> bool {
        self.joined && self.allowed && self.alive
    }

    pub fn phase(&self) -> RemotePhase {
        if self.is_connected() {
            RemotePhase::Healthy
        } else if self.join_in_progress {
            RemotePhase::JoinPending
        } else if self.allow_in_progress {
            RemotePhase::AllowPending
        } else if self.joined && !self.allowed {
            RemotePhase::AwaitingAllow
        } else {
            RemotePhase::Unjoined
        }
    }

    pub fn connected() -> Self {
        Self {
            joined: true,
            allowed: true,
            alive: true,
            ..Self::default()
        }
    }
}

/// This node's record of a connection (or attempt) with one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConnection {
    pub id: RemoteId,
    /// Identity the peer claims. Placeholder until a join completes.
    pub name: String,
    pub address: Address,
    pub state: RemoteState,
}

impl RemoteConnection {
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }
}

/// Handshake layer consumed by the reconciler and maintainer.
///
/// Implementations are driven from a single task; `initiate_*` suspend only until the request
/// has been sent, and must tolerate being dropped mid-flight (a later tick re-reads the
/// in-progress flags).
#[async_trait(?Send)]
pub trait Transport {
    /// Snapshot of every live remote, ordered by id.
    fn remotes(&self) -> Vec<RemoteConnection>;

    fn remote_state(&self, id: RemoteId) -> Option<RemoteState>;

    fn create_remote(&mut self, address: &Address) -> Result<RemoteId, TransportError>;

    fn remove_remote(&mut self, id: RemoteId) -> Option<RemoteConnection>;

    /// Start a join. With `cascade`, a successful join proceeds to allow on its own.
    async fn initiate_join(
        &mut self,
        id: RemoteId,
        cascade: bool,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    async fn initiate_allow(
        &mut self,
        id: RemoteId,
        cascade: bool,
        timeout: Duration,
    ) -> Result<(), TransportError>;
}

/// Handshake call counters collected by [`CountingTransport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCounters {
    pub joins: u64,
    pub allows: u64,
    pub created: u64,
    pub removed: u64,
    pub failures: u64,
}

/// Decorator that counts handshake traffic through an inner transport.
#[derive(Debug, Default)]
pub struct CountingTransport<T> {
    inner: T,
    counters: TransportCounters,
}

impl<T: Transport> CountingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            counters: TransportCounters::default(),
        }
    }

    pub fn counters(&self) -> TransportCounters {
        self.counters
    }
}

#[async_trait(?Send)]
impl<T: Transport> Transport for CountingTransport<T> {
    fn remotes(&self) -> Vec<RemoteConnection> {
        self.inner.remotes()
    }

    fn remote_state(&self, id: RemoteId) -> Option<RemoteState> {
        self.inner.remote_state(id)
    }

    fn create_remote(&mut self, address: &Address) -> Result<RemoteId, TransportError> {
        let id = self.inner.create_remote(address)?;
        self.counters.created += 1;
        Ok(id)
    }

    fn remove_remote(&mut self, id: RemoteId) -> Option<RemoteConnection> {
        let removed = self.inner.remove_remote(id);
        if removed.is_some() {
            self.counters.removed += 1;
        }
        removed
    }

    async fn initiate_join(
        &mut self,
        id: RemoteId,
        cascade: bool,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.counters.joins += 1;
        let result = self.inner.initiate_join(id, cascade, timeout).await;
        if result.is_err() {
            self.counters.failures += 1;
        }
        result
    }

    async fn initiate_allow(
        &mut self,
        id: RemoteId,
        cascade: bool,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.counters.allows += 1;
        let result = self.inner.initiate_allow(id, cascade, timeout).await;
        if result.is_err() {
            self.counters.failures += 1;
        }
        result
    }
}
