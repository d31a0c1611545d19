//! In-memory transport
//!
//! Every remote lives in a local map. Reachable peers are declared up front with
//! [`LoopbackTransport::with_peer`]; a join toward any other address fails. Handshakes either
//! complete as soon as they are initiated or, with [`hold_handshakes`](LoopbackTransport::hold_handshakes),
//! stay in progress until [`complete_pending`](LoopbackTransport::complete_pending) is called.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::trace;

use crate::error::TransportError;
use crate::p2p::registry::Address;
use crate::p2p::transport::{RemoteConnection, RemoteId, RemoteState, Transport};

#[derive(Debug, Default)]
pub struct LoopbackTransport {
    remotes: BTreeMap<RemoteId, RemoteConnection>,
    /// Address → identity the peer answers with.
    peers: HashMap<Address, String>,
    next_id: u64,
    hold: bool,
    cascades: HashMap<RemoteId, bool>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a reachable peer at `address` that identifies itself as `name`.
    pub fn with_peer(mut self, name: impl Into<String>, address: Address) -> Self {
        self.peers.insert(address, name.into());
        self
    }

    pub fn add_peer(&mut self, name: impl Into<String>, address: Address) {
        self.peers.insert(address, name.into());
    }

    /// Make `address` unreachable; later joins toward it fail.
    pub fn drop_peer(&mut self, address: &Address) {
        self.peers.remove(address);
    }

    /// Leave initiated handshakes in progress instead of completing them.
    pub fn hold_handshakes(&mut self, hold: bool) {
        self.hold = hold;
    }

    /// Insert an already-known remote (e.g. one left over from an earlier registry).
    pub fn insert_remote(
        &mut self,
        name: impl Into<String>,
        address: Address,
        state: RemoteState,
    ) -> RemoteId {
        let id = self.allocate();
        self.remotes.insert(
            id,
            RemoteConnection {
                id,
                name: name.into(),
                address,
                state,
            },
        );
        id
    }

    /// Mark every remote at `address` as no longer alive.
    pub fn sever(&mut self, address: &Address) {
        for remote in self.remotes.values_mut() {
            if remote.address == *address {
                remote.state.alive = false;
            }
        }
    }

    /// Finish every held handshake step.
    pub fn complete_pending(&mut self) {
        let pending: Vec<RemoteId> = self
            .remotes
            .values()
            .filter(|r| r.state.join_in_progress || r.state.allow_in_progress)
            .map(|r| r.id)
            .collect();

        for id in pending {
            let cascade = self.cascades.remove(&id).unwrap_or(false);
            let Some(remote) = self.remotes.get(&id) else {
                continue;
            };
            if remote.state.join_in_progress {
                if let Err(e) = self.finish_join(id, cascade) {
                    trace!("[LOOPBACK] held join {} failed: {}", id, e);
                }
            } else {
                self.finish_allow(id);
            }
        }
    }

    pub fn remote(&self, id: RemoteId) -> Option<&RemoteConnection> {
        self.remotes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.remotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    fn allocate(&mut self) -> RemoteId {
        self.next_id += 1;
        RemoteId(self.next_id)
    }

    fn finish_join(&mut self, id: RemoteId, cascade: bool) -> Result<(), TransportError> {
        let remote = self
            .remotes
            .get_mut(&id)
            .ok_or(TransportError::UnknownRemote(id))?;
        remote.state.join_in_progress = false;

        let Some(identity) = self.peers.get(&remote.address) else {
            remote.state.joined = false;
            return Err(TransportError::Handshake {
                id,
                reason: format!("no answer from {}", remote.address),
            });
        };

        remote.name = identity.clone();
        remote.state.joined = true;
        if cascade {
            remote.state.allowed = true;
            remote.state.alive = true;
        }
        Ok(())
    }

    fn finish_allow(&mut self, id: RemoteId) {
        if let Some(remote) = self.remotes.get_mut(&id) {
            remote.state.allow_in_progress = false;
            remote.state.allowed = true;
            remote.state.alive = self.peers.contains_key(&remote.address);
        }
    }
}

#[async_trait(?Send)]
impl Transport for LoopbackTransport {
    fn remotes(&self) -> Vec<RemoteConnection> {
        self.remotes.values().cloned().collect()
    }

    fn remote_state(&self, id: RemoteId) -> Option<RemoteState> {
        self.remotes.get(&id).map(|r| r.state)
    }

    fn create_remote(&mut self, address: &Address) -> Result<RemoteId, TransportError> {
        let id = self.allocate();
        self.remotes.insert(
            id,
            RemoteConnection {
                id,
                name: format!("unnamed-{}", id.0),
                address: address.clone(),
                state: RemoteState::default(),
            },
        );
        Ok(id)
    }

    fn remove_remote(&mut self, id: RemoteId) -> Option<RemoteConnection> {
        self.cascades.remove(&id);
        self.remotes.remove(&id)
    }

    async fn initiate_join(
        &mut self,
        id: RemoteId,
        cascade: bool,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let remote = self
            .remotes
            .get_mut(&id)
            .ok_or(TransportError::UnknownRemote(id))?;
        remote.state.join_in_progress = true;
        remote.state.allowed = false;
        trace!("[LOOPBACK] join {} toward {}", id, remote.address);

        tokio::task::yield_now().await;

        if self.hold {
            self.cascades.insert(id, cascade);
            return Ok(());
        }
        self.finish_join(id, cascade)
    }

    async fn initiate_allow(
        &mut self,
        id: RemoteId,
        _cascade: bool,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let remote = self
            .remotes
            .get_mut(&id)
            .ok_or(TransportError::UnknownRemote(id))?;
        if !remote.state.joined {
            return Err(TransportError::NotJoined(id));
        }
        remote.state.allow_in_progress = true;
        trace!("[LOOPBACK] allow {} toward {}", id, remote.address);

        tokio::task::yield_now().await;

        if !self.hold {
            self.finish_allow(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::test_utils::addr;

    #[tokio::test]
    async fn test_join_with_cascade_connects() {
        let mut transport = LoopbackTransport::new().with_peer("Beta", addr(9702));
        let id = transport.create_remote(&addr(9702)).unwrap();
        assert_eq!(transport.remote(id).unwrap().name, "unnamed-1");

        transport
            .initiate_join(id, true, Duration::from_secs(30))
            .await
            .unwrap();

        let remote = transport.remote(id).unwrap();
        assert_eq!(remote.name, "Beta");
        assert!(remote.is_connected());
    }

    #[tokio::test]
    async fn test_join_to_unreachable_fails() {
        let mut transport = LoopbackTransport::new();
        let id = transport.create_remote(&addr(9702)).unwrap();

        let err = transport
            .initiate_join(id, true, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Handshake { .. }));
        assert_eq!(transport.remote_state(id), Some(RemoteState::default()));
    }

    #[tokio::test]
    async fn test_held_handshake_stays_in_progress() {
        let mut transport = LoopbackTransport::new().with_peer("Beta", addr(9702));
        transport.hold_handshakes(true);
        let id = transport.create_remote(&addr(9702)).unwrap();

        transport
            .initiate_join(id, true, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(transport.remote_state(id).unwrap().join_in_progress);

        transport.complete_pending();
        assert!(transport.remote_state(id).unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_held_join_fails_when_peer_goes_away() {
        let mut transport = LoopbackTransport::new().with_peer("Beta", addr(9702));
        transport.hold_handshakes(true);
        let id = transport.create_remote(&addr(9702)).unwrap();

        transport
            .initiate_join(id, true, Duration::from_secs(30))
            .await
            .unwrap();
        transport.drop_peer(&addr(9702));
        transport.complete_pending();

        let state = transport.remote_state(id).unwrap();
        assert!(!state.join_in_progress);
        assert!(!state.joined);
        assert!(!state.is_connected());
        assert_eq!(transport.remote(id).unwrap().name, "unnamed-1");
    }

    #[tokio::test]
    async fn test_allow_requires_join() {
        let mut transport = LoopbackTransport::new().with_peer("Beta", addr(9702));
        let id = transport.create_remote(&addr(9702)).unwrap();

        let err = transport
            .initiate_allow(id, true, Duration::from_secs(20))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NotJoined(id));
    }
}
