//! Connection Maintainer - keeps the live remotes in line with the peer registry
//!
//! Every check reconciles the registry against the transport, retries unhealthy remotes and
//! dials registered peers that have no remote at all:
//! - Legacy remotes (not in the registry) are removed
//! - Join/allow in progress is left alone and checked again soon
//! - Joined but not allowed retries the allow, anything else rejoins
//! - Missing peers are dialed, except the ones this node waits for during the nice window
//!
//! The maintainer is driven from a single task. The host either calls [`ConnectionMaintainer::tick`]
//! itself or hands the maintainer to [`run_connection_maintainer`].

use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{KeeperError, TransportError};
use crate::p2p::dial_tracker::{DialEvent, DialKind, DialTracker};
use crate::p2p::nice_join::{nice_peers_for, NiceWindow};
use crate::p2p::p2p_config::KeeperConfig;
use crate::p2p::reconcile::{reconcile, Reconciliation};
use crate::p2p::registry::{Address, PeerRegistry};
use crate::p2p::transport::{RemoteConnection, RemoteId, RemotePhase, Transport};
use crate::util::deadline;
use crate::util::ratchet::Ratchet;

/// Connection maintainer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintainerStats {
    pub checks_performed: u64,
    pub joins_issued: u64,
    pub allows_issued: u64,
    pub legacy_removed: u64,
    pub faults_reported: u64,
    pub transport_failures: u64,
}

/// Who to connect to: a registry name, or an address that must be in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    Name(String),
    Address(Address),
}

impl From<&str> for ConnectTarget {
    fn from(name: &str) -> Self {
        ConnectTarget::Name(name.to_string())
    }
}

impl From<String> for ConnectTarget {
    fn from(name: String) -> Self {
        ConnectTarget::Name(name)
    }
}

impl From<Address> for ConnectTarget {
    fn from(address: Address) -> Self {
        ConnectTarget::Address(address)
    }
}

/// Hands registry replacements to a running maintainer. Applied at the start of its next check.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<PeerRegistry>,
}

impl RegistryHandle {
    pub fn replace(&self, registry: PeerRegistry) -> Result<(), KeeperError> {
        self.tx
            .send(registry)
            .map_err(|_| KeeperError::MaintainerGone)
    }
}

pub struct ConnectionMaintainer<T: Transport> {
    node_name: String,
    /// Registry without this node's own entry
    registry: PeerRegistry,
    /// Peers this node leaves the first move to
    nice_peers: BTreeSet<String>,
    transport: T,
    config: KeeperConfig,
    tracker: DialTracker,
    next_check: Option<Instant>,
    nice_window: NiceWindow,
    reconnect_ratchet: Option<Ratchet>,
    updates_tx: mpsc::UnboundedSender<PeerRegistry>,
    updates_rx: mpsc::UnboundedReceiver<PeerRegistry>,
    stats: MaintainerStats,
}

impl<T: Transport> ConnectionMaintainer<T> {
    pub fn new(config: KeeperConfig, transport: T) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let reconnect_ratchet = config
            .reconnect_backoff
            .then(|| config.ratchet.to_ratchet());

        let mut maintainer = Self {
            node_name: config.node_name.clone(),
            registry: PeerRegistry::new(),
            nice_peers: BTreeSet::new(),
            transport,
            tracker: DialTracker::new(),
            next_check: None,
            nice_window: NiceWindow::default(),
            reconnect_ratchet,
            updates_tx,
            updates_rx,
            stats: MaintainerStats::default(),
            config,
        };
        let registry = maintainer.config.registry.clone();
        maintainer.set_registry(registry);

        info!(
            "[CONN_MAINTAINER] 🔧 Starting connection maintainer for {} (interval: {}s, peers: {}, nice peers: {:?})",
            maintainer.node_name,
            maintainer.config.check_interval().as_secs(),
            maintainer.registry.len(),
            maintainer.nice_peers
        );

        maintainer
    }

    pub fn registry_handle(&self) -> RegistryHandle {
        RegistryHandle {
            tx: self.updates_tx.clone(),
        }
    }

    fn set_registry(&mut self, registry: PeerRegistry) {
        self.nice_peers = nice_peers_for(&self.node_name, registry.names());
        self.registry = registry.without(&self.node_name);
    }

    /// Apply the most recent pending registry replacement, if any.
    fn apply_registry_updates(&mut self) {
        let mut latest = None;
        while let Ok(registry) = self.updates_rx.try_recv() {
            latest = Some(registry);
        }
        if let Some(registry) = latest {
            info!(
                "[CONN_MAINTAINER] registry replaced ({} -> {} peers)",
                self.registry.len(),
                registry.len().saturating_sub(usize::from(registry.contains(&self.node_name)))
            );
            self.set_registry(registry);
        }
    }

    fn shrink_next_check(&mut self, at: Instant) {
        if self.next_check.map_or(true, |next| at < next) {
            self.next_check = Some(at);
        }
    }

    /// Run one maintenance check. Returns `false` when rate limited (not yet due and not forced).
    pub async fn tick(&mut self, now: Instant, force: bool) -> bool {
        if !force {
            if let Some(next) = self.next_check {
                if now < next {
                    return false;
                }
            }
        }
        self.next_check = Some(deadline(now, self.config.check_interval()));
        self.stats.checks_performed += 1;

        self.apply_registry_updates();

        let snapshot = self.transport.remotes();
        let rec = reconcile(&self.registry, &mut self.transport);
        self.stats.faults_reported += rec.faults.len() as u64;
        self.stats.legacy_removed += rec.legacy.len() as u64;

        let legacy = rec.legacy_ids();
        let alive: BTreeSet<RemoteId> = snapshot
            .iter()
            .filter(|r| !legacy.contains(&r.id))
            .map(|r| r.id)
            .collect();
        self.tracker.retain(|id| alive.contains(&id));
        for remote in snapshot.iter().filter(|r| r.is_connected()) {
            self.tracker.forget(remote.id);
        }

        for remote in snapshot
            .iter()
            .filter(|r| alive.contains(&r.id) && !r.is_connected())
        {
            self.handle_disconnected_remote(remote, &rec, now).await;
        }

        self.connect_to_missing(&rec, now).await;

        debug!(
            target: "peer_keeper::p2p::maintainer",
            "check done: matched={} missing={} conflicting={} legacy={} retrying={}",
            rec.matched.len(),
            rec.missing.len(),
            rec.conflicting.len(),
            rec.legacy.len(),
            self.tracker.tracked()
        );

        true
    }

    async fn handle_disconnected_remote(
        &mut self,
        remote: &RemoteConnection,
        rec: &Reconciliation,
        now: Instant,
    ) {
        let name = match self.registry.remote_name(remote) {
            Ok(Some(name)) => name,
            Ok(None) => {
                debug!(
                    "[CONN_MAINTAINER] remote {} at {} is not in the registry, not retrying",
                    remote.id, remote.address
                );
                return;
            }
            Err(fault) => {
                warn!(
                    "[CONN_MAINTAINER] cannot place remote {} {}: {}",
                    remote.id, remote.name, fault
                );
                return;
            }
        };
        if rec.ambiguous.contains(&name) {
            debug!(
                "[CONN_MAINTAINER] not retrying {}: registry address is ambiguous",
                name
            );
            return;
        }

        let Some(state) = self.transport.remote_state(remote.id) else {
            return;
        };
        let phase = state.phase();
        match phase {
            RemotePhase::Healthy => {
                self.tracker.forget(remote.id);
                return;
            }
            RemotePhase::JoinPending | RemotePhase::AllowPending => {
                debug!(
                    "[CONN_MAINTAINER] {:?} for {} still in progress, checking again soon",
                    phase, name
                );
                self.shrink_next_check(deadline(now, self.config.reconnect_to_disconnected_in()));
                return;
            }
            RemotePhase::AwaitingAllow | RemotePhase::Unjoined => {}
        }

        let backoff = match (&self.reconnect_ratchet, self.tracker.retry_record(remote.id)) {
            (Some(ratchet), Some(record)) => Some((
                deadline(record.last_attempt, ratchet.wait(record.attempts)),
                record.attempts,
            )),
            _ => None,
        };
        if let Some((due, attempts)) = backoff {
            if now < due {
                debug!(
                    "[CONN_MAINTAINER] backing off {} for {:?} after {} attempts",
                    name,
                    due - now,
                    attempts
                );
                self.shrink_next_check(due);
                return;
            }
        }

        let record = self.tracker.record_retry(remote.id, now);

        if phase == RemotePhase::AwaitingAllow {
            info!(
                "[CONN_MAINTAINER] 🔁 Retrying allow toward {} {} (attempt {})",
                name, remote.address, record.attempts
            );
            self.stats.allows_issued += 1;
            self.tracker.record(DialEvent {
                remote: Some(remote.id),
                peer: name.clone(),
                kind: DialKind::Allow,
                reason: "joined but not allowed".to_string(),
                at: now,
                source: "retry",
            });
            let timeout = self.config.allow_timeout();
            if let Err(e) = self.transport.initiate_allow(remote.id, true, timeout).await {
                self.absorb_failure(&name, Some(remote.id), e, "retry", now);
            }
        } else {
            info!(
                "[CONN_MAINTAINER] 🔁 Rejoining {} {} (attempt {})",
                name, remote.address, record.attempts
            );
            self.dial(ConnectTarget::Name(name), Some(remote.id), now).await;
        }
    }

    async fn connect_to_missing(&mut self, rec: &Reconciliation, now: Instant) {
        if rec.missing.is_empty() {
            return;
        }

        let nice = self
            .nice_window
            .observe(now, self.config.reconnect_to_missing_in());
        let mut waited = false;

        for name in &rec.missing {
            if rec.ambiguous.contains(name) {
                warn!(
                    "[CONN_MAINTAINER] not connecting to {}: its registry address is ambiguous",
                    name
                );
                continue;
            }
            if nice && self.nice_peers.contains(name) {
                debug!("[NICE_JOIN] waiting for {} to connect first", name);
                waited = true;
                continue;
            }
            info!("[CONN_MAINTAINER] 🌐 Connecting to missing peer {}", name);
            self.dial(ConnectTarget::Name(name.clone()), None, now).await;
        }

        if waited {
            if let Some(until) = self.nice_window.closes_at() {
                self.shrink_next_check(until);
            }
        }
    }

    /// Start a join toward `target`, on `existing` if given or on a new remote.
    ///
    /// Returns the remote that was dialed, or `None` when nothing was attempted. Transport
    /// failures are logged and left for the next check.
    pub async fn connect(
        &mut self,
        target: impl Into<ConnectTarget>,
        existing: Option<RemoteId>,
    ) -> Option<RemoteId> {
        self.dial(target.into(), existing, Instant::now()).await
    }

    async fn dial(
        &mut self,
        target: ConnectTarget,
        existing: Option<RemoteId>,
        now: Instant,
    ) -> Option<RemoteId> {
        let (name, address) = match target {
            ConnectTarget::Name(name) => match self.registry.get(&name) {
                Some(address) => (name, address.clone()),
                None => {
                    warn!("[CONN_MAINTAINER] cannot connect to {}: not in registry", name);
                    return None;
                }
            },
            ConnectTarget::Address(address) => match self.registry.find_by_address(&address) {
                Ok(Some(name)) => (name.to_string(), address),
                Ok(None) => {
                    warn!(
                        "[CONN_MAINTAINER] refusing to connect to {}: not in registry",
                        address
                    );
                    return None;
                }
                Err(fault) => {
                    error!("[CONN_MAINTAINER] cannot connect to {}: {}", address, fault);
                    self.stats.faults_reported += 1;
                    return None;
                }
            },
        };

        let source = if existing.is_some() { "retry" } else { "connect" };
        let id = match existing {
            Some(id) => id,
            None => match self.create_remote(&address) {
                Ok(id) => id,
                Err(e) => {
                    self.absorb_failure(&name, None, e, source, now);
                    return None;
                }
            },
        };

        self.stats.joins_issued += 1;
        self.tracker.record(DialEvent {
            remote: Some(id),
            peer: name.clone(),
            kind: DialKind::Join,
            reason: format!("join toward {}", address),
            at: now,
            source,
        });

        let timeout = self.config.join_timeout();
        if let Err(e) = self.transport.initiate_join(id, true, timeout).await {
            self.absorb_failure(&name, Some(id), e, source, now);
        }
        Some(id)
    }

    /// Create a remote toward a registered address; anything else is refused.
    pub fn create_remote(&mut self, address: &Address) -> Result<RemoteId, TransportError> {
        if !self.accepts_join_from(address) {
            return Err(TransportError::Unregistered(address.clone()));
        }
        self.transport.create_remote(address)
    }

    fn absorb_failure(
        &mut self,
        name: &str,
        remote: Option<RemoteId>,
        e: TransportError,
        source: &'static str,
        now: Instant,
    ) {
        warn!("[CONN_MAINTAINER] ❌ {} toward {} failed: {}", source, name, e);
        self.stats.transport_failures += 1;
        self.tracker.record(DialEvent {
            remote,
            peer: name.to_string(),
            kind: DialKind::Failure,
            reason: e.to_string(),
            at: now,
            source,
        });
    }

    /// Whether a peer at `address` may join this node.
    pub fn accepts_join_from(&self, address: &Address) -> bool {
        self.registry.iter().any(|(_, a)| a.same_as(address))
    }

    /// Registered peers without a healthy remote.
    pub fn not_connected_peers(&self) -> BTreeSet<String> {
        let connected: BTreeSet<String> = self
            .transport
            .remotes()
            .iter()
            .filter(|r| r.is_connected())
            .filter_map(|r| self.registry.remote_name(r).ok().flatten())
            .collect();

        self.registry
            .names()
            .filter(|name| !connected.contains(*name))
            .map(str::to_string)
            .collect()
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn nice_peers(&self) -> &BTreeSet<String> {
        &self.nice_peers
    }

    pub fn config(&self) -> &KeeperConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn dial_tracker(&self) -> &DialTracker {
        &self.tracker
    }

    pub fn stats(&self) -> &MaintainerStats {
        &self.stats
    }

    pub fn next_check(&self) -> Option<Instant> {
        self.next_check
    }

    pub fn nice_window(&self) -> NiceWindow {
        self.nice_window
    }
}

/// Run the connection maintainer loop
///
/// Wakes every `poll_every` and lets the maintainer decide whether a check is due. Stops after
/// `max_cycles` performed checks, or when `shutdown` resolves, and hands the maintainer back.
pub async fn run_connection_maintainer<T, S>(
    mut maintainer: ConnectionMaintainer<T>,
    poll_every: Duration,
    max_cycles: Option<u64>,
    shutdown: S,
) -> ConnectionMaintainer<T>
where
    T: Transport,
    S: Future<Output = ()>,
{
    let mut ticker = interval(poll_every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!(
        "[CONN_MAINTAINER] running (poll every {:?}, max cycles: {:?})",
        poll_every, max_cycles
    );

    let mut cycles = 0u64;
    loop {
        if max_cycles.is_some_and(|max| cycles >= max) {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                if maintainer.tick(Instant::now(), false).await {
                    cycles += 1;
                    debug!(
                        "[CONN_MAINTAINER] check {} done, not connected: {:?}",
                        cycles,
                        maintainer.not_connected_peers()
                    );
                }
            }
            _ = &mut shutdown => {
                info!("[CONN_MAINTAINER] shutting down after {} checks", cycles);
                break;
            }
        }
    }

    maintainer
}
