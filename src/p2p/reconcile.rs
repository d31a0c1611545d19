//! Registry reconciliation
//!
//! Compares the peer registry with the transport's live remotes:
//! 1. name registered, same address          -> matched
//! 2. name registered, different address     -> conflicting (reported, not resolved)
//! 3. name unknown, address registered       -> matched under the registered name
//! 4. name unknown, address unknown          -> legacy (removed from the transport)
//!
//! Registry entries that share an address are ambiguous: they are reported and excluded from
//! matching, and remotes that can only be placed through them are left alone.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, warn};

use crate::error::KeeperError;
use crate::p2p::registry::{Address, PeerRegistry};
use crate::p2p::transport::{RemoteConnection, RemoteId, Transport};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub matched: BTreeSet<String>,
    pub missing: BTreeSet<String>,
    pub conflicting: BTreeSet<(String, Address)>,
    pub legacy: Vec<RemoteConnection>,
    pub ambiguous: BTreeSet<String>,
    /// Configuration and consistency faults found during this pass.
    pub faults: Vec<KeeperError>,
}

impl Reconciliation {
    /// `|missing| + |matched| + |conflicting| == |registry|`
    pub fn is_consistent(&self, registry: &PeerRegistry) -> bool {
        self.missing.len() + self.matched.len() + self.conflicting.len() == registry.len()
    }

    pub fn legacy_ids(&self) -> BTreeSet<RemoteId> {
        self.legacy.iter().map(|r| r.id).collect()
    }
}

/// Classify `remotes` against `registry` without touching anything.
pub fn classify(registry: &PeerRegistry, remotes: &[RemoteConnection]) -> Reconciliation {
    let mut rec = Reconciliation {
        faults: registry.ambiguities(),
        ambiguous: registry.ambiguous_names(),
        ..Reconciliation::default()
    };
    // registry name -> remote that matched it first
    let mut matched_by: BTreeMap<String, RemoteId> = BTreeMap::new();

    for remote in remotes {
        if let Some(expected) = registry.get(&remote.name) {
            if rec.ambiguous.contains(&remote.name) {
                debug!(
                    "[RECONCILE] remote {} {} claims ambiguous registry name {}, not matching",
                    remote.id, remote.address, remote.name
                );
                continue;
            }
            if !remote.address.same_as(expected) {
                error!(
                    "[RECONCILE] address for {} doesn't match: remote is at {} but should be {}",
                    remote.name, remote.address, expected
                );
                rec.faults.push(KeeperError::ConflictingAddress {
                    name: remote.name.clone(),
                    actual: remote.address.clone(),
                    expected: expected.clone(),
                });
                rec.conflicting
                    .insert((remote.name.clone(), remote.address.clone()));
                continue;
            }
            debug!("[RECONCILE] matched remote is {} {}", remote.id, remote.address);
            claim(&mut rec, &mut matched_by, &remote.name, remote);
            continue;
        }

        debug!("[RECONCILE] unmatched remote is {} {}", remote.id, remote.address);
        match registry.find_by_address(&remote.address) {
            Ok(Some(reg_name)) => {
                debug!(
                    "[RECONCILE] forgiving name mismatch for {} with same address {} using another name {}",
                    reg_name, remote.address, remote.name
                );
                claim(&mut rec, &mut matched_by, reg_name, remote);
            }
            Ok(None) => {
                debug!(
                    "[RECONCILE] found a legacy remote {} without a matching address {}",
                    remote.name, remote.address
                );
                rec.legacy.push(remote.clone());
            }
            Err(fault) => {
                warn!(
                    "[RECONCILE] cannot place remote {} {}: {}",
                    remote.id, remote.name, fault
                );
            }
        }
    }

    rec.missing = registry
        .names()
        .filter(|name| !rec.matched.contains(*name))
        .map(str::to_string)
        .collect();

    if !rec.is_consistent(registry) {
        rec.faults.push(KeeperError::Inconsistent {
            missing: rec.missing.len(),
            matched: rec.matched.len(),
            conflicting: rec.conflicting.len(),
            registered: registry.len(),
        });
    }

    rec
}

/// A second remote matching an already-matched entry is a conflict.
fn claim(
    rec: &mut Reconciliation,
    matched_by: &mut BTreeMap<String, RemoteId>,
    name: &str,
    remote: &RemoteConnection,
) {
    match matched_by.get(name) {
        Some(first) if *first != remote.id => {
            warn!(
                "[RECONCILE] remote {} duplicates {} for {} at {}",
                remote.id, first, name, remote.address
            );
            rec.conflicting
                .insert((name.to_string(), remote.address.clone()));
        }
        _ => {
            matched_by.insert(name.to_string(), remote.id);
            rec.matched.insert(name.to_string());
        }
    }
}

/// Classify the transport's remotes and remove every legacy one from it.
pub fn reconcile<T: Transport>(registry: &PeerRegistry, transport: &mut T) -> Reconciliation {
    let remotes = transport.remotes();
    debug!(
        "[RECONCILE] registry is {:?}",
        registry.iter().collect::<Vec<_>>()
    );
    debug!(
        "[RECONCILE] remotes are {:?}",
        remotes.iter().map(|r| r.name.as_str()).collect::<Vec<_>>()
    );

    let rec = classify(registry, &remotes);

    for fault in &rec.faults {
        match fault {
            KeeperError::Inconsistent { .. } => {
                error!("[RECONCILE] error reconciling registry with remotes: {}", fault);
                error!("[RECONCILE] missing: {:?}", rec.missing);
                error!("[RECONCILE] matched: {:?}", rec.matched);
                error!("[RECONCILE] conflicts: {:?}", rec.conflicting);
            }
            KeeperError::AmbiguousAddress { .. } => {
                error!("[RECONCILE] {}", fault);
            }
            _ => {}
        }
    }

    if !rec.conflicting.is_empty() {
        error!(
            "[RECONCILE] found conflicting address information {:?} in registry",
            rec.conflicting
        );
    }

    for legacy in &rec.legacy {
        error!(
            "[RECONCILE] found legacy entry [{}, {}] in remotes, that was not in registry",
            legacy.name, legacy.address
        );
        transport.remove_remote(legacy.id);
    }

    rec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::loopback::LoopbackTransport;
    use crate::p2p::test_utils::{addr, registry};
    use crate::p2p::transport::RemoteState;

    fn live(transport: &mut LoopbackTransport, name: &str, port: u16) -> RemoteId {
        transport.insert_remote(name, addr(port), RemoteState::connected())
    }

    #[test]
    fn test_all_missing_when_no_remotes() {
        let reg = registry(&[("Alpha", 9701), ("Beta", 9702)]);
        let rec = classify(&reg, &[]);

        assert_eq!(rec.missing.len(), 2);
        assert!(rec.matched.is_empty());
        assert!(rec.faults.is_empty());
        assert!(rec.is_consistent(&reg));
    }

    #[test]
    fn test_match_conflict_and_legacy() {
        let reg = registry(&[("Alpha", 9701), ("Beta", 9702), ("Gamma", 9703)]);
        let mut transport = LoopbackTransport::new();
        live(&mut transport, "Alpha", 9701);
        live(&mut transport, "Beta", 9800);
        let legacy = live(&mut transport, "Old", 9900);

        let rec = reconcile(&reg, &mut transport);

        assert!(rec.matched.contains("Alpha"));
        assert!(rec
            .conflicting
            .contains(&("Beta".to_string(), addr(9800))));
        // a stale address doesn't stand in for the registered one
        assert_eq!(rec.missing.iter().collect::<Vec<_>>(), vec!["Beta", "Gamma"]);
        assert_eq!(rec.legacy_ids().into_iter().collect::<Vec<_>>(), vec![legacy]);
        assert!(!rec.is_consistent(&reg));
        assert!(rec
            .faults
            .iter()
            .any(|f| matches!(f, KeeperError::Inconsistent { .. })));
        assert!(transport.remote(legacy).is_none());
        assert_eq!(transport.len(), 2);
    }

    #[test]
    fn test_conflicting_remote_leaves_name_missing() {
        let reg = registry(&[("Beta", 9702)]);
        let mut transport = LoopbackTransport::new();
        live(&mut transport, "Beta", 9800);

        let rec = classify(&reg, &transport.remotes());

        assert!(rec.missing.contains("Beta"));
        assert!(rec.matched.is_empty());
        assert_eq!(rec.conflicting.len(), 1);
        assert!(rec
            .faults
            .iter()
            .any(|f| matches!(f, KeeperError::ConflictingAddress { .. })));
        assert!(rec.faults.iter().any(|f| matches!(
            f,
            KeeperError::Inconsistent {
                missing: 1,
                matched: 0,
                conflicting: 1,
                registered: 1
            }
        )));
    }

    #[test]
    fn test_forgiving_name_mismatch() {
        let reg = registry(&[("Alpha", 9701)]);
        let mut transport = LoopbackTransport::new();
        transport.insert_remote("unnamed-7", addr(9701), RemoteState::default());

        let rec = reconcile(&reg, &mut transport);
        assert!(rec.matched.contains("Alpha"));
        assert!(rec.legacy.is_empty());
        assert_eq!(transport.len(), 1);
    }

    #[test]
    fn test_duplicate_match_is_a_conflict() {
        let reg = registry(&[("Alpha", 9701)]);
        let mut transport = LoopbackTransport::new();
        live(&mut transport, "Alpha", 9701);
        live(&mut transport, "unnamed-2", 9701);

        let rec = reconcile(&reg, &mut transport);
        assert!(rec.matched.contains("Alpha"));
        assert_eq!(rec.conflicting.len(), 1);
        assert!(!rec.is_consistent(&reg));
        assert!(rec
            .faults
            .iter()
            .any(|f| matches!(f, KeeperError::Inconsistent { .. })));
    }

    #[test]
    fn test_ambiguous_entries_are_not_matched() {
        let reg = registry(&[("Alpha", 9701), ("Beta", 9701), ("Gamma", 9703)]);
        let mut transport = LoopbackTransport::new();
        live(&mut transport, "Alpha", 9701);
        live(&mut transport, "unnamed-2", 9701);
        live(&mut transport, "Gamma", 9703);

        let rec = reconcile(&reg, &mut transport);

        assert!(!rec.matched.contains("Alpha"));
        assert!(!rec.matched.contains("Beta"));
        assert!(rec.matched.contains("Gamma"));
        assert_eq!(rec.ambiguous.len(), 2);
        assert!(rec.faults.iter().any(|f| f.is_configuration_fault()));
        // neither remote is thrown away over a registry mistake
        assert!(rec.legacy.is_empty());
        assert_eq!(transport.len(), 3);
        assert!(rec.is_consistent(&reg));
    }

    #[test]
    fn test_classify_is_idempotent() {
        let reg = registry(&[("Alpha", 9701), ("Beta", 9702), ("Gamma", 9703)]);
        let mut transport = LoopbackTransport::new();
        live(&mut transport, "Alpha", 9701);
        live(&mut transport, "Beta", 9999);
        live(&mut transport, "Delta", 9704);
        let remotes = transport.remotes();

        assert_eq!(classify(&reg, &remotes), classify(&reg, &remotes));

        let first = reconcile(&reg, &mut transport);
        let second = reconcile(&reg, &mut transport);
        assert_eq!(first.matched, second.matched);
        assert_eq!(first.missing, second.missing);
        assert_eq!(first.conflicting, second.conflicting);
        assert!(second.legacy.is_empty());
    }

    #[test]
    fn test_count_invariant_across_shapes() {
        let reg = registry(&[("A", 1), ("B", 2), ("C", 3), ("D", 4)]);
        // (layout, conflict expected)
        let layouts: Vec<(Vec<(&str, u16)>, bool)> = vec![
            (vec![], false),
            (vec![("A", 1)], false),
            (vec![("A", 1), ("B", 20)], true),
            (vec![("x", 3), ("y", 4), ("z", 50)], false),
            (vec![("A", 1), ("B", 2), ("C", 3), ("D", 4)], false),
        ];

        for (layout, conflict) in layouts {
            let mut transport = LoopbackTransport::new();
            for (name, port) in &layout {
                live(&mut transport, name, *port);
            }
            let rec = classify(&reg, &transport.remotes());
            assert_eq!(rec.missing.len() + rec.matched.len(), reg.len());
            assert_eq!(rec.is_consistent(&reg), !conflict, "layout {:?}", layout);
            assert_eq!(
                rec.faults
                    .iter()
                    .any(|f| matches!(f, KeeperError::Inconsistent { .. })),
                conflict,
                "layout {:?}",
                layout
            );
        }
    }
}
