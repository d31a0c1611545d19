//! Nice joins - courteous bi-directional connection setup
//!
//! Every node computes the same pairwise assignment from the shared set of names, so for each
//! pair exactly one side waits while the other dials. The waiting only lasts for the nice
//! window; after that every node dials whatever is still missing.

use std::collections::{BTreeMap, BTreeSet};
use tokio::time::Instant;

use crate::util::deadline;

/// Split every unordered pair of `names` between its two members.
///
/// Pairs are walked in sorted order; the first name of a pair takes the second while it holds
/// fewer than `ceil(pairs / names)` entries, otherwise the second takes the first. Each node's
/// list names the peers it waits for.
pub fn distributed_connection_map<'a, I>(names: I) -> BTreeMap<String, Vec<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    let names: BTreeSet<&str> = names.into_iter().collect();
    let names: Vec<&str> = names.into_iter().collect();
    let mut map: BTreeMap<String, Vec<String>> =
        names.iter().map(|n| (n.to_string(), Vec::new())).collect();

    let n = names.len();
    if n < 2 {
        return map;
    }
    let pairs = n * (n - 1) / 2;
    let max_per = pairs.div_ceil(n);

    for (i, a) in names.iter().enumerate() {
        for b in &names[i + 1..] {
            let a_full = map.get(*a).map_or(0, Vec::len) >= max_per;
            let (waiter, initiator) = if a_full { (*b, *a) } else { (*a, *b) };
            if let Some(list) = map.get_mut(waiter) {
                list.push(initiator.to_string());
            }
        }
    }
    map
}

/// Peers `self_name` should give the first chance to connect.
pub fn nice_peers_for<'a, I>(self_name: &'a str, all_names: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    distributed_connection_map(all_names.into_iter().chain(std::iter::once(self_name)))
        .remove(self_name)
        .unwrap_or_default()
        .into_iter()
        .collect()
}

/// Lifecycle of the nice window within one session. It opens the first time peers are found
/// missing and is never reopened once it expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NiceWindow {
    #[default]
    NotStarted,
    Open { until: Instant },
    Expired,
}

impl NiceWindow {
    /// Advance the window for `now`; returns whether nice waiting applies.
    pub fn observe(&mut self, now: Instant, length: std::time::Duration) -> bool {
        if let NiceWindow::NotStarted = self {
            *self = NiceWindow::Open {
                until: deadline(now, length),
            };
        }
        match *self {
            NiceWindow::Open { until } if now < until => true,
            NiceWindow::Open { .. } => {
                *self = NiceWindow::Expired;
                false
            }
            _ => false,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, NiceWindow::Open { .. })
    }

    /// End of the window while it is open.
    pub fn closes_at(&self) -> Option<Instant> {
        match self {
            NiceWindow::Open { until } => Some(*until),
            _ => None,
        }
    }
}
