//! Peer Registry - the authoritative name → address map this node keeps in touch with
//!
//! The registry is read-only while a maintenance cycle runs. Replacements are handed to the
//! connection maintainer through its [`RegistryHandle`](super::connection_maintainer::RegistryHandle)
//! and applied at the start of the next tick.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::KeeperError;
use crate::p2p::transport::RemoteConnection;

/// Hosts that all mean "this machine" when the ports agree.
const LOCAL_HOSTS: [&str; 2] = ["127.0.0.1", "0.0.0.0"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    #[error("invalid peer address format (missing port): {0}")]
    MissingPort(String),
    #[error("invalid port in peer address {0}")]
    InvalidPort(String),
    #[error("empty host in peer address {0}")]
    EmptyHost(String),
}

/// Network address of a peer (host, port). Serialized as `"host:port"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address equality that treats the local wildcard and loopback hosts as one.
    pub fn same_as(&self, other: &Address) -> bool {
        if self == other {
            return true;
        }
        if self.port != other.port {
            return false;
        }
        LOCAL_HOSTS.contains(&self.host.as_str()) && LOCAL_HOSTS.contains(&other.host.as_str())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressParseError::InvalidPort(s.to_string()))?;
        Ok(Address::new(host, port))
    }
}

impl TryFrom<String> for Address {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> String {
        addr.to_string()
    }
}

/// Mapping of peer name → address. Keys are unique; iteration order is by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerRegistry {
    entries: BTreeMap<String, Address>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, address: Address) -> Option<Address> {
        self.entries.insert(name.into(), address)
    }

    pub fn remove(&mut self, name: &str) -> Option<Address> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Address> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Address)> {
        self.entries.iter().map(|(name, addr)| (name.as_str(), addr))
    }

    /// Registry without `name` (a node never connects to itself).
    pub fn without(mut self, name: &str) -> Self {
        self.entries.remove(name);
        self
    }

    /// Name of the unique entry at `address`, `Ok(None)` if there is none.
    pub fn find_by_address(&self, address: &Address) -> Result<Option<&str>, KeeperError> {
        let names: Vec<&str> = self
            .iter()
            .filter(|(_, addr)| addr.same_as(address))
            .map(|(name, _)| name)
            .collect();

        match names.as_slice() {
            [] => Ok(None),
            [name] => Ok(Some(*name)),
            _ => Err(KeeperError::AmbiguousAddress {
                address: address.clone(),
                names: names.iter().map(|n| n.to_string()).collect(),
            }),
        }
    }

    /// One fault per address shared by more than one entry.
    pub fn ambiguities(&self) -> Vec<KeeperError> {
        let mut groups: Vec<(Address, Vec<String>)> = Vec::new();
        for (name, addr) in self.iter() {
            match groups.iter_mut().find(|(a, _)| a.same_as(addr)) {
                Some((_, names)) => names.push(name.to_string()),
                None => groups.push((addr.clone(), vec![name.to_string()])),
            }
        }

        groups
            .into_iter()
            .filter(|(_, names)| names.len() > 1)
            .map(|(address, names)| KeeperError::AmbiguousAddress { address, names })
            .collect()
    }

    /// Names excluded from matching because they share an address.
    pub fn ambiguous_names(&self) -> BTreeSet<String> {
        self.ambiguities()
            .into_iter()
            .flat_map(|fault| match fault {
                KeeperError::AmbiguousAddress { names, .. } => names,
                _ => Vec::new(),
            })
            .collect()
    }

    /// Registry name of `remote`: its own name when registered, else the unique entry at its
    /// address (forgiving a name mismatch).
    pub fn remote_name(&self, remote: &RemoteConnection) -> Result<Option<String>, KeeperError> {
        if self.contains(&remote.name) {
            return Ok(Some(remote.name.clone()));
        }
        Ok(self.find_by_address(&remote.address)?.map(str::to_string))
    }
}

impl<N: Into<String>> FromIterator<(N, Address)> for PeerRegistry {
    fn from_iter<I: IntoIterator<Item = (N, Address)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(n, a)| (n.into(), a)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::test_utils::{addr, registry};

    #[test]
    fn test_parse_address() {
        let a: Address = "10.0.0.1:9701".parse().unwrap();
        assert_eq!(a, Address::new("10.0.0.1", 9701));
        assert_eq!(a.to_string(), "10.0.0.1:9701");

        assert!(matches!(
            "10.0.0.1".parse::<Address>(),
            Err(AddressParseError::MissingPort(_))
        ));
        assert!(matches!(
            "10.0.0.1:http".parse::<Address>(),
            Err(AddressParseError::InvalidPort(_))
        ));
        assert!(matches!(
            ":80".parse::<Address>(),
            Err(AddressParseError::EmptyHost(_))
        ));
    }

    #[test]
    fn test_local_hosts_are_the_same() {
        assert!(Address::new("0.0.0.0", 9701).same_as(&Address::new("127.0.0.1", 9701)));
        assert!(!Address::new("0.0.0.0", 9701).same_as(&Address::new("127.0.0.1", 9702)));
        assert!(!Address::new("10.0.0.1", 9701).same_as(&Address::new("127.0.0.1", 9701)));
    }

    #[test]
    fn test_find_by_address() {
        let reg = registry(&[("Alpha", 9701), ("Beta", 9702)]);
        assert_eq!(reg.find_by_address(&addr(9702)).unwrap(), Some("Beta"));
        assert_eq!(reg.find_by_address(&addr(9999)).unwrap(), None);
    }

    #[test]
    fn test_ambiguous_registry() {
        let reg = registry(&[("Alpha", 9701), ("Beta", 9701), ("Gamma", 9703)]);

        assert!(matches!(
            reg.find_by_address(&addr(9701)),
            Err(KeeperError::AmbiguousAddress { .. })
        ));
        assert_eq!(reg.ambiguities().len(), 1);
        let names: Vec<String> = reg.ambiguous_names().into_iter().collect();
        assert_eq!(names, vec!["Alpha".to_string(), "Beta".to_string()]);
    }

    #[test]
    fn test_without_self() {
        let reg = registry(&[("Alpha", 9701), ("Beta", 9702)]).without("Alpha");
        assert_eq!(reg.len(), 1);
        assert!(!reg.contains("Alpha"));
    }

    #[test]
    fn test_registry_toml_roundtrip_shape() {
        let reg: PeerRegistry = toml::from_str("Alpha = \"127.0.0.1:9701\"\nBeta = \"10.0.0.2:9702\"\n").unwrap();
        assert_eq!(reg.get("Beta"), Some(&Address::new("10.0.0.2", 9702)));
        assert!(toml::from_str::<PeerRegistry>("Alpha = \"nope\"").is_err());
    }
}
