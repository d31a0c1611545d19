//! P2P Configuration Module
//!
//! Handles loading and validation of the connection keeper configuration: this node's name,
//! the peer registry and the maintenance cadence.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::KeeperError;
use crate::p2p::registry::PeerRegistry;
use crate::util::ratchet::Ratchet;

/// Upper bound for every interval and timeout, and for the ratchet peak (one week).
pub const MAX_INTERVAL_SECS: u64 = 7 * 24 * 3600;

/// Parameters of the reconnection ratchet (seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatchetConfig {
    #[serde(default = "default_ratchet_a")]
    pub a: f64,
    #[serde(default = "default_ratchet_b")]
    pub b: f64,
    #[serde(default = "default_ratchet_c")]
    pub c: f64,
    #[serde(default = "default_ratchet_base")]
    pub base: Option<f64>,
    #[serde(default = "default_ratchet_peak")]
    pub peak: Option<f64>,
}

fn default_ratchet_a() -> f64 {
    8.0
}

fn default_ratchet_b() -> f64 {
    0.198
}

fn default_ratchet_c() -> f64 {
    -4.0
}

fn default_ratchet_base() -> Option<f64> {
    Some(8.0)
}

fn default_ratchet_peak() -> Option<f64> {
    Some(3600.0)
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            a: default_ratchet_a(),
            b: default_ratchet_b(),
            c: default_ratchet_c(),
            base: default_ratchet_base(),
            peak: default_ratchet_peak(),
        }
    }
}

impl RatchetConfig {
    pub fn to_ratchet(&self) -> Ratchet {
        Ratchet::new(self.a, self.b, self.c, self.base, self.peak)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeeperConfig {
    /// Name this node is registered under
    pub node_name: String,

    /// Peers to keep connected (`name = "host:port"`)
    #[serde(default)]
    pub registry: PeerRegistry,

    /// Automatic key sharing tightens the check cadence
    #[serde(default)]
    pub auto_key_sharing: bool,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    #[serde(default = "default_check_interval_no_sharing")]
    pub check_interval_no_sharing_secs: u64,

    /// Length of the nice window, and the retry delay for missing peers
    #[serde(default = "default_reconnect_in")]
    pub reconnect_to_missing_in_secs: u64,

    /// Recheck delay while a handshake is still in progress
    #[serde(default = "default_reconnect_in")]
    pub reconnect_to_disconnected_in_secs: u64,

    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,

    #[serde(default = "default_allow_timeout")]
    pub allow_timeout_secs: u64,

    /// Pace retries of unhealthy remotes with the ratchet instead of every check
    #[serde(default)]
    pub reconnect_backoff: bool,

    #[serde(default)]
    pub ratchet: RatchetConfig,
}

fn default_check_interval() -> u64 {
    6
}

fn default_check_interval_no_sharing() -> u64 {
    15
}

fn default_reconnect_in() -> u64 {
    6
}

fn default_join_timeout() -> u64 {
    30
}

fn default_allow_timeout() -> u64 {
    20
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            registry: PeerRegistry::new(),
            auto_key_sharing: false,
            check_interval_secs: default_check_interval(),
            check_interval_no_sharing_secs: default_check_interval_no_sharing(),
            reconnect_to_missing_in_secs: default_reconnect_in(),
            reconnect_to_disconnected_in_secs: default_reconnect_in(),
            join_timeout_secs: default_join_timeout(),
            allow_timeout_secs: default_allow_timeout(),
            reconnect_backoff: false,
            ratchet: RatchetConfig::default(),
        }
    }
}

impl KeeperConfig {
    pub fn new(node_name: impl Into<String>, registry: PeerRegistry) -> Self {
        Self {
            node_name: node_name.into(),
            registry,
            ..Self::default()
        }
    }

    /// Validate the configuration
    ///
    /// Ambiguous registry addresses are not rejected here; the maintainer reports them and
    /// leaves the affected entries out of matching.
    pub fn validate(&self) -> Result<(), KeeperError> {
        if self.node_name.trim().is_empty() {
            return Err(KeeperError::InvalidConfig(
                "node_name cannot be empty".to_string(),
            ));
        }

        let intervals = [
            ("check_interval_secs", self.check_interval_secs),
            (
                "check_interval_no_sharing_secs",
                self.check_interval_no_sharing_secs,
            ),
            (
                "reconnect_to_missing_in_secs",
                self.reconnect_to_missing_in_secs,
            ),
            (
                "reconnect_to_disconnected_in_secs",
                self.reconnect_to_disconnected_in_secs,
            ),
            ("join_timeout_secs", self.join_timeout_secs),
            ("allow_timeout_secs", self.allow_timeout_secs),
        ];
        for (field, value) in intervals {
            if value == 0 || value > MAX_INTERVAL_SECS {
                return Err(KeeperError::InvalidConfig(format!(
                    "{} must be between 1 and {}",
                    field, MAX_INTERVAL_SECS
                )));
            }
        }

        let r = &self.ratchet;
        if !(r.a.is_finite() && r.b.is_finite() && r.c.is_finite()) || r.a <= 0.0 || r.b < 0.0 {
            return Err(KeeperError::InvalidConfig(
                "ratchet needs a > 0 and b >= 0".to_string(),
            ));
        }
        for (field, bound) in [("base", r.base), ("peak", r.peak)] {
            if let Some(secs) = bound {
                if !secs.is_finite() || secs < 0.0 || secs > MAX_INTERVAL_SECS as f64 {
                    return Err(KeeperError::InvalidConfig(format!(
                        "ratchet {} must be between 0 and {} seconds",
                        field, MAX_INTERVAL_SECS
                    )));
                }
            }
        }
        if let (Some(base), Some(peak)) = (r.base, r.peak) {
            if base > peak {
                return Err(KeeperError::InvalidConfig(
                    "ratchet base cannot be greater than peak".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Cadence of regular checks, which depends on the key sharing mode.
    pub fn check_interval(&self) -> Duration {
        if self.auto_key_sharing {
            Duration::from_secs(self.check_interval_secs)
        } else {
            Duration::from_secs(self.check_interval_no_sharing_secs)
        }
    }

    pub fn reconnect_to_missing_in(&self) -> Duration {
        Duration::from_secs(self.reconnect_to_missing_in_secs)
    }

    pub fn reconnect_to_disconnected_in(&self) -> Duration {
        Duration::from_secs(self.reconnect_to_disconnected_in_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn allow_timeout(&self) -> Duration {
        Duration::from_secs(self.allow_timeout_secs)
    }
}

fn env_flag(val: &str) -> bool {
    val.to_lowercase() == "true" || val == "1"
}

/// Load the keeper configuration from a TOML file
pub fn load_keeper_config(path: &Path) -> Result<KeeperConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let mut config: KeeperConfig =
        toml::from_str(&content).context("Failed to parse TOML config")?;

    // Override from environment variables if present
    if let Ok(val) = std::env::var("PEER_KEEPER_NODE_NAME") {
        if !val.trim().is_empty() {
            config.node_name = val.trim().to_string();
        }
    }
    if let Ok(val) = std::env::var("PEER_KEEPER_AUTO_KEY_SHARING") {
        config.auto_key_sharing = env_flag(&val);
    }

    config.validate()?;

    for fault in config.registry.ambiguities() {
        tracing::warn!("[CONFIG] {}", fault);
    }
    if !config.registry.contains(&config.node_name) {
        tracing::warn!(
            "[CONFIG] node {} is not in its own registry",
            config.node_name
        );
    }

    tracing::info!(
        node = %config.node_name,
        peers = config.registry.len(),
        auto_key_sharing = config.auto_key_sharing,
        check_interval_secs = config.check_interval().as_secs(),
        "Loaded keeper configuration"
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::test_utils::registry;
    use std::io::Write;

    const SAMPLE: &str = r#"
node_name = "Alpha"
auto_key_sharing = true

[registry]
Alpha = "127.0.0.1:9701"
Beta = "127.0.0.1:9702"
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = KeeperConfig::new("Alpha", registry(&[("Alpha", 9701)]));
        assert!(config.validate().is_ok());
        assert_eq!(config.check_interval(), Duration::from_secs(15));
        assert_eq!(config.join_timeout(), Duration::from_secs(30));
        assert_eq!(config.allow_timeout(), Duration::from_secs(20));
        assert!(!config.reconnect_backoff);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = KeeperConfig::new("", PeerRegistry::new());
        assert!(matches!(
            config.validate(),
            Err(KeeperError::InvalidConfig(_))
        ));

        config.node_name = "Alpha".to_string();
        config.reconnect_to_missing_in_secs = 0;
        assert!(config.validate().is_err());

        config.reconnect_to_missing_in_secs = 6;
        config.ratchet.base = Some(10_000.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_durations() {
        let mut config = KeeperConfig::new("Alpha", registry(&[("Alpha", 9701)]));
        config.check_interval_secs = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(KeeperError::InvalidConfig(_))
        ));

        config.check_interval_secs = MAX_INTERVAL_SECS;
        assert!(config.validate().is_ok());

        config.join_timeout_secs = MAX_INTERVAL_SECS + 1;
        assert!(config.validate().is_err());

        config.join_timeout_secs = 30;
        config.ratchet.peak = Some(1e30);
        assert!(config.validate().is_err());

        config.ratchet.peak = Some(f64::INFINITY);
        assert!(config.validate().is_err());

        config.ratchet.peak = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ambiguous_registry_is_not_rejected() {
        let config = KeeperConfig::new("Alpha", registry(&[("Alpha", 9701), ("Beta", 9701)]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(SAMPLE);
        let config = load_keeper_config(file.path()).unwrap();

        assert_eq!(config.registry.len(), 2);
        assert!(config.auto_key_sharing);
        assert_eq!(config.check_interval(), Duration::from_secs(6));
        assert_eq!(config.ratchet, RatchetConfig::default());
    }

    #[test]
    fn test_load_rejects_bad_address() {
        let file = write_config("node_name = \"Alpha\"\n[registry]\nBeta = \"no-port\"\n");
        assert!(load_keeper_config(file.path()).is_err());
    }

    #[test]
    fn test_default_ratchet_curve() {
        let ratchet = RatchetConfig::default().to_ratchet();
        assert_eq!(ratchet.get(0), 8.0);
        assert_eq!(ratchet.get(100), 3600.0);
    }
}
