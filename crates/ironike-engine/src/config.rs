//! Engine configuration
//!
//! Runtime config plus its TOML file form. Per-peer sections resolve
//! into shared [`RemoteConfig`] values handed to every negotiation
//! with that peer.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use ironike_proto::policy::{
    DpdAlgorithm, DpdPolicy, ExchangeMode, IdleDirection, IdlePolicy, RemoteConfig,
};

use crate::error::{EngineError, EngineResult};

/// One configured peer.
#[derive(Debug, Clone)]
pub struct PeerPolicy {
    pub remote: SocketAddr,
    pub config: Arc<RemoteConfig>,
}

/// Runtime engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Local ISAKMP endpoint.
    pub listen: SocketAddr,
    /// Control socket listen address.
    pub control: SocketAddr,
    /// Answer negotiations from peers without a configured section
    /// using the default policy.
    pub accept_unconfigured: bool,
    pub default_remote: Arc<RemoteConfig>,
    pub peers: Vec<PeerPolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            listen: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                ironike_proto::constants::ISAKMP_PORT,
            ),
            control: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7791),
            accept_unconfigured: false,
            default_remote: Arc::new(RemoteConfig::default()),
            peers: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Resolve the negotiation policy for a peer, matched by address
    /// (ports float, addresses do not).
    pub fn policy_for(&self, remote: SocketAddr) -> Option<Arc<RemoteConfig>> {
        self.peers
            .iter()
            .find(|p| p.remote.ip() == remote.ip())
            .map(|p| Arc::clone(&p.config))
            .or_else(|| {
                self.accept_unconfigured
                    .then(|| Arc::clone(&self.default_remote))
            })
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let file: EngineConfigFile =
            toml::from_str(&text).map_err(|e| EngineError::Config(e.to_string()))?;
        Self::from_file(file)
    }

    pub fn from_file(file: EngineConfigFile) -> EngineResult<Self> {
        let listen = file
            .engine
            .listen
            .parse()
            .map_err(|e| EngineError::Config(format!("bad listen address: {}", e)))?;
        let control = file
            .engine
            .control
            .parse()
            .map_err(|e| EngineError::Config(format!("bad control address: {}", e)))?;

        let mut peers = Vec::with_capacity(file.peer.len());
        for section in &file.peer {
            peers.push(section.resolve()?);
        }

        Ok(EngineConfig {
            listen,
            control,
            accept_unconfigured: file.engine.accept_unconfigured,
            default_remote: Arc::new(RemoteConfig::default()),
            peers,
        })
    }
}

/// TOML-deserializable configuration file format.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfigFile {
    pub engine: EngineSection,
    #[serde(default)]
    pub peer: Vec<PeerSection>,
}

/// The `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// ISAKMP listen address (default: "0.0.0.0:500")
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Control socket address (default: "127.0.0.1:7791")
    #[serde(default = "default_control")]
    pub control: String,

    /// Accept negotiations from unconfigured peers (default: false)
    #[serde(default)]
    pub accept_unconfigured: bool,
}

/// One `[[peer]]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerSection {
    /// Peer address, e.g. "203.0.113.7:500"
    pub remote: String,

    /// Pre-shared secret (base64)
    pub psk: String,

    /// Exchange mode: "main" or "aggressive" (default: main)
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Retransmissions per handshake message (default: 5)
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Seconds between retransmissions (default: 5)
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,

    /// Phase 1 lifetime in seconds (default: 28800)
    #[serde(default = "default_phase1_lifetime")]
    pub phase1_lifetime: u64,

    /// Phase 2 lifetime in seconds (default: 3600)
    #[serde(default = "default_phase2_lifetime")]
    pub phase2_lifetime: u64,

    /// DPD probe interval in seconds, 0 disables DPD (default: 30)
    #[serde(default = "default_dpd_interval")]
    pub dpd_interval: u64,

    /// Seconds to wait for a probe ack (default: 5)
    #[serde(default = "default_dpd_retry_timeout")]
    pub dpd_retry_timeout: u64,

    /// Unacked probes before the peer is presumed dead (default: 5)
    #[serde(default = "default_dpd_max_fails")]
    pub dpd_max_fails: u32,

    /// "inbound" or "blackhole" (default: inbound)
    #[serde(default = "default_dpd_algorithm")]
    pub dpd_algorithm: String,

    /// Idle teardown in seconds, 0 disables (default: 0)
    #[serde(default)]
    pub idle_timeout: u64,

    /// "any", "inbound", or "outbound" (default: any)
    #[serde(default = "default_idle_direction")]
    pub idle_direction: String,

    /// Offer NAT-Traversal (default: true)
    #[serde(default = "default_true")]
    pub natt: bool,

    /// Offer IKE fragmentation (default: true)
    #[serde(default = "default_true")]
    pub fragmentation: bool,

    /// Expect an XAUTH sub-exchange after Phase 1 (default: false)
    #[serde(default)]
    pub xauth: bool,

    /// Back-to-My-Mac style wildcard service (default: false)
    #[serde(default)]
    pub btmm: bool,

    /// Negotiate transport mode (default: false)
    #[serde(default)]
    pub transport: bool,

    /// Traffic selector targets the L2TP port (default: false)
    #[serde(default)]
    pub l2tp: bool,
}

impl PeerSection {
    fn resolve(&self) -> EngineResult<PeerPolicy> {
        let remote: SocketAddr = self
            .remote
            .parse()
            .map_err(|e| EngineError::Config(format!("bad peer address {}: {}", self.remote, e)))?;

        let psk = base64::decode(&self.psk)
            .map_err(|_| EngineError::Config(format!("peer {}: psk is not base64", self.remote)))?;

        let exchange_mode = match self.mode.as_str() {
            "main" => ExchangeMode::Main,
            "aggressive" => ExchangeMode::Aggressive,
            other => {
                return Err(EngineError::Config(format!(
                    "peer {}: unknown mode {:?}",
                    self.remote, other
                )))
            }
        };

        let dpd = (self.dpd_interval > 0)
            .then(|| -> EngineResult<DpdPolicy> {
                Ok(DpdPolicy {
                    interval: Duration::from_secs(self.dpd_interval),
                    retry_timeout: Duration::from_secs(self.dpd_retry_timeout),
                    max_fails: self.dpd_max_fails,
                    algorithm: match self.dpd_algorithm.as_str() {
                        "inbound" => DpdAlgorithm::InboundDetect,
                        "blackhole" => DpdAlgorithm::BlackholeDetect,
                        other => {
                            return Err(EngineError::Config(format!(
                                "peer {}: unknown dpd algorithm {:?}",
                                self.remote, other
                            )))
                        }
                    },
                })
            })
            .transpose()?;

        let idle = (self.idle_timeout > 0)
            .then(|| -> EngineResult<IdlePolicy> {
                Ok(IdlePolicy {
                    timeout: Duration::from_secs(self.idle_timeout),
                    direction: match self.idle_direction.as_str() {
                        "any" => IdleDirection::Any,
                        "inbound" => IdleDirection::Inbound,
                        "outbound" => IdleDirection::Outbound,
                        other => {
                            return Err(EngineError::Config(format!(
                                "peer {}: unknown idle direction {:?}",
                                self.remote, other
                            )))
                        }
                    },
                })
            })
            .transpose()?;

        Ok(PeerPolicy {
            remote,
            config: Arc::new(RemoteConfig {
                exchange_mode,
                psk,
                proposal: Vec::new(),
                retry_limit: self.retry_limit,
                retry_interval: Duration::from_secs(self.retry_interval),
                phase1_lifetime: Duration::from_secs(self.phase1_lifetime),
                phase2_lifetime: Duration::from_secs(self.phase2_lifetime),
                dpd,
                idle,
                natt_enabled: self.natt,
                fragmentation: self.fragmentation,
                xauth: self.xauth,
                btmm: self.btmm,
                transport: self.transport,
                l2tp: self.l2tp,
            }),
        })
    }
}

fn default_listen() -> String {
    "0.0.0.0:500".to_string()
}
fn default_control() -> String {
    "127.0.0.1:7791".to_string()
}
fn default_mode() -> String {
    "main".to_string()
}
fn default_retry_limit() -> u32 {
    5
}
fn default_retry_interval() -> u64 {
    5
}
fn default_phase1_lifetime() -> u64 {
    28800
}
fn default_phase2_lifetime() -> u64 {
    3600
}
fn default_dpd_interval() -> u64 {
    30
}
fn default_dpd_retry_timeout() -> u64 {
    5
}
fn default_dpd_max_fails() -> u32 {
    5
}
fn default_dpd_algorithm() -> String {
    "inbound".to_string()
}
fn default_idle_direction() -> String {
    "any".to_string()
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let toml_str = r#"
[engine]
listen = "0.0.0.0:500"
control = "127.0.0.1:7791"

[[peer]]
remote = "203.0.113.7:500"
psk = "c2VjcmV0"
mode = "aggressive"
dpd_interval = 20
idle_timeout = 600
idle_direction = "inbound"
l2tp = true
transport = true
"#;
        let file: EngineConfigFile = toml::from_str(toml_str).unwrap();
        let cfg = EngineConfig::from_file(file).unwrap();
        assert_eq!(cfg.peers.len(), 1);
        let peer = &cfg.peers[0].config;
        assert_eq!(peer.exchange_mode, ExchangeMode::Aggressive);
        assert_eq!(peer.psk, b"secret");
        assert_eq!(peer.dpd.as_ref().unwrap().interval, Duration::from_secs(20));
        assert_eq!(
            peer.idle.as_ref().unwrap().direction,
            IdleDirection::Inbound
        );
        assert!(peer.l2tp);
        assert!(peer.transport);
    }

    #[test]
    fn dpd_zero_disables() {
        let toml_str = r#"
[engine]

[[peer]]
remote = "203.0.113.7:500"
psk = "c2VjcmV0"
dpd_interval = 0
"#;
        let file: EngineConfigFile = toml::from_str(toml_str).unwrap();
        let cfg = EngineConfig::from_file(file).unwrap();
        assert!(cfg.peers[0].config.dpd.is_none());
    }

    #[test]
    fn bad_mode_rejected() {
        let toml_str = r#"
[engine]

[[peer]]
remote = "203.0.113.7:500"
psk = "c2VjcmV0"
mode = "quick"
"#;
        let file: EngineConfigFile = toml::from_str(toml_str).unwrap();
        assert!(matches!(
            EngineConfig::from_file(file),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn policy_matches_by_address_not_port() {
        let toml_str = r#"
[engine]

[[peer]]
remote = "203.0.113.7:500"
psk = "c2VjcmV0"
"#;
        let file: EngineConfigFile = toml::from_str(toml_str).unwrap();
        let cfg = EngineConfig::from_file(file).unwrap();
        assert!(cfg.policy_for("203.0.113.7:4500".parse().unwrap()).is_some());
        assert!(cfg.policy_for("203.0.113.8:500".parse().unwrap()).is_none());
    }
}
