//! Per-peer negotiation policy.
//!
//! A [`RemoteConfig`] is resolved once per peer from the daemon
//! configuration and shared by every negotiation with that peer. The
//! engine consults it for exchange mode, retransmission budget,
//! lifetimes, and the liveness/idle monitoring knobs.

use std::time::Duration;

/// Phase 1 exchange variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMode {
    Main,
    Aggressive,
}

/// Which probe strategy Dead Peer Detection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpdAlgorithm {
    /// Probe only when the peer has sent no data since the last sample.
    InboundDetect,
    /// Probe only when we sent data but received none back.
    BlackholeDetect,
}

/// Which traffic direction(s) reset the idle timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDirection {
    Any,
    Inbound,
    Outbound,
}

/// Dead Peer Detection knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpdPolicy {
    /// Interval between probes when the strategy calls for one.
    pub interval: Duration,
    /// How long to wait for an ack before counting a failure.
    pub retry_timeout: Duration,
    /// Failures before the peer is presumed dead.
    pub max_fails: u32,
    pub algorithm: DpdAlgorithm,
}

impl Default for DpdPolicy {
    fn default() -> Self {
        DpdPolicy {
            interval: Duration::from_secs(30),
            retry_timeout: Duration::from_secs(5),
            max_fails: 5,
            algorithm: DpdAlgorithm::InboundDetect,
        }
    }
}

/// Idle-teardown knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdlePolicy {
    pub timeout: Duration,
    pub direction: IdleDirection,
}

/// Everything the engine needs to know about one remote peer.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub exchange_mode: ExchangeMode,
    /// Pre-shared secret handed to the crypto backend, opaque here.
    pub psk: Vec<u8>,
    /// Opaque Phase 1 proposal body.
    pub proposal: Vec<u8>,
    /// Retransmissions per handshake message.
    pub retry_limit: u32,
    pub retry_interval: Duration,
    pub phase1_lifetime: Duration,
    pub phase2_lifetime: Duration,
    pub dpd: Option<DpdPolicy>,
    pub idle: Option<IdlePolicy>,
    pub natt_enabled: bool,
    pub fragmentation: bool,
    /// Peer requires XAUTH after Phase 1 authentication.
    pub xauth: bool,
    /// Treat this peer's tunnels as Back-to-My-Mac style wildcard service.
    pub btmm: bool,
    /// Negotiate transport-mode SAs instead of tunnel mode.
    pub transport: bool,
    /// Traffic selector targets the L2TP port.
    pub l2tp: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            exchange_mode: ExchangeMode::Main,
            psk: Vec::new(),
            proposal: Vec::new(),
            retry_limit: 5,
            retry_interval: Duration::from_secs(5),
            phase1_lifetime: Duration::from_secs(28800),
            phase2_lifetime: Duration::from_secs(3600),
            dpd: Some(DpdPolicy::default()),
            idle: None,
            natt_enabled: true,
            fragmentation: true,
            xauth: false,
            btmm: false,
            transport: false,
            l2tp: false,
        }
    }
}

impl RemoteConfig {
    /// Policy with all optional monitoring off, for tests and loopback use.
    pub fn bare() -> Self {
        RemoteConfig {
            dpd: None,
            idle: None,
            ..RemoteConfig::default()
        }
    }
}
