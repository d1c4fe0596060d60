//! Sessions: one logical IKE relationship per endpoint pair.

use std::net::SocketAddr;
use std::time::Instant;

use ironike_proto::constants::{ISAKMP_NATT_PORT, ISAKMP_PORT};

use crate::sched::Token;

/// The `(local, remote)` endpoint pair a session is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointPair {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl EndpointPair {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        EndpointPair { local, remote }
    }

    /// Copy of this pair with the remote port replaced.
    pub fn with_remote_port(&self, port: u16) -> Self {
        let mut remote = self.remote;
        remote.set_port(port);
        EndpointPair {
            local: self.local,
            remote,
        }
    }

    /// Copy with both ports zeroed, for wildcard comparison.
    pub fn wildcard(&self) -> Self {
        let mut local = self.local;
        let mut remote = self.remote;
        local.set_port(0);
        remote.set_port(0);
        EndpointPair { local, remote }
    }

    /// Does the remote look like a default-port ISAKMP peer?
    pub fn remote_on_default_port(&self) -> bool {
        self.remote.port() == ISAKMP_PORT || self.remote.port() == ISAKMP_NATT_PORT
    }

    pub fn same_family(&self) -> bool {
        self.local.is_ipv4() == self.remote.is_ipv4()
    }
}

impl std::fmt::Display for EndpointPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// What kind of IPsec service this session turned out to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProfile {
    Plain,
    L2tpIpsec,
    CiscoIpsec,
    Btmm,
}

/// Why a session was (or is being) torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    UserRequested,
    IdleTimeout,
    PeerDead,
    Superseded,
    Expired,
    NegotiationFailed,
    PeerDeleted,
    Shutdown,
}

use crate::monitor::TrafficMonitor;
use crate::phase1::Phase1;
use crate::phase2::Phase2;
use crate::arena::Key;

pub type SessionKey = Key<Session>;
pub type Phase1Key = Key<Phase1>;
pub type Phase2Key = Key<Phase2>;

/// One logical IKE relationship between a local and a remote endpoint.
pub struct Session {
    pub endpoints: EndpointPair,
    pub established: bool,
    pub ports_floated: bool,
    /// True when the local side initiated this relationship (directly or
    /// through an external controller).
    pub is_client: bool,
    pub profile: SessionProfile,
    pub termination: Option<TerminationReason>,

    pub started_at: Instant,
    pub established_at: Option<Instant>,
    pub stopped_at: Option<Instant>,

    /// Traffic/idle/DPD monitor, initialized from the remote policy the
    /// first time a Phase 1 is linked.
    pub monitor: Option<TrafficMonitor>,

    pub phase1s: Vec<Phase1Key>,
    pub phase2s: Vec<Phase2Key>,

    pub active_phase1: u32,
    pub total_phase1: u32,
    pub active_phase2: u32,
    pub total_phase2: u32,

    pub sample_timer: Option<Token>,
    pub idle_timer: Option<Token>,
}

impl Session {
    pub fn new(endpoints: EndpointPair, now: Instant) -> Self {
        Session {
            endpoints,
            established: false,
            ports_floated: false,
            is_client: false,
            profile: SessionProfile::Plain,
            termination: None,
            started_at: now,
            established_at: None,
            stopped_at: None,
            monitor: None,
            phase1s: Vec::new(),
            phase2s: Vec::new(),
            active_phase1: 0,
            total_phase1: 0,
            active_phase2: 0,
            total_phase2: 0,
            sample_timer: None,
            idle_timer: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.active_phase1 == 0 && self.active_phase2 == 0
    }

    /// Record the tunnel flavor once it can be determined. A
    /// Cisco-IPsec classification is never overwritten.
    pub fn classify(&mut self, profile: SessionProfile) {
        if self.profile == SessionProfile::CiscoIpsec {
            return;
        }
        if self.profile == SessionProfile::Plain {
            self.profile = profile;
        } else if profile == SessionProfile::CiscoIpsec {
            self.profile = profile;
        }
    }

    /// Float both ports to the NAT-T port after detection.
    pub fn float_ports(&mut self, observed: EndpointPair) {
        self.endpoints = observed;
        self.ports_floated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(l: &str, r: &str) -> EndpointPair {
        EndpointPair::new(l.parse().unwrap(), r.parse().unwrap())
    }

    #[test]
    fn wildcard_zeroes_both_ports() {
        let p = pair("10.0.0.1:500", "10.0.0.2:4500");
        let w = p.wildcard();
        assert_eq!(w.local.port(), 0);
        assert_eq!(w.remote.port(), 0);
        assert_eq!(w.local.ip(), p.local.ip());
    }

    #[test]
    fn default_port_detection() {
        assert!(pair("10.0.0.1:500", "10.0.0.2:500").remote_on_default_port());
        assert!(pair("10.0.0.1:500", "10.0.0.2:4500").remote_on_default_port());
        assert!(!pair("10.0.0.1:500", "10.0.0.2:1701").remote_on_default_port());
    }

    #[test]
    fn cisco_classification_sticks() {
        let now = Instant::now();
        let mut s = Session::new(pair("10.0.0.1:500", "10.0.0.2:500"), now);
        assert_eq!(s.profile, SessionProfile::Plain);
        s.classify(SessionProfile::CiscoIpsec);
        s.classify(SessionProfile::L2tpIpsec);
        assert_eq!(s.profile, SessionProfile::CiscoIpsec);
    }

    #[test]
    fn l2tp_upgrades_to_cisco_but_not_back() {
        let now = Instant::now();
        let mut s = Session::new(pair("10.0.0.1:500", "10.0.0.2:500"), now);
        s.classify(SessionProfile::L2tpIpsec);
        assert_eq!(s.profile, SessionProfile::L2tpIpsec);
        s.classify(SessionProfile::Btmm);
        assert_eq!(s.profile, SessionProfile::L2tpIpsec);
        s.classify(SessionProfile::CiscoIpsec);
        assert_eq!(s.profile, SessionProfile::CiscoIpsec);
    }
}
