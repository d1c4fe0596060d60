//! Traffic / idle / DPD monitoring sub-state.
//!
//! One `TrafficMonitor` per session, configured once from the remote
//! policy. A periodic sampling timer polls the kernel byte counters;
//! the deltas drive the "peer sent data" / "I sent data" flags that
//! feed both idle detection and the two DPD probe strategies.

use std::time::Duration;

use ironike_proto::policy::{DpdAlgorithm, DpdPolicy, IdleDirection, IdlePolicy, RemoteConfig};

/// Per-session traffic monitor state.
#[derive(Debug, Clone)]
pub struct TrafficMonitor {
    pub dpd: Option<DpdPolicy>,
    pub idle: Option<IdlePolicy>,

    last_inbound: u64,
    last_outbound: u64,

    /// Peer sent data during the current sampling window.
    peer_sent_data: bool,
    /// We sent data during the current sampling window.
    i_sent_data: bool,
}

impl TrafficMonitor {
    /// Build the monitor from the remote policy, or `None` if neither
    /// DPD nor idle monitoring applies.
    pub fn from_remote(remote: &RemoteConfig) -> Option<Self> {
        if remote.dpd.is_none() && remote.idle.is_none() {
            return None;
        }
        Some(TrafficMonitor {
            dpd: remote.dpd.clone(),
            idle: remote.idle.clone(),
            last_inbound: 0,
            last_outbound: 0,
            peer_sent_data: false,
            i_sent_data: false,
        })
    }

    /// The sampling period: one-twentieth of the smaller applicable
    /// interval, floored at one second. A zero period would both starve
    /// and busy-loop the scheduler.
    pub fn sample_period(&self) -> Duration {
        let dpd_secs = self.dpd.as_ref().map(|d| d.interval.as_secs());
        let idle_secs = self.idle.as_ref().map(|i| i.timeout.as_secs());
        let base = match (dpd_secs, idle_secs) {
            (Some(d), Some(t)) => d.min(t),
            (Some(d), None) => d,
            (None, Some(t)) => t,
            (None, None) => 0,
        };
        Duration::from_secs((base / 20).max(1))
    }

    /// Record an inbound byte counter reading. Returns true if the peer
    /// sent data since the previous reading.
    pub fn observe_inbound(&mut self, bytes: u64) -> bool {
        let fresh = bytes > self.last_inbound;
        self.last_inbound = bytes;
        if fresh {
            self.peer_sent_data = true;
        }
        fresh
    }

    /// Record an outbound byte counter reading.
    pub fn observe_outbound(&mut self, bytes: u64) -> bool {
        let fresh = bytes > self.last_outbound;
        self.last_outbound = bytes;
        if fresh {
            self.i_sent_data = true;
        }
        fresh
    }

    /// Should a DPD probe go out, judged on the window that just ended?
    pub fn should_probe(&self) -> bool {
        let algorithm = match &self.dpd {
            Some(d) => d.algorithm,
            None => return false,
        };
        match algorithm {
            DpdAlgorithm::InboundDetect => !self.peer_sent_data,
            DpdAlgorithm::BlackholeDetect => self.i_sent_data && !self.peer_sent_data,
        }
    }

    /// Did the window that just ended carry traffic in the direction(s)
    /// that reset the idle timer?
    pub fn idle_refreshed(&self) -> bool {
        let direction = match &self.idle {
            Some(i) => i.direction,
            None => return false,
        };
        match direction {
            IdleDirection::Any => self.peer_sent_data || self.i_sent_data,
            IdleDirection::Inbound => self.peer_sent_data,
            IdleDirection::Outbound => self.i_sent_data,
        }
    }

    /// Start a new sampling window.
    pub fn begin_window(&mut self) {
        self.peer_sent_data = false;
        self.i_sent_data = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(dpd_secs: Option<u64>, idle_secs: Option<u64>) -> RemoteConfig {
        RemoteConfig {
            dpd: dpd_secs.map(|s| DpdPolicy {
                interval: Duration::from_secs(s),
                ..DpdPolicy::default()
            }),
            idle: idle_secs.map(|s| IdlePolicy {
                timeout: Duration::from_secs(s),
                direction: IdleDirection::Any,
            }),
            ..RemoteConfig::default()
        }
    }

    #[test]
    fn sample_period_uses_smaller_of_both() {
        let m = TrafficMonitor::from_remote(&remote(Some(600), Some(1200))).unwrap();
        assert_eq!(m.sample_period(), Duration::from_secs(30));
        let m = TrafficMonitor::from_remote(&remote(Some(1200), Some(600))).unwrap();
        assert_eq!(m.sample_period(), Duration::from_secs(30));
    }

    #[test]
    fn sample_period_with_one_side() {
        let m = TrafficMonitor::from_remote(&remote(None, Some(400))).unwrap();
        assert_eq!(m.sample_period(), Duration::from_secs(20));
        let m = TrafficMonitor::from_remote(&remote(Some(100), None)).unwrap();
        assert_eq!(m.sample_period(), Duration::from_secs(5));
    }

    #[test]
    fn sample_period_floors_at_one_second() {
        let m = TrafficMonitor::from_remote(&remote(Some(5), None)).unwrap();
        assert_eq!(m.sample_period(), Duration::from_secs(1));
    }

    #[test]
    fn no_monitor_without_policy() {
        assert!(TrafficMonitor::from_remote(&RemoteConfig::bare()).is_none());
    }

    #[test]
    fn inbound_detect_probes_only_without_peer_data() {
        let mut m = TrafficMonitor::from_remote(&remote(Some(30), None)).unwrap();
        m.begin_window();
        assert!(m.should_probe(), "quiet peer should be probed");
        m.observe_inbound(100);
        assert!(!m.should_probe(), "peer data suppresses the probe");
        // Next window, counter unchanged: quiet again.
        m.begin_window();
        m.observe_inbound(100);
        assert!(m.should_probe());
    }

    #[test]
    fn blackhole_detect_needs_outbound_without_inbound() {
        let mut m = TrafficMonitor::from_remote(&RemoteConfig {
            dpd: Some(DpdPolicy {
                algorithm: DpdAlgorithm::BlackholeDetect,
                ..DpdPolicy::default()
            }),
            ..RemoteConfig::default()
        })
        .unwrap();
        m.begin_window();
        assert!(!m.should_probe(), "no outbound traffic, nothing to suspect");
        m.observe_outbound(50);
        assert!(m.should_probe(), "we sent, peer silent: suspect blackhole");
        m.observe_inbound(10);
        assert!(!m.should_probe(), "reply traffic clears the suspicion");
    }

    #[test]
    fn idle_direction_filter() {
        let mut m = TrafficMonitor::from_remote(&RemoteConfig {
            idle: Some(IdlePolicy {
                timeout: Duration::from_secs(600),
                direction: IdleDirection::Inbound,
            }),
            dpd: None,
            ..RemoteConfig::default()
        })
        .unwrap();
        m.begin_window();
        m.observe_outbound(10);
        assert!(!m.idle_refreshed(), "outbound does not refresh inbound-only idle");
        m.observe_inbound(10);
        assert!(m.idle_refreshed());
    }
}
