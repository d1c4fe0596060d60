//! Session registry: the process-wide map from endpoint observations
//! to logical sessions, and the owner of every negotiation handle.
//!
//! All mutation happens on the event-loop thread. Iteration that may
//! unlink entries always walks a snapshot of keys, never a live
//! iterator.

use std::time::Instant;

use tracing::{debug, warn};

use crate::arena::Arena;
use crate::error::{EngineError, EngineResult};
use crate::monitor::TrafficMonitor;
use crate::phase1::Phase1;
use crate::phase2::{Phase2, Phase2Kind, SaEncapMode};
use crate::session::{
    EndpointPair, Phase1Key, Phase2Key, Session, SessionKey, SessionProfile,
};

/// Outcome of unlinking a handle.
pub struct Unlinked<T> {
    pub handle: T,
    /// Set when the owning session's active counts both reached zero;
    /// the caller must cancel session timers and then remove it.
    pub session_emptied: Option<SessionKey>,
}

/// Outcome of rebinding a dying Phase 1's children.
pub struct Rebound {
    pub survivor: Option<Phase1Key>,
    pub moved: usize,
}

pub struct SessionRegistry {
    sessions: Arena<Session>,
    phase1s: Arena<Phase1>,
    phase2s: Arena<Phase2>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: Arena::new(),
            phase1s: Arena::new(),
            phase2s: Arena::new(),
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn session(&self, key: SessionKey) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn session_mut(&mut self, key: SessionKey) -> Option<&mut Session> {
        self.sessions.get_mut(key)
    }

    pub fn phase1(&self, key: Phase1Key) -> Option<&Phase1> {
        self.phase1s.get(key)
    }

    pub fn phase1_mut(&mut self, key: Phase1Key) -> Option<&mut Phase1> {
        self.phase1s.get_mut(key)
    }

    pub fn phase2(&self, key: Phase2Key) -> Option<&Phase2> {
        self.phase2s.get(key)
    }

    pub fn phase2_mut(&mut self, key: Phase2Key) -> Option<&mut Phase2> {
        self.phase2s.get_mut(key)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_keys(&self) -> Vec<SessionKey> {
        self.sessions.keys()
    }

    // ─── Matching (§ session identity) ───────────────────────────────

    /// Specificity rank of `session` for the observed pair, smaller is
    /// better: 0 exact, 1 default-port, 2 floated default port (only
    /// against sessions that already floated), 3 wildcard.
    fn match_rank(input: &EndpointPair, session: &Session) -> Option<u8> {
        if session.endpoints == *input {
            return Some(0);
        }
        if input.remote_on_default_port() {
            if session.endpoints == input.with_remote_port(ironike_proto::constants::ISAKMP_PORT) {
                return Some(1);
            }
            if session.ports_floated
                && session.endpoints
                    == input.with_remote_port(ironike_proto::constants::ISAKMP_NATT_PORT)
            {
                return Some(2);
            }
        }
        if session.endpoints.wildcard() == input.wildcard() {
            return Some(3);
        }
        None
    }

    /// Map an endpoint observation to a session. An exact match wins
    /// immediately; otherwise the whole registry is scanned and the
    /// most specific match wins, with the best wildcard match only
    /// used when nothing better was found.
    pub fn resolve(&self, input: &EndpointPair) -> Option<SessionKey> {
        let mut best: Option<(u8, SessionKey)> = None;
        for (key, session) in self.sessions.iter() {
            match Self::match_rank(input, session) {
                Some(0) => return Some(key),
                Some(rank) => {
                    if best.map_or(true, |(b, _)| rank < b) {
                        best = Some((rank, key));
                    }
                }
                None => {}
            }
        }
        best.map(|(_, key)| key)
    }

    /// Resolve, creating a session keyed by the exact input addresses
    /// if nothing matches. Returns the key and whether it was created.
    pub fn resolve_or_create(&mut self, input: &EndpointPair, now: Instant) -> (SessionKey, bool) {
        if let Some(key) = self.resolve(input) {
            return (key, false);
        }
        let key = self.sessions.insert(Session::new(*input, now));
        debug!(session = %key.tag(), endpoints = %input, "session created");
        (key, true)
    }

    // ─── Linking ─────────────────────────────────────────────────────

    /// Insert a Phase 1 into its session. `started_locally` marks a
    /// negotiation the local side (or an external controller) began.
    pub fn link_phase1(&mut self, skey: SessionKey, phase1: Phase1, started_locally: bool) -> Phase1Key {
        let remote_cfg = phase1.remote.clone();
        let key = self.phase1s.insert(phase1);
        let session = self.sessions.get_mut(skey).expect("linking into live session");

        if session.established && !session.phase1s.is_empty() {
            if let Some(p1) = self.phase1s.get_mut(key) {
                p1.is_rekey = true;
            }
        }
        session.phase1s.push(key);
        session.active_phase1 += 1;
        session.total_phase1 += 1;

        if started_locally {
            session.is_client = true;
        }
        if session.monitor.is_none() {
            session.monitor = TrafficMonitor::from_remote(&remote_cfg);
        }
        key
    }

    /// Insert a Phase 2 into its session, classifying the session's
    /// vendor profile the first time the traffic mode determines it.
    pub fn link_phase2(&mut self, skey: SessionKey, phase2: Phase2) -> Phase2Key {
        let kind = phase2.kind;
        let encap = phase2.encap;
        let l2tp = phase2.l2tp;
        let btmm = phase2.remote.btmm;
        let key = self.phase2s.insert(phase2);
        let session = self.sessions.get_mut(skey).expect("linking into live session");

        session.phase2s.push(key);
        session.active_phase2 += 1;
        session.total_phase2 += 1;

        if kind == Phase2Kind::QuickMode {
            if btmm {
                session.classify(SessionProfile::Btmm);
            } else if encap == SaEncapMode::Transport && l2tp {
                session.classify(SessionProfile::L2tpIpsec);
            } else if encap == SaEncapMode::Tunnel {
                session.classify(SessionProfile::CiscoIpsec);
            }
        }
        key
    }

    // ─── ph1 ↔ ph2 binding ───────────────────────────────────────────

    /// Bind a Phase 2 to a Phase 1 of the same session. A cross-session
    /// bind is rejected and logged, never silently accepted.
    pub fn bind_phase2(&mut self, p2key: Phase2Key, p1key: Phase1Key) -> EngineResult<()> {
        let p1_session = match self.phase1s.get(p1key) {
            Some(p1) => p1.session,
            None => return Err(EngineError::NoHandle(0)),
        };
        let (p2_session, old_bind) = match self.phase2s.get(p2key) {
            Some(p2) => (p2.session, p2.ph1bind),
            None => return Err(EngineError::NoHandle(0)),
        };
        if p1_session != p2_session {
            warn!(
                phase2 = %p2key.tag(),
                phase1 = %p1key.tag(),
                "cross-session phase1 bind rejected"
            );
            return Err(EngineError::CrossSessionBind);
        }
        if let Some(old) = old_bind {
            if let Some(old_p1) = self.phase1s.get_mut(old) {
                old_p1.bound_phase2.retain(|k| *k != p2key);
            }
        }
        if let Some(p2) = self.phase2s.get_mut(p2key) {
            p2.ph1bind = Some(p1key);
        }
        if let Some(p1) = self.phase1s.get_mut(p1key) {
            p1.bound_phase2.push(p2key);
        }
        Ok(())
    }

    pub fn unbind_phase2(&mut self, p2key: Phase2Key) {
        let old = match self.phase2s.get_mut(p2key) {
            Some(p2) => p2.ph1bind.take(),
            None => None,
        };
        if let Some(p1key) = old {
            if let Some(p1) = self.phase1s.get_mut(p1key) {
                p1.bound_phase2.retain(|k| *k != p2key);
            }
        }
    }

    /// The established-lookup winner: first non-dying established
    /// Phase 1 of the session.
    pub fn established_phase1(&self, skey: SessionKey) -> Option<Phase1Key> {
        let session = self.sessions.get(skey)?;
        session
            .phase1s
            .iter()
            .copied()
            .find(|k| {
                self.phase1s
                    .get(*k)
                    .map(|p| !p.is_dying && p.is_established())
                    .unwrap_or(false)
            })
    }

    /// The most mature surviving Phase 1 (highest state ordinal among
    /// non-dying, non-expired handles). Ties go to whichever is found
    /// first; picking by farthest remaining lifetime was never
    /// implemented upstream and is deliberately not invented here.
    pub fn best_surviving_phase1(
        &self,
        skey: SessionKey,
        excluding: Option<Phase1Key>,
    ) -> Option<Phase1Key> {
        let session = self.sessions.get(skey)?;
        let mut best: Option<(u8, Phase1Key)> = None;
        for key in &session.phase1s {
            if Some(*key) == excluding {
                continue;
            }
            let p1 = match self.phase1s.get(*key) {
                Some(p) => p,
                None => continue,
            };
            if p1.is_dying || !p1.state.is_active() {
                continue;
            }
            let ordinal = p1.state.ordinal();
            if best.map_or(true, |(b, _)| ordinal > b) {
                best = Some((ordinal, *key));
            }
        }
        best.map(|(_, key)| key)
    }

    /// Move every Phase 2 bound to `old` onto `target`, or unbind them
    /// all when no target is given.
    pub fn move_children(&mut self, old: Phase1Key, target: Option<Phase1Key>) -> usize {
        let children = match self.phase1s.get_mut(old) {
            Some(p1) => std::mem::take(&mut p1.bound_phase2),
            None => return 0,
        };
        let moved = children.len();
        for child in children {
            if let Some(p2) = self.phase2s.get_mut(child) {
                p2.ph1bind = target;
            }
            if let Some(t) = target {
                if let Some(p1) = self.phase1s.get_mut(t) {
                    p1.bound_phase2.push(child);
                }
            }
        }
        moved
    }

    /// Rebind the children of a Phase 1 that is going away to the best
    /// surviving sibling, or unbind them for lazy rebinding later.
    pub fn rebind_children(&mut self, old: Phase1Key) -> Rebound {
        let skey = match self.phase1s.get(old) {
            Some(p1) => p1.session,
            None => {
                return Rebound {
                    survivor: None,
                    moved: 0,
                }
            }
        };
        let survivor = self.best_surviving_phase1(skey, Some(old));
        let moved = self.move_children(old, survivor);
        if moved > 0 {
            debug!(
                old = %old.tag(),
                survivor = ?survivor.map(|s| s.tag()),
                moved,
                "phase2 children rebound"
            );
        }
        Rebound { survivor, moved }
    }

    // ─── Unlinking ───────────────────────────────────────────────────

    /// Remove a Phase 1 from its session, rebinding any children
    /// first. Counters are decremented exactly once per unlink.
    pub fn unlink_phase1(&mut self, key: Phase1Key) -> Option<Unlinked<Phase1>> {
        if self.phase1s.get(key).is_some() {
            self.rebind_children(key);
        }
        let phase1 = self.phase1s.remove(key)?;
        let skey = phase1.session;
        let mut emptied = None;
        if let Some(session) = self.sessions.get_mut(skey) {
            session.phase1s.retain(|k| *k != key);
            session.active_phase1 -= 1;
            if session.is_empty() {
                emptied = Some(skey);
            }
        }
        Some(Unlinked {
            handle: phase1,
            session_emptied: emptied,
        })
    }

    /// Remove a Phase 2 from its session.
    pub fn unlink_phase2(&mut self, key: Phase2Key) -> Option<Unlinked<Phase2>> {
        self.unbind_phase2(key);
        let phase2 = self.phase2s.remove(key)?;
        let skey = phase2.session;
        let mut emptied = None;
        if let Some(session) = self.sessions.get_mut(skey) {
            session.phase2s.retain(|k| *k != key);
            session.active_phase2 -= 1;
            if session.is_empty() {
                emptied = Some(skey);
            }
        }
        Some(Unlinked {
            handle: phase2,
            session_emptied: emptied,
        })
    }

    /// Drop an emptied session. The caller has already cancelled its
    /// timers.
    pub fn remove_session(&mut self, key: SessionKey) -> Option<Session> {
        self.sessions.remove(key)
    }

    /// Borrow a Phase 2 mutably together with its bound Phase 1, for a
    /// Quick Mode step that needs the Phase 1 context read-only.
    pub fn quick_step_parts(&mut self, p2key: Phase2Key) -> Option<(&mut Phase2, &Phase1)> {
        let p1key = self.phase2s.get(p2key)?.ph1bind?;
        let p1 = self.phase1s.get(p1key)?;
        let p2 = self.phase2s.get_mut(p2key)?;
        Some((p2, p1))
    }

    // ─── Lookup by wire identity ─────────────────────────────────────

    /// Find the Phase 1 a handshake message belongs to by cookie pair.
    pub fn find_phase1_by_cookies(
        &self,
        initiator_cookie: &[u8; 8],
        responder_cookie: &[u8; 8],
    ) -> Option<Phase1Key> {
        self.phase1s
            .iter()
            .find(|(_, p1)| {
                p1.initiator_cookie == *initiator_cookie
                    && (p1.responder_cookie == *responder_cookie
                        || *responder_cookie == [0u8; 8]
                        || p1.responder_cookie == [0u8; 8])
            })
            .map(|(key, _)| key)
    }

    /// Find a session's Phase 2 by Quick Mode message id.
    pub fn find_phase2_by_msgid(&self, skey: SessionKey, msgid: u32) -> Option<Phase2Key> {
        let session = self.sessions.get(skey)?;
        session
            .phase2s
            .iter()
            .copied()
            .find(|k| self.phase2s.get(*k).map(|p| p.msgid == msgid).unwrap_or(false))
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase1::{Phase1State, Role};
    use ironike_proto::policy::RemoteConfig;
    use ironike_proto::select_backend;
    use std::sync::Arc;

    fn pair(l: &str, r: &str) -> EndpointPair {
        EndpointPair::new(l.parse().unwrap(), r.parse().unwrap())
    }

    fn make_phase1(skey: SessionKey, role: Role) -> Phase1 {
        let crypto = select_backend();
        let remote = Arc::new(RemoteConfig::default());
        let now = Instant::now();
        match role {
            Role::Initiator => Phase1::new_initiator(skey, remote, crypto.as_ref(), now),
            Role::Responder => Phase1::new_responder(
                skey,
                remote,
                [9u8; 8],
                ironike_proto::policy::ExchangeMode::Main,
                crypto.as_ref(),
                now,
            ),
        }
    }

    fn make_phase2(skey: SessionKey) -> Phase2 {
        Phase2::new_initiator(
            skey,
            1,
            0x100,
            vec![],
            SaEncapMode::Tunnel,
            false,
            Arc::new(RemoteConfig::default()),
            Instant::now(),
        )
    }

    #[test]
    fn specificity_ordering_holds_regardless_of_insert_order() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        // The wildcard-matching session goes in first, so iteration
        // order would favor it if ranks were ignored.
        let wild = registry
            .sessions
            .insert(Session::new(pair("10.0.0.1:4500", "10.0.0.2:1701"), now));
        let exact = registry
            .sessions
            .insert(Session::new(pair("10.0.0.1:500", "10.0.0.2:500"), now));

        assert_eq!(
            registry.resolve(&pair("10.0.0.1:500", "10.0.0.2:500")),
            Some(exact)
        );
        // Default-port rank also beats wildcard.
        assert_eq!(
            registry.resolve(&pair("10.0.0.1:500", "10.0.0.2:4500")),
            Some(exact)
        );
        // A different local address matches neither.
        assert_eq!(registry.resolve(&pair("10.0.0.9:500", "10.0.0.2:500")), None);
        let _ = wild;
    }

    #[test]
    fn resolution_is_deterministic() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        let input = pair("10.0.0.1:500", "10.0.0.2:500");
        let (key, _) = registry.resolve_or_create(&input, now);
        for _ in 0..5 {
            assert_eq!(registry.resolve(&input), Some(key));
        }
    }

    #[test]
    fn default_port_match_after_observed_port_change() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        let original = pair("10.0.0.1:500", "10.0.0.2:500");
        let (key, _) = registry.resolve_or_create(&original, now);

        // Peer now observed on the NAT-T port: remote forced back to
        // 500 still resolves the same session.
        let floated_remote = pair("10.0.0.1:500", "10.0.0.2:4500");
        assert_eq!(registry.resolve(&floated_remote), Some(key));

        // A non-default remote port only matches through the wildcard.
        let odd = pair("10.0.0.1:500", "10.0.0.2:9999");
        assert_eq!(registry.resolve(&odd), Some(key));
    }

    #[test]
    fn floated_candidate_only_matches_floated_sessions() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        let (key, _) = registry.resolve_or_create(&pair("10.0.0.1:4500", "10.0.0.2:4500"), now);

        // Observation from port 500: the floated-default-port candidate
        // only applies once the session has actually floated; before
        // that only the wildcard rank reaches it.
        let input = pair("10.0.0.1:4500", "10.0.0.2:500");
        let session = registry.session(key).unwrap();
        assert_eq!(SessionRegistry::match_rank(&input, session), Some(3));

        registry.session_mut(key).unwrap().ports_floated = true;
        let session = registry.session(key).unwrap();
        assert_eq!(SessionRegistry::match_rank(&input, session), Some(2));
        assert_eq!(registry.resolve(&input), Some(key));
    }

    #[test]
    fn lifecycle_counts_govern_reachability() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        let input = pair("10.0.0.1:500", "10.0.0.2:500");
        let (skey, _) = registry.resolve_or_create(&input, now);

        let p1 = make_phase1(skey, Role::Initiator);
        let p1key = registry.link_phase1(skey, p1, true);
        let p2 = make_phase2(skey);
        let p2key = registry.link_phase2(skey, p2);

        let session = registry.session(skey).unwrap();
        assert_eq!(session.active_phase1, 1);
        assert_eq!(session.active_phase2, 1);
        assert!(session.is_client);

        let out = registry.unlink_phase1(p1key).unwrap();
        assert!(out.session_emptied.is_none());
        let out = registry.unlink_phase2(p2key).unwrap();
        assert_eq!(out.session_emptied, Some(skey));
        registry.remove_session(skey);
        assert_eq!(registry.resolve(&input), None);
    }

    #[test]
    fn rebind_moves_all_children_to_survivor() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        let (skey, _) = registry.resolve_or_create(&pair("10.0.0.1:500", "10.0.0.2:500"), now);

        let mut old = make_phase1(skey, Role::Initiator);
        old.state = Phase1State::Established;
        let old_key = registry.link_phase1(skey, old, true);

        let mut newer = make_phase1(skey, Role::Initiator);
        newer.state = Phase1State::Msg3Sent;
        let newer_key = registry.link_phase1(skey, newer, true);

        let children: Vec<_> = (0..3)
            .map(|_| {
                let p2 = make_phase2(skey);
                let p2key = registry.link_phase2(skey, p2);
                registry.bind_phase2(p2key, old_key).unwrap();
                p2key
            })
            .collect();

        registry.unlink_phase1(old_key).unwrap();
        for child in &children {
            assert_eq!(registry.phase2(*child).unwrap().ph1bind, Some(newer_key));
        }
        assert_eq!(
            registry.phase1(newer_key).unwrap().bound_phase2.len(),
            children.len()
        );
    }

    #[test]
    fn rebind_unbinds_when_no_survivor() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        let (skey, _) = registry.resolve_or_create(&pair("10.0.0.1:500", "10.0.0.2:500"), now);
        let p1 = make_phase1(skey, Role::Initiator);
        let p1key = registry.link_phase1(skey, p1, true);
        let p2 = make_phase2(skey);
        let p2key = registry.link_phase2(skey, p2);
        registry.bind_phase2(p2key, p1key).unwrap();

        registry.unlink_phase1(p1key).unwrap();
        assert_eq!(registry.phase2(p2key).unwrap().ph1bind, None);
    }

    #[test]
    fn most_mature_survivor_first_found_on_tie() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        let (skey, _) = registry.resolve_or_create(&pair("10.0.0.1:500", "10.0.0.2:500"), now);

        let mut a = make_phase1(skey, Role::Initiator);
        a.state = Phase1State::Established;
        let a_key = registry.link_phase1(skey, a, true);

        let mut b = make_phase1(skey, Role::Initiator);
        b.state = Phase1State::Established;
        let _b_key = registry.link_phase1(skey, b, true);

        // Equal ordinals: the first linked wins; no lifetime comparator.
        assert_eq!(registry.best_surviving_phase1(skey, None), Some(a_key));

        // A dying candidate is skipped.
        registry.phase1_mut(a_key).unwrap().is_dying = true;
        assert_eq!(registry.best_surviving_phase1(skey, None), Some(_b_key));
    }

    #[test]
    fn cross_session_bind_rejected() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        let (s1, _) = registry.resolve_or_create(&pair("10.0.0.1:500", "10.0.0.2:500"), now);
        let (s2, _) = registry.resolve_or_create(&pair("10.0.0.1:500", "10.0.0.3:500"), now);

        let p1 = make_phase1(s1, Role::Initiator);
        let p1key = registry.link_phase1(s1, p1, true);
        let p2 = make_phase2(s2);
        let p2key = registry.link_phase2(s2, p2);

        let err = registry.bind_phase2(p2key, p1key).unwrap_err();
        assert!(matches!(err, EngineError::CrossSessionBind));
        assert_eq!(registry.phase2(p2key).unwrap().ph1bind, None);
    }

    #[test]
    fn rekey_marked_when_session_established() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        let (skey, _) = registry.resolve_or_create(&pair("10.0.0.1:500", "10.0.0.2:500"), now);
        let first = make_phase1(skey, Role::Initiator);
        let first_key = registry.link_phase1(skey, first, true);
        assert!(!registry.phase1(first_key).unwrap().is_rekey);

        registry.session_mut(skey).unwrap().established = true;
        let second = make_phase1(skey, Role::Initiator);
        let second_key = registry.link_phase1(skey, second, true);
        assert!(registry.phase1(second_key).unwrap().is_rekey);
    }

    #[test]
    fn profile_classification_from_phase2() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        let (skey, _) = registry.resolve_or_create(&pair("10.0.0.1:500", "10.0.0.2:500"), now);

        let mut l2tp = make_phase2(skey);
        l2tp.encap = SaEncapMode::Transport;
        l2tp.l2tp = true;
        registry.link_phase2(skey, l2tp);
        assert_eq!(
            registry.session(skey).unwrap().profile,
            SessionProfile::L2tpIpsec
        );

        // A later tunnel-mode phase2 upgrades to Cisco; nothing
        // overwrites Cisco afterwards.
        let tunnel = make_phase2(skey);
        registry.link_phase2(skey, tunnel);
        assert_eq!(
            registry.session(skey).unwrap().profile,
            SessionProfile::CiscoIpsec
        );
    }

    #[test]
    fn cookie_lookup() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        let (skey, _) = registry.resolve_or_create(&pair("10.0.0.1:500", "10.0.0.2:500"), now);
        let p1 = make_phase1(skey, Role::Initiator);
        let icookie = p1.initiator_cookie;
        let p1key = registry.link_phase1(skey, p1, true);

        assert_eq!(
            registry.find_phase1_by_cookies(&icookie, &[0u8; 8]),
            Some(p1key)
        );
        assert_eq!(registry.find_phase1_by_cookies(&[0xffu8; 8], &[0u8; 8]), None);
    }
}
