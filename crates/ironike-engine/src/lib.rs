//! ironike keying engine
//!
//! The IKEv1 session and negotiation core: one logical session per
//! `(local, remote)` endpoint pair, Phase 1 (ISAKMP SA) and Phase 2
//! (IPsec SA) state machines under it, and the retry/rekey/liveness
//! policy that keeps the pair of databases — ours and the kernel's —
//! converged with the peer.
//!
//! # Architecture
//!
//! ```text
//!   UDP socket ──┐                       ┌── PF_KEY gateway (async)
//!   control TCP ─┼──> single-threaded ───┼── control notifications
//!   timer queue ─┘     Engine            └── event sink
//!                        │
//!                 SessionRegistry
//!                 (sessions ⇒ phase1s ⇒ phase2s, generational keys)
//! ```
//!
//! Everything runs on one cooperative thread: the daemon polls I/O and
//! the scheduler, and each message, timer, or kernel reply is handled
//! to completion before the next. Timers and cross-object references
//! hold generational arena keys, never pointers, so a late-firing
//! timer cannot touch a recycled object.

pub mod arena;
pub mod config;
pub mod control;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod events;
pub mod monitor;
pub mod pfkey;
pub mod phase1;
pub mod phase2;
pub mod registry;
pub mod sched;
pub mod session;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};

#[cfg(test)]
mod tests {
    use crate::config::{EngineConfig, PeerPolicy};
    use crate::control::{ControlNotify, FailureCode};
    use crate::engine::Engine;
    use crate::events::{EventSink, IkeEvent};
    use crate::pfkey::LoopbackGateway;
    use crate::phase1::Role;
    use crate::session::TerminationReason;

    use ironike_proto::constants::ISAKMP_NATT_PORT;
    use ironike_proto::message::Payload;
    use ironike_proto::policy::{DpdPolicy, IdleDirection, IdlePolicy, RemoteConfig};
    use ironike_proto::{select_backend, NotifyType};

    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    const A_ADDR: &str = "10.0.0.1:500";
    const B_ADDR: &str = "10.0.0.2:500";

    /// Sink that records everything for assertions.
    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<IkeEvent>>>);

    impl EventSink for RecordingSink {
        fn notify(&mut self, event: &IkeEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn shared_remote_config() -> RemoteConfig {
        RemoteConfig {
            psk: b"test-psk".to_vec(),
            retry_limit: 2,
            retry_interval: Duration::from_secs(5),
            dpd: None,
            idle: None,
            ..RemoteConfig::default()
        }
    }

    fn make_engine(
        listen: &str,
        peer: &str,
        remote: RemoteConfig,
    ) -> (Engine, Arc<Mutex<Vec<IkeEvent>>>) {
        let sink = RecordingSink::default();
        let events = Arc::clone(&sink.0);
        let cfg = EngineConfig {
            listen: listen.parse().unwrap(),
            peers: vec![PeerPolicy {
                remote: peer.parse().unwrap(),
                config: Arc::new(remote),
            }],
            ..EngineConfig::default()
        };
        let engine = Engine::new(
            cfg,
            select_backend(),
            Box::new(LoopbackGateway::new()),
            Box::new(sink),
        );
        (engine, events)
    }

    fn engine_pair(remote: RemoteConfig) -> (Engine, Engine, Arc<Mutex<Vec<IkeEvent>>>) {
        let (a, a_events) = make_engine(A_ADDR, B_ADDR, remote.clone());
        let (b, _) = make_engine(B_ADDR, A_ADDR, remote);
        (a, b, a_events)
    }

    /// Shuttle datagrams between two engines until both go quiet. With
    /// `nat`, traffic from B reaches A as if floated to the NAT-T port.
    fn pump(a: &mut Engine, b: &mut Engine, nat: bool, now: Instant) {
        for _ in 0..64 {
            a.tick(now);
            b.tick(now);
            let a_out = a.drain_outbox();
            let b_out = b.drain_outbox();
            if a_out.is_empty() && b_out.is_empty() {
                return;
            }
            for (_, msg) in a_out {
                b.handle_message(b.local_addr(), a.local_addr(), msg, now);
            }
            for (_, msg) in b_out {
                let mut from: SocketAddr = b.local_addr();
                if nat {
                    from.set_port(ISAKMP_NATT_PORT);
                }
                a.handle_message(a.local_addr(), from, msg, now);
            }
        }
        panic!("engines did not converge");
    }

    fn only_session(engine: &Engine) -> crate::session::SessionKey {
        let keys = engine.registry.session_keys();
        assert_eq!(keys.len(), 1, "expected exactly one session");
        keys[0]
    }

    // ─── Scenario: establishment and quick mode ──────────────────────

    #[test]
    fn full_establishment_and_quick_mode() {
        let now = Instant::now();
        let (mut a, mut b, a_events) = engine_pair(shared_remote_config());

        a.initiate(B_ADDR.parse().unwrap(), now).unwrap();
        pump(&mut a, &mut b, false, now);

        let a_session = only_session(&a);
        let b_session = only_session(&b);
        assert!(a.registry.session(a_session).unwrap().established);
        assert!(b.registry.session(b_session).unwrap().established);
        assert!(a.registry.session(a_session).unwrap().is_client);
        assert!(!b.registry.session(b_session).unwrap().is_client);

        a.start_phase2(B_ADDR.parse().unwrap(), 7, now).unwrap();
        pump(&mut a, &mut b, false, now);

        let established_p2 = |e: &Engine, skey| {
            e.registry
                .session(skey)
                .unwrap()
                .phase2s
                .iter()
                .filter(|k| e.registry.phase2(**k).unwrap().is_established())
                .count()
        };
        assert_eq!(established_p2(&a, a_session), 1);
        assert_eq!(established_p2(&b, b_session), 1);

        let events = a_events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            IkeEvent::PhaseSuccess {
                kind: crate::events::PhaseKind::Phase2,
                ..
            }
        )));
    }

    // ─── Scenario: session reuse across NAT float ────────────────────

    #[test]
    fn session_reused_across_nat_float() {
        let now = Instant::now();
        let (mut a, mut b, _) = engine_pair(shared_remote_config());

        // Every reply from B reaches A as if a NAT floated it to 4500.
        a.initiate(B_ADDR.parse().unwrap(), now).unwrap();
        pump(&mut a, &mut b, true, now);

        let a_session = only_session(&a);
        {
            let session = a.registry.session(a_session).unwrap();
            assert!(session.established);
            assert!(session.ports_floated);
            assert_eq!(session.endpoints.remote.port(), ISAKMP_NATT_PORT);
        }

        // A Quick Mode started by the peer, observed on the floated
        // port, resolves to the same session.
        b.start_phase2(A_ADDR.parse().unwrap(), 3, now).unwrap();
        pump(&mut a, &mut b, true, now);

        assert_eq!(a.registry.session_keys().len(), 1, "no duplicate session");
        let session = a.registry.session(a_session).unwrap();
        assert_eq!(session.active_phase2, 1);
        let p2 = session.phase2s[0];
        assert!(a.registry.phase2(p2).unwrap().is_established());
    }

    // ─── Scenario: client rekey supersede ────────────────────────────

    #[test]
    fn client_rekey_marks_old_phase1_dying_and_rebinds() {
        let now = Instant::now();
        let (mut a, mut b, _) = engine_pair(shared_remote_config());

        let old_key = a.initiate(B_ADDR.parse().unwrap(), now).unwrap();
        pump(&mut a, &mut b, false, now);
        a.start_phase2(B_ADDR.parse().unwrap(), 7, now).unwrap();
        pump(&mut a, &mut b, false, now);

        let a_session = only_session(&a);
        let p2 = a.registry.session(a_session).unwrap().phase2s[0];
        assert_eq!(a.registry.phase2(p2).unwrap().ph1bind, Some(old_key));

        // Client-initiated rekey.
        let new_key = a.initiate(B_ADDR.parse().unwrap(), now).unwrap();
        assert!(a.registry.phase1(new_key).unwrap().is_rekey);
        pump(&mut a, &mut b, false, now);

        let old = a.registry.phase1(old_key).unwrap();
        assert!(old.is_dying, "superseded handle must be dying");
        assert!(old.teardown_timer.is_some(), "deferred delete armed");
        assert!(a.registry.phase1(new_key).unwrap().is_established());
        assert!(!a.registry.phase1(new_key).unwrap().is_dying);

        // The Phase 2 survived the rekey on the new Phase 1.
        assert_eq!(a.registry.phase2(p2).unwrap().ph1bind, Some(new_key));
    }

    // ─── Scenario: responder defers supersede ────────────────────────

    #[test]
    fn responder_establishment_defers_to_peer_delete() {
        let now = Instant::now();
        let (mut a, mut b, _) = engine_pair(shared_remote_config());

        let a_initiator = a.initiate(B_ADDR.parse().unwrap(), now).unwrap();
        pump(&mut a, &mut b, false, now);
        assert!(a.registry.phase1(a_initiator).unwrap().is_established());

        // The peer now negotiates its own Phase 1; on A it establishes
        // as a Responder-side handle.
        b.initiate(A_ADDR.parse().unwrap(), now).unwrap();
        pump(&mut a, &mut b, false, now);

        let a_session = only_session(&a);
        let session = a.registry.session(a_session).unwrap();
        assert!(session.is_client);
        let responders: Vec<_> = session
            .phase1s
            .iter()
            .filter(|k| a.registry.phase1(**k).unwrap().role == Role::Responder)
            .collect();
        assert_eq!(responders.len(), 1);
        assert!(a.registry.phase1(*responders[0]).unwrap().is_established());

        // Policy defers: the initiator-side sibling is NOT torn down.
        let sibling = a.registry.phase1(a_initiator).unwrap();
        assert!(sibling.is_established());
        assert!(!sibling.is_dying, "responder must not self-select a winner");
    }

    // ─── Scenario: DPD exhaustion ────────────────────────────────────

    #[test]
    fn dpd_exhaustion_purges_after_exactly_max_fails_probes() {
        let now = Instant::now();
        let remote = RemoteConfig {
            dpd: Some(DpdPolicy {
                interval: Duration::from_secs(1000),
                retry_timeout: Duration::from_secs(5),
                max_fails: 3,
                ..DpdPolicy::default()
            }),
            ..shared_remote_config()
        };
        let (mut a, mut b, a_events) = engine_pair(remote);

        a.initiate(B_ADDR.parse().unwrap(), now).unwrap();
        pump(&mut a, &mut b, false, now);

        let count_probes = |msgs: &[(SocketAddr, ironike_proto::IsakmpMessage)]| {
            msgs.iter()
                .flat_map(|(_, m)| m.payloads.iter())
                .filter(|p| match p {
                    Payload::Notification(n) => n.notify_type() == Some(NotifyType::RUThere),
                    _ => false,
                })
                .count()
        };

        // First probe on demand; acks never arrive.
        a.handle_control(
            crate::control::ControlCommand::StartDpd {
                remote: B_ADDR.parse().unwrap(),
            },
            now,
        );
        let mut probes = count_probes(&a.drain_outbox());
        assert_eq!(probes, 1);

        // Each unanswered wait window is one failure; the third failure
        // purges instead of probing again.
        for step in 1..=3u64 {
            a.tick(now + Duration::from_secs(6 * step));
            probes += count_probes(&a.drain_outbox());
        }
        assert_eq!(probes, 3, "a fourth probe must never be sent");

        assert_eq!(a.registry.session_keys().len(), 0, "session purged");
        let peer_dead = a.drain_notifications().into_iter().any(|n| {
            matches!(
                n,
                ControlNotify::IkeFailed {
                    code: FailureCode::PeerDead,
                    ..
                }
            )
        });
        assert!(peer_dead, "controller told the peer is dead");
        let events = a_events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            IkeEvent::SessionClosed {
                reason: TerminationReason::PeerDead,
                ..
            }
        )));
    }

    // ─── Scenario: idle teardown ─────────────────────────────────────

    #[test]
    fn idle_timeout_tears_session_down() {
        let now = Instant::now();
        let remote = RemoteConfig {
            idle: Some(IdlePolicy {
                timeout: Duration::from_secs(600),
                direction: IdleDirection::Any,
            }),
            ..shared_remote_config()
        };
        let (mut a, mut b, a_events) = engine_pair(remote);

        a.initiate(B_ADDR.parse().unwrap(), now).unwrap();
        pump(&mut a, &mut b, false, now);
        assert_eq!(a.registry.session_keys().len(), 1);

        // No traffic ever observed; the idle timer fires.
        a.tick(now + Duration::from_secs(601));

        assert_eq!(a.registry.session_keys().len(), 0);
        let idle_failed = a.drain_notifications().into_iter().any(|n| {
            matches!(
                n,
                ControlNotify::IkeFailed {
                    code: FailureCode::IdleTimeout,
                    ..
                }
            )
        });
        assert!(idle_failed);
        let events = a_events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            IkeEvent::SessionClosed {
                reason: TerminationReason::IdleTimeout,
                ..
            }
        )));
        // Every timer the session owned was cancelled with it.
        assert_eq!(a.next_deadline(), None);
    }

    // ─── Supersede idempotence ───────────────────────────────────────

    #[test]
    fn marking_dying_twice_arms_teardown_once() {
        let now = Instant::now();
        let (mut a, mut b, _) = engine_pair(shared_remote_config());
        let key = a.initiate(B_ADDR.parse().unwrap(), now).unwrap();
        pump(&mut a, &mut b, false, now);

        a.mark_phase1_dying(key, None, now);
        let first_token = a.registry.phase1(key).unwrap().teardown_timer;
        assert!(first_token.is_some());

        a.mark_phase1_dying(key, None, now);
        let second_token = a.registry.phase1(key).unwrap().teardown_timer;
        assert_eq!(first_token, second_token, "teardown armed exactly once");
    }

    // ─── Retransmission budget ───────────────────────────────────────

    #[test]
    fn retransmit_budget_exhaustion_fails_phase1() {
        let now = Instant::now();
        let (mut a, _b, a_events) = engine_pair(shared_remote_config());

        // Peer never answers.
        a.initiate(B_ADDR.parse().unwrap(), now).unwrap();
        let initial = a.drain_outbox();
        assert_eq!(initial.len(), 1);

        let mut resends = 0;
        for step in 1..=3u64 {
            a.tick(now + Duration::from_secs(6 * step));
            resends += a.drain_outbox().len();
        }
        // retry_limit is 2: two retransmissions, then failure.
        assert_eq!(resends, 2);
        assert_eq!(a.registry.session_keys().len(), 0);

        let timed_out = a.drain_notifications().into_iter().any(|n| {
            matches!(
                n,
                ControlNotify::IkeFailed {
                    code: FailureCode::NegotiationTimeout,
                    ..
                }
            )
        });
        assert!(timed_out);
        let events = a_events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            IkeEvent::PhaseFail {
                kind: crate::events::PhaseKind::Phase1,
                ..
            }
        )));
    }

    // ─── Peer-initiated delete completes deferred supersede ──────────

    #[test]
    fn peer_delete_expires_phase1() {
        let now = Instant::now();
        let (mut a, mut b, _) = engine_pair(shared_remote_config());
        let a_key = a.initiate(B_ADDR.parse().unwrap(), now).unwrap();
        pump(&mut a, &mut b, false, now);
        assert!(a.registry.phase1(a_key).unwrap().is_established());

        // B tears its session down; its delete notification reaches A.
        let b_session = only_session(&b);
        b.cleanup_session(b_session, TerminationReason::UserRequested, now);
        pump(&mut a, &mut b, false, now);

        assert!(a.registry.phase1(a_key).is_none(), "peer delete expired the handle");
        assert_eq!(a.registry.session_keys().len(), 0);
    }

    // ─── Control surface ─────────────────────────────────────────────

    #[test]
    fn status_snapshot_reports_sessions() {
        let now = Instant::now();
        let (mut a, mut b, _) = engine_pair(shared_remote_config());
        a.initiate(B_ADDR.parse().unwrap(), now).unwrap();
        pump(&mut a, &mut b, false, now);

        a.handle_control(crate::control::ControlCommand::Status, now);
        let status = a
            .drain_notifications()
            .into_iter()
            .find_map(|n| match n {
                ControlNotify::Status { sessions } => Some(sessions),
                _ => None,
            })
            .expect("status notification");
        assert_eq!(status.len(), 1);
        assert!(status[0].established);
        assert!(status[0].is_client);
        assert_eq!(status[0].remote, B_ADDR.parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn disconnect_is_reported_as_user_requested() {
        let now = Instant::now();
        let (mut a, mut b, a_events) = engine_pair(shared_remote_config());
        a.initiate(B_ADDR.parse().unwrap(), now).unwrap();
        pump(&mut a, &mut b, false, now);

        a.handle_control(
            crate::control::ControlCommand::Disconnect {
                remote: B_ADDR.parse().unwrap(),
            },
            now,
        );
        assert_eq!(a.registry.session_keys().len(), 0);
        let user_requested = a.drain_notifications().into_iter().any(|n| {
            matches!(
                n,
                ControlNotify::IkeFailed {
                    code: FailureCode::UserRequested,
                    ..
                }
            )
        });
        assert!(user_requested);
        // Idle/DPD reasons and user disconnects stay distinguishable.
        let events = a_events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            IkeEvent::SessionClosed {
                reason: TerminationReason::UserRequested,
                ..
            }
        )));
    }
}
