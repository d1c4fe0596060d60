//! The keying engine: single-threaded coordinator tying the session
//! registry, the scheduler, and the external adapters together.
//!
//! Every entry point takes `now` explicitly and runs to completion;
//! the daemon loop supplies wall-clock time and I/O. Outbound messages
//! and controller notifications are queued and drained by the caller,
//! so no operation here ever blocks.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use ironike_proto::constants::{ExchangeType, ISAKMP_NATT_PORT};
use ironike_proto::message::{DeletePayload, IsakmpHeader, IsakmpMessage, NotifyPayload, Payload};
use ironike_proto::{CryptoBackend, NotifyType, PayloadType};

use crate::config::EngineConfig;
use crate::control::{ControlCommand, ControlNotify, FailureCode, NotifyPhase, SessionStatus};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventSink, IkeEvent, PhaseKind};
use crate::pfkey::{Direction, SadbGateway, SadbReply, SadbRequest};
use crate::phase1::{Phase1, Role};
use crate::phase2::{Ph1Context, Phase2, Phase2Kind, SaEncapMode};
use crate::registry::SessionRegistry;
use crate::sched::Scheduler;
use crate::session::{
    EndpointPair, Phase1Key, Phase2Key, SessionKey, TerminationReason,
};

/// Drain delay before actually deleting a superseded Initiator-side
/// Phase 1.
const SUPERSEDE_DRAIN_INITIATOR: Duration = Duration::from_secs(5);
/// Drain delay for a superseded Responder-side Phase 1.
const SUPERSEDE_DRAIN_RESPONDER: Duration = Duration::from_secs(7);
/// Drain delay for a superseded Responder-side Phase 2.
const SUPERSEDE_DRAIN_PHASE2_RESPONDER: Duration = Duration::from_secs(3);

/// ISAKMP protocol id in delete payloads.
const PROTO_ISAKMP: u8 = 1;
/// ESP protocol id in delete payloads.
const PROTO_ESP: u8 = 3;

/// Deferred work, tagged with arena keys. A fired event whose key no
/// longer resolves is dropped.
#[derive(Debug, Clone, Copy)]
pub enum TimerEvent {
    Phase1Retransmit(Phase1Key),
    Phase1Lifetime(Phase1Key),
    Phase1Teardown(Phase1Key),
    Phase2Retransmit(Phase2Key),
    Phase2Lifetime(Phase2Key),
    Phase2Teardown(Phase2Key),
    DpdWait(Phase1Key),
    TrafficSample(SessionKey),
    IdleTimeout(SessionKey),
}

/// Who an outstanding SADB request belongs to.
enum SadbOwner {
    Phase2Spi(Phase2Key),
    Phase2Install(Phase2Key),
    SessionStats(SessionKey, Direction),
    FireAndForget,
}

pub struct Engine {
    cfg: EngineConfig,
    crypto: Box<dyn CryptoBackend>,
    pub registry: SessionRegistry,
    sched: Scheduler<TimerEvent>,
    gateway: Box<dyn SadbGateway>,
    sink: Box<dyn EventSink>,

    pending_sadb: HashMap<u32, SadbOwner>,
    outbox: Vec<(SocketAddr, IsakmpMessage)>,
    notifications: Vec<ControlNotify>,
    bound_controllers: HashSet<IpAddr>,
    next_msgid: u32,
    local_id: Vec<u8>,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        crypto: Box<dyn CryptoBackend>,
        gateway: Box<dyn SadbGateway>,
        sink: Box<dyn EventSink>,
    ) -> Self {
        let local_id = cfg.listen.to_string().into_bytes();
        Engine {
            cfg,
            crypto,
            registry: SessionRegistry::new(),
            sched: Scheduler::new(),
            gateway,
            sink,
            pending_sadb: HashMap::new(),
            outbox: Vec::new(),
            notifications: Vec::new(),
            bound_controllers: HashSet::new(),
            next_msgid: 1,
            local_id,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.cfg.listen
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.cfg.control
    }

    /// Earliest pending timer deadline, for the poll timeout.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.sched.next_deadline()
    }

    /// Queued outbound datagrams.
    pub fn drain_outbox(&mut self) -> Vec<(SocketAddr, IsakmpMessage)> {
        std::mem::take(&mut self.outbox)
    }

    /// Queued controller notifications.
    pub fn drain_notifications(&mut self) -> Vec<ControlNotify> {
        std::mem::take(&mut self.notifications)
    }

    /// Fire due timers and absorb kernel replies. Called once per loop
    /// turn; each event runs to completion before the next.
    pub fn tick(&mut self, now: Instant) {
        while let Some(event) = self.sched.pop_due(now) {
            self.handle_timer(event, now);
        }
        while let Some(reply) = self.gateway.poll_reply() {
            self.handle_sadb_reply(reply, now);
        }
    }

    fn emit(&mut self, event: IkeEvent) {
        self.sink.notify(&event);
    }

    fn notify(&mut self, notify: ControlNotify) {
        // An empty binding set broadcasts; otherwise only bound peer
        // addresses are reported.
        let remote_ip = match &notify {
            ControlNotify::PhaseStart { remote, .. }
            | ControlNotify::PhaseEstablished { remote, .. }
            | ControlNotify::NeedAuthinfo { remote }
            | ControlNotify::IkeFailed { remote, .. } => Some(remote.ip()),
            ControlNotify::Status { .. } => None,
        };
        if let Some(ip) = remote_ip {
            if !self.bound_controllers.is_empty() && !self.bound_controllers.contains(&ip) {
                return;
            }
        }
        self.notifications.push(notify);
    }

    fn send(&mut self, remote: SocketAddr, msg: IsakmpMessage) {
        self.emit(IkeEvent::PacketTx { remote, ok: true });
        self.outbox.push((remote, msg));
    }

    fn next_msgid(&mut self) -> u32 {
        let id = self.next_msgid;
        self.next_msgid = self.next_msgid.wrapping_add(1).max(1);
        id
    }

    // ─── Inbound dispatch ────────────────────────────────────────────

    /// Decode and dispatch one datagram.
    pub fn handle_datagram(&mut self, local: SocketAddr, remote: SocketAddr, buf: &[u8], now: Instant) {
        match IsakmpMessage::from_bytes(buf) {
            Ok(msg) => self.handle_message(local, remote, msg, now),
            Err(e) => {
                debug!(%remote, error = %e, "undecodable datagram");
                self.emit(IkeEvent::PacketRx { remote, ok: false });
            }
        }
    }

    /// Dispatch one decoded message. Receive-side failures are logged
    /// and dropped here; they never propagate past the loop boundary.
    pub fn handle_message(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        msg: IsakmpMessage,
        now: Instant,
    ) {
        self.emit(IkeEvent::PacketRx { remote, ok: true });
        let pair = EndpointPair::new(local, remote);
        let result = match msg.header.exchange {
            e if e.is_phase1() => self.handle_phase1_message(pair, msg, now),
            ExchangeType::QuickMode => self.handle_quick_mode(pair, msg, now),
            ExchangeType::Informational => self.handle_informational(pair, msg, now),
            ExchangeType::Transaction => self.handle_transaction(pair, msg, now),
            other => {
                debug!(%remote, exchange = ?other, "unhandled exchange type");
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!(%remote, error = %e, "message dropped");
        }
    }

    fn handle_phase1_message(
        &mut self,
        pair: EndpointPair,
        msg: IsakmpMessage,
        now: Instant,
    ) -> EngineResult<()> {
        let key = match self
            .registry
            .find_phase1_by_cookies(&msg.header.initiator_cookie, &msg.header.responder_cookie)
        {
            Some(key) => key,
            None => self.start_responder_phase1(pair, &msg, now)?,
        };
        if let Some(skey) = self.registry.phase1(key).map(|p| p.session) {
            self.maybe_float_ports(skey, pair);
        }
        self.advance_phase1(key, &msg, pair, now);
        Ok(())
    }

    /// A handshake message with unknown cookies starts a responder-side
    /// negotiation, if policy covers the peer.
    fn start_responder_phase1(
        &mut self,
        pair: EndpointPair,
        msg: &IsakmpMessage,
        now: Instant,
    ) -> EngineResult<Phase1Key> {
        if msg.header.responder_cookie != [0u8; 8] {
            return Err(EngineError::NoHandle(msg.header.message_id));
        }
        if !msg.has(PayloadType::Sa) {
            return Err(EngineError::MissingPayload("SA"));
        }
        let remote_cfg = self
            .cfg
            .policy_for(pair.remote)
            .ok_or(EngineError::NoPolicy(pair.remote))?;
        let mode = match msg.header.exchange {
            ExchangeType::Aggressive => ironike_proto::policy::ExchangeMode::Aggressive,
            _ => ironike_proto::policy::ExchangeMode::Main,
        };

        let (skey, created) = self.registry.resolve_or_create(&pair, now);
        if created {
            debug!(endpoints = %pair, "session created for inbound negotiation");
        }
        let phase1 = Phase1::new_responder(
            skey,
            remote_cfg,
            msg.header.initiator_cookie,
            mode,
            self.crypto.as_ref(),
            now,
        );
        let key = self.registry.link_phase1(skey, phase1, false);
        self.notify(ControlNotify::PhaseStart {
            phase: NotifyPhase::Phase1,
            remote: pair.remote,
        });
        Ok(key)
    }

    fn advance_phase1(&mut self, key: Phase1Key, msg: &IsakmpMessage, pair: EndpointPair, now: Instant) {
        let local_id = self.local_id.clone();
        let step = {
            let crypto = &*self.crypto;
            match self.registry.phase1_mut(key) {
                Some(p1) => p1.on_message(msg, &local_id, crypto),
                None => return,
            }
        };

        match step {
            Ok(step) => {
                // Progress cancels the pending retransmission.
                if let Some(p1) = self.registry.phase1_mut(key) {
                    if let Some(token) = p1.retransmit_timer.take() {
                        self.sched.cancel(token);
                    }
                    p1.retries_left = p1.remote.retry_limit;
                }
                if let Some(reply) = step.reply {
                    self.send(pair.remote, reply);
                    if !step.established {
                        self.arm_phase1_retransmit(key, now);
                    }
                }
                if step.established {
                    self.finalize_phase1_established(key, pair.remote, now);
                }
            }
            Err(EngineError::AuthFailed) => {
                self.emit(IkeEvent::AuthFail { remote: pair.remote });
                self.send_notify_error(key, NotifyType::AuthenticationFailed, pair.remote);
                self.notify(ControlNotify::IkeFailed {
                    remote: pair.remote,
                    code: FailureCode::AuthenticationFailed,
                    reason: "phase1 authentication failed".into(),
                });
                self.expire_phase1(key, TerminationReason::NegotiationFailed, now);
            }
            Err(e) => {
                // State mismatch, missing payload, crypto failure: the
                // step aborted with no state change; existing timers
                // stand.
                debug!(remote = %pair.remote, error = %e, "phase1 step rejected");
                self.emit(IkeEvent::PhaseDrop {
                    kind: PhaseKind::Phase1,
                    remote: pair.remote,
                });
            }
        }
    }

    /// Best-effort error notify toward the peer; never retried.
    fn send_notify_error(&mut self, key: Phase1Key, code: NotifyType, remote: SocketAddr) {
        let (icookie, rcookie) = match self.registry.phase1(key) {
            Some(p1) => (p1.initiator_cookie, p1.responder_cookie),
            None => return,
        };
        let msgid = self.next_msgid();
        let msg = IsakmpMessage::new(
            IsakmpHeader {
                initiator_cookie: icookie,
                responder_cookie: rcookie,
                exchange: ExchangeType::Informational,
                flags: 0,
                message_id: msgid,
            },
            vec![Payload::Notification(NotifyPayload::new(code))],
        );
        self.send(remote, msg);
    }

    fn finalize_phase1_established(&mut self, key: Phase1Key, remote: SocketAddr, now: Instant) {
        let (skey, is_rekey, lifetime) = match self.registry.phase1_mut(key) {
            Some(p1) => {
                p1.state = crate::phase1::Phase1State::Established;
                p1.established_at = Some(now);
                (p1.session, p1.is_rekey, p1.remote.phase1_lifetime)
            }
            None => return,
        };

        let token = self.sched.schedule(now, lifetime, TimerEvent::Phase1Lifetime(key));
        if let Some(p1) = self.registry.phase1_mut(key) {
            p1.lifetime_timer = Some(token);
        }

        if let Some(session) = self.registry.session_mut(skey) {
            session.established = true;
            if session.established_at.is_none() {
                session.established_at = Some(now);
            }
        }
        self.arm_session_monitor(skey, now);

        info!(phase1 = %key.tag(), %remote, rekey = is_rekey, "phase1 established");
        self.emit(IkeEvent::AuthSuccess { remote });
        self.emit(IkeEvent::PhaseSuccess {
            kind: PhaseKind::Phase1,
            remote,
        });
        self.notify(ControlNotify::PhaseEstablished {
            phase: NotifyPhase::Phase1,
            remote,
            rekey: is_rekey,
        });

        self.supersede_phase1(key, now);
    }

    /// Arm the sampling and idle timers the first time the session
    /// establishes.
    fn arm_session_monitor(&mut self, skey: SessionKey, now: Instant) {
        let (period, idle_timeout, already_armed) = match self.registry.session_mut(skey) {
            Some(session) => match &mut session.monitor {
                Some(monitor) => {
                    monitor.begin_window();
                    (
                        monitor.sample_period(),
                        monitor.idle.as_ref().map(|i| i.timeout),
                        session.sample_timer.is_some(),
                    )
                }
                None => return,
            },
            None => return,
        };
        if already_armed {
            return;
        }
        let sample = self.sched.schedule(now, period, TimerEvent::TrafficSample(skey));
        let idle = idle_timeout.map(|t| self.sched.schedule(now, t, TimerEvent::IdleTimeout(skey)));
        if let Some(session) = self.registry.session_mut(skey) {
            session.sample_timer = Some(sample);
            session.idle_timer = idle;
        }
    }

    // ─── Supersede policy ────────────────────────────────────────────

    /// When a Phase 1 reaches establishment, elect it the winner and
    /// tear down its established siblings, unless policy defers to the
    /// peer's own delete.
    fn supersede_phase1(&mut self, new_key: Phase1Key, now: Instant) {
        let (skey, new_role) = match self.registry.phase1(new_key) {
            Some(p1) => (p1.session, p1.role),
            None => return,
        };
        let (is_client, siblings) = match self.registry.session(skey) {
            Some(s) => (s.is_client, s.phase1s.clone()),
            None => return,
        };
        // The responder does not self-select a winner for a client
        // session; the peer's delete notification drives teardown.
        if is_client && new_role == Role::Responder {
            debug!(phase1 = %new_key.tag(), "supersede deferred to peer delete");
            return;
        }
        for sibling in siblings {
            if sibling == new_key {
                continue;
            }
            let candidate = match self.registry.phase1(sibling) {
                Some(p1) => !p1.is_dying && p1.is_established(),
                None => false,
            };
            if candidate {
                self.mark_phase1_dying(sibling, Some(new_key), now);
            }
        }
    }

    /// Mark a Phase 1 dying: cancel its expiry/rekey timers, move its
    /// Phase 2 children, and defer the actual delete behind a drain
    /// timer. Idempotent — the teardown timer is armed exactly once.
    pub(crate) fn mark_phase1_dying(&mut self, key: Phase1Key, rebind_to: Option<Phase1Key>, now: Instant) {
        let (role, cancel) = match self.registry.phase1_mut(key) {
            Some(p1) => {
                if p1.is_dying {
                    return;
                }
                p1.is_dying = true;
                let mut cancel = Vec::new();
                if let Some(t) = p1.lifetime_timer.take() {
                    cancel.push(t);
                }
                if let Some(t) = p1.dpd_wait_timer.take() {
                    cancel.push(t);
                }
                (p1.role, cancel)
            }
            None => return,
        };
        for token in cancel {
            self.sched.cancel(token);
        }

        match rebind_to {
            Some(target) => {
                self.registry.move_children(key, Some(target));
            }
            None => {
                self.registry.rebind_children(key);
            }
        }

        let drain = match role {
            Role::Initiator => SUPERSEDE_DRAIN_INITIATOR,
            Role::Responder => SUPERSEDE_DRAIN_RESPONDER,
        };
        let token = self.sched.schedule(now, drain, TimerEvent::Phase1Teardown(key));
        if let Some(p1) = self.registry.phase1_mut(key) {
            p1.teardown_timer = Some(token);
        }
        debug!(phase1 = %key.tag(), ?role, drain_secs = drain.as_secs(), "phase1 marked dying");
    }

    fn supersede_phase2(&mut self, new_key: Phase2Key, now: Instant) {
        let (skey, new_role, spid) = match self.registry.phase2(new_key) {
            Some(p2) => (p2.session, p2.role, p2.spid),
            None => return,
        };
        let (is_client, siblings) = match self.registry.session(skey) {
            Some(s) => (s.is_client, s.phase2s.clone()),
            None => return,
        };
        if is_client && new_role == Role::Responder {
            return;
        }
        for sibling in siblings {
            if sibling == new_key {
                continue;
            }
            let candidate = match self.registry.phase2(sibling) {
                Some(p2) => {
                    p2.kind == Phase2Kind::QuickMode
                        && p2.spid == spid
                        && !p2.is_dying
                        && p2.is_established()
                }
                None => false,
            };
            if candidate {
                self.mark_phase2_dying(sibling, now);
            }
        }
    }

    pub(crate) fn mark_phase2_dying(&mut self, key: Phase2Key, now: Instant) {
        let (role, cancel) = match self.registry.phase2_mut(key) {
            Some(p2) => {
                if p2.is_dying {
                    return;
                }
                p2.is_dying = true;
                (p2.role, p2.lifetime_timer.take())
            }
            None => return,
        };
        if let Some(token) = cancel {
            self.sched.cancel(token);
        }
        let drain = match role {
            Role::Initiator => SUPERSEDE_DRAIN_INITIATOR,
            Role::Responder => SUPERSEDE_DRAIN_PHASE2_RESPONDER,
        };
        let token = self.sched.schedule(now, drain, TimerEvent::Phase2Teardown(key));
        if let Some(p2) = self.registry.phase2_mut(key) {
            p2.teardown_timer = Some(token);
        }
    }

    // ─── Quick Mode ──────────────────────────────────────────────────

    fn handle_quick_mode(
        &mut self,
        pair: EndpointPair,
        msg: IsakmpMessage,
        now: Instant,
    ) -> EngineResult<()> {
        let skey = self
            .registry
            .resolve(&pair)
            .ok_or(EngineError::NoSession(pair.remote))?;
        self.maybe_float_ports(skey, pair);

        let msgid = msg.header.message_id;
        let key = match self.registry.find_phase2_by_msgid(skey, msgid) {
            Some(key) => key,
            None => {
                // A fresh Quick Mode from the peer needs a mature
                // Phase 1 to run under.
                let ph1 = self
                    .registry
                    .established_phase1(skey)
                    .ok_or(EngineError::NoHandle(msgid))?;
                let remote_cfg = self
                    .registry
                    .phase1(ph1)
                    .map(|p| Arc::clone(&p.remote))
                    .ok_or(EngineError::NoHandle(msgid))?;
                let phase2 = Phase2::new_responder(skey, msgid, remote_cfg, now);
                let key = self.registry.link_phase2(skey, phase2);
                self.registry.bind_phase2(key, ph1)?;
                self.notify(ControlNotify::PhaseStart {
                    phase: NotifyPhase::Phase2,
                    remote: pair.remote,
                });
                key
            }
        };
        self.advance_phase2(key, &msg, pair.remote, now);
        Ok(())
    }

    /// Lazily rebind a Phase 2 that lost its Phase 1 to the best
    /// survivor before use.
    fn ensure_phase2_bound(&mut self, key: Phase2Key) -> EngineResult<()> {
        let (skey, bound) = match self.registry.phase2(key) {
            Some(p2) => (p2.session, p2.ph1bind),
            None => return Err(EngineError::NoHandle(0)),
        };
        if let Some(p1) = bound {
            if self.registry.phase1(p1).is_some() {
                return Ok(());
            }
        }
        let survivor = self
            .registry
            .best_surviving_phase1(skey, None)
            .ok_or(EngineError::NoHandle(0))?;
        self.registry.bind_phase2(key, survivor)
    }

    fn advance_phase2(&mut self, key: Phase2Key, msg: &IsakmpMessage, remote: SocketAddr, now: Instant) {
        if self.ensure_phase2_bound(key).is_err() {
            debug!(%remote, "quick mode message without a usable phase1");
            self.emit(IkeEvent::PhaseDrop {
                kind: PhaseKind::Phase2,
                remote,
            });
            return;
        }

        let step = {
            let crypto = &*self.crypto;
            match self.registry.quick_step_parts(key) {
                Some((p2, p1)) => match p1.material.as_ref() {
                    Some(material) => {
                        let ctx = Ph1Context {
                            initiator_cookie: p1.initiator_cookie,
                            responder_cookie: p1.responder_cookie,
                            material,
                        };
                        p2.on_message(msg, &ctx, crypto)
                    }
                    None => Err(EngineError::NoHandle(msg.header.message_id)),
                },
                None => return,
            }
        };

        match step {
            Ok(step) => {
                if let Some(p2) = self.registry.phase2_mut(key) {
                    if let Some(token) = p2.retransmit_timer.take() {
                        self.sched.cancel(token);
                    }
                    p2.retries_left = p2.remote.retry_limit;
                }
                if let Some(reply) = step.reply {
                    self.send(remote, reply);
                }
                if step.install {
                    self.submit_phase2_install(key, remote);
                } else if self
                    .registry
                    .phase2(key)
                    .map(|p| p.state == crate::phase2::Phase2State::SpiWait && p.local_spi.is_none())
                    .unwrap_or(false)
                {
                    // Responder parked for its SPI.
                    let seq = self.gateway.submit(SadbRequest::GetSpi { remote });
                    self.pending_sadb.insert(seq, SadbOwner::Phase2Spi(key));
                }
            }
            Err(EngineError::AuthFailed) => {
                self.emit(IkeEvent::AuthFail { remote });
                self.emit(IkeEvent::PhaseDrop {
                    kind: PhaseKind::Phase2,
                    remote,
                });
            }
            Err(e) => {
                debug!(%remote, error = %e, "phase2 step rejected");
                self.emit(IkeEvent::PhaseDrop {
                    kind: PhaseKind::Phase2,
                    remote,
                });
            }
        }
    }

    fn submit_phase2_install(&mut self, key: Phase2Key, remote: SocketAddr) {
        let (local_spi, peer_spi, sa) = match self.registry.phase2(key) {
            Some(p2) => (
                p2.local_spi,
                p2.peer_spi,
                p2.approval.clone().unwrap_or_default(),
            ),
            None => return,
        };
        if let Some(spi) = local_spi {
            let seq = self.gateway.submit(SadbRequest::Install {
                direction: Direction::Inbound,
                spi,
                remote,
                sa: sa.clone(),
            });
            self.pending_sadb.insert(seq, SadbOwner::Phase2Install(key));
        }
        if let Some(spi) = peer_spi {
            let seq = self.gateway.submit(SadbRequest::Install {
                direction: Direction::Outbound,
                spi,
                remote,
                sa,
            });
            self.pending_sadb.insert(seq, SadbOwner::Phase2Install(key));
        }
    }

    fn finalize_phase2_established(&mut self, key: Phase2Key, now: Instant) {
        let (skey, is_rekey, lifetime) = match self.registry.phase2_mut(key) {
            Some(p2) => {
                p2.state = crate::phase2::Phase2State::Established;
                p2.established_at = Some(now);
                (p2.session, p2.is_rekey, p2.remote.phase2_lifetime)
            }
            None => return,
        };
        let remote = match self.registry.session(skey) {
            Some(s) => s.endpoints.remote,
            None => return,
        };

        let token = self.sched.schedule(now, lifetime, TimerEvent::Phase2Lifetime(key));
        if let Some(p2) = self.registry.phase2_mut(key) {
            p2.lifetime_timer = Some(token);
        }

        info!(phase2 = %key.tag(), %remote, rekey = is_rekey, "phase2 established");
        self.emit(IkeEvent::PhaseSuccess {
            kind: PhaseKind::Phase2,
            remote,
        });
        self.notify(ControlNotify::PhaseEstablished {
            phase: NotifyPhase::Phase2,
            remote,
            rekey: is_rekey,
        });
        self.supersede_phase2(key, now);
    }

    // ─── Informational ───────────────────────────────────────────────

    fn handle_informational(
        &mut self,
        pair: EndpointPair,
        msg: IsakmpMessage,
        now: Instant,
    ) -> EngineResult<()> {
        let notifications: Vec<NotifyPayload> = msg.notifications().cloned().collect();
        for notify in notifications {
            match notify.notify_type() {
                Some(NotifyType::RUThere) => {
                    self.answer_dpd_probe(&msg.header, &notify, pair.remote);
                }
                Some(NotifyType::RUThereAck) => {
                    self.absorb_dpd_ack(&msg.header, &notify);
                }
                Some(NotifyType::InitialContact) => {
                    debug!(remote = %pair.remote, "initial-contact received");
                }
                Some(other) => {
                    debug!(remote = %pair.remote, code = ?other, "peer notify");
                }
                None => {
                    debug!(remote = %pair.remote, code = notify.code, "unknown notify code");
                }
            }
        }

        let deletes: Vec<DeletePayload> = msg
            .payloads
            .iter()
            .filter_map(|p| match p {
                Payload::Delete(d) => Some(d.clone()),
                _ => None,
            })
            .collect();
        for delete in deletes {
            self.handle_peer_delete(&msg.header, delete, pair, now);
        }
        Ok(())
    }

    fn answer_dpd_probe(&mut self, header: &IsakmpHeader, probe: &NotifyPayload, remote: SocketAddr) {
        let msgid = self.next_msgid();
        let ack = IsakmpMessage::new(
            IsakmpHeader {
                initiator_cookie: header.initiator_cookie,
                responder_cookie: header.responder_cookie,
                exchange: ExchangeType::Informational,
                flags: 0,
                message_id: msgid,
            },
            vec![Payload::Notification(NotifyPayload {
                code: NotifyType::RUThereAck.to_u16(),
                ..probe.clone()
            })],
        );
        self.send(remote, ack);
    }

    fn absorb_dpd_ack(&mut self, header: &IsakmpHeader, ack: &NotifyPayload) {
        let key = match self
            .registry
            .find_phase1_by_cookies(&header.initiator_cookie, &header.responder_cookie)
        {
            Some(key) => key,
            None => return,
        };
        let seq = ack
            .data
            .get(..4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]));
        let cancel = match self.registry.phase1_mut(key) {
            Some(p1) => {
                if p1.dpd.pending.is_some() && p1.dpd.pending == seq {
                    p1.dpd.pending = None;
                    p1.dpd.fails = 0;
                    p1.dpd_wait_timer.take()
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(token) = cancel {
            self.sched.cancel(token);
        }
    }

    fn handle_peer_delete(
        &mut self,
        header: &IsakmpHeader,
        delete: DeletePayload,
        pair: EndpointPair,
        now: Instant,
    ) {
        match delete.protocol {
            PROTO_ISAKMP => {
                if let Some(key) = self
                    .registry
                    .find_phase1_by_cookies(&header.initiator_cookie, &header.responder_cookie)
                {
                    info!(phase1 = %key.tag(), remote = %pair.remote, "peer deleted phase1");
                    self.expire_phase1(key, TerminationReason::PeerDeleted, now);
                }
            }
            _ => {
                let skey = match self.registry.resolve(&pair) {
                    Some(s) => s,
                    None => return,
                };
                for spi_bytes in &delete.spis {
                    let spi = match spi_bytes.get(..4) {
                        Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
                        None => continue,
                    };
                    let victim = self
                        .registry
                        .session(skey)
                        .map(|s| s.phase2s.clone())
                        .unwrap_or_default()
                        .into_iter()
                        .find(|k| {
                            self.registry
                                .phase2(*k)
                                .map(|p| p.peer_spi == Some(spi))
                                .unwrap_or(false)
                        });
                    if let Some(key) = victim {
                        info!(phase2 = %key.tag(), spi, "peer deleted phase2");
                        self.expire_phase2(key, TerminationReason::PeerDeleted, now);
                    }
                }
            }
        }
    }

    // ─── ModeConfig / XAUTH (lifecycle effects only) ─────────────────

    fn handle_transaction(
        &mut self,
        pair: EndpointPair,
        msg: IsakmpMessage,
        now: Instant,
    ) -> EngineResult<()> {
        let skey = self
            .registry
            .resolve(&pair)
            .ok_or(EngineError::NoSession(pair.remote))?;
        let ph1 = self
            .registry
            .established_phase1(skey)
            .ok_or(EngineError::NoHandle(msg.header.message_id))?;

        let wants_xauth = self
            .registry
            .phase1(ph1)
            .map(|p| p.remote.xauth && !p.xauth_pending)
            .unwrap_or(false);
        if wants_xauth {
            let remote_cfg = self
                .registry
                .phase1(ph1)
                .map(|p| Arc::clone(&p.remote))
                .expect("checked above");
            // Park the exchange on a tracking handle until a controller
            // answers.
            let tracker = Phase2::new_tracking(
                skey,
                Phase2Kind::ModeConfig,
                msg.header.message_id,
                remote_cfg,
                now,
            );
            let tracker_key = self.registry.link_phase2(skey, tracker);
            self.registry.bind_phase2(tracker_key, ph1)?;
            if let Some(p1) = self.registry.phase1_mut(ph1) {
                p1.xauth_pending = true;
            }
            self.notify(ControlNotify::NeedAuthinfo {
                remote: pair.remote,
            });
        } else {
            debug!(remote = %pair.remote, "transaction message outside xauth window");
        }
        Ok(())
    }

    // ─── NAT float ───────────────────────────────────────────────────

    /// Adopt NAT-T floated ports when the peer is first observed on
    /// them, so later lookups resolve exactly.
    fn maybe_float_ports(&mut self, skey: SessionKey, observed: EndpointPair) {
        let should = match self.registry.session(skey) {
            Some(s) => {
                !s.ports_floated
                    && observed.remote.port() == ISAKMP_NATT_PORT
                    && s.endpoints != observed
                    && s.endpoints.remote.ip() == observed.remote.ip()
                    && s.endpoints.local.ip() == observed.local.ip()
            }
            None => false,
        };
        if should {
            if let Some(s) = self.registry.session_mut(skey) {
                info!(endpoints = %observed, "session ports floated");
                s.float_ports(observed);
            }
        }
    }

    // ─── Timers ──────────────────────────────────────────────────────

    fn handle_timer(&mut self, event: TimerEvent, now: Instant) {
        match event {
            TimerEvent::Phase1Retransmit(key) => self.phase1_retransmit(key, now),
            TimerEvent::Phase1Lifetime(key) => self.phase1_lifetime(key, now),
            TimerEvent::Phase1Teardown(key) => self.phase1_teardown(key, now),
            TimerEvent::Phase2Retransmit(key) => self.phase2_retransmit(key, now),
            TimerEvent::Phase2Lifetime(key) => self.phase2_lifetime(key, now),
            TimerEvent::Phase2Teardown(key) => self.phase2_teardown(key, now),
            TimerEvent::DpdWait(key) => self.dpd_wait_expired(key, now),
            TimerEvent::TrafficSample(key) => self.traffic_sample(key, now),
            TimerEvent::IdleTimeout(key) => self.idle_timeout(key, now),
        }
    }

    fn arm_phase1_retransmit(&mut self, key: Phase1Key, now: Instant) {
        let interval = match self.registry.phase1(key) {
            Some(p1) => p1.remote.retry_interval,
            None => return,
        };
        let token = self.sched.schedule(now, interval, TimerEvent::Phase1Retransmit(key));
        if let Some(p1) = self.registry.phase1_mut(key) {
            if let Some(old) = p1.retransmit_timer.replace(token) {
                self.sched.cancel(old);
            }
        }
    }

    fn phase1_retransmit(&mut self, key: Phase1Key, now: Instant) {
        let (remote, resend) = {
            let session = self.registry.phase1(key).map(|p| p.session);
            let remote = session
                .and_then(|s| self.registry.session(s))
                .map(|s| s.endpoints.remote);
            let resend = match self.registry.phase1_mut(key) {
                Some(p1) => {
                    p1.retransmit_timer = None;
                    if p1.is_established() || p1.is_dying {
                        None
                    } else if p1.retries_left > 0 {
                        p1.retries_left -= 1;
                        p1.last_sent.clone()
                    } else {
                        None
                    }
                }
                None => return,
            };
            (remote, resend)
        };
        let remote = match remote {
            Some(r) => r,
            None => return,
        };
        match resend {
            Some(msg) => {
                debug!(phase1 = %key.tag(), %remote, "retransmitting phase1 message");
                self.send(remote, msg);
                self.arm_phase1_retransmit(key, now);
            }
            None => {
                let negotiating = self
                    .registry
                    .phase1(key)
                    .map(|p| p.state.is_negotiating())
                    .unwrap_or(false);
                if negotiating {
                    warn!(phase1 = %key.tag(), %remote, "phase1 retry budget exhausted");
                    self.emit(IkeEvent::PhaseFail {
                        kind: PhaseKind::Phase1,
                        remote,
                        reason: "retransmission budget exhausted",
                    });
                    self.notify(ControlNotify::IkeFailed {
                        remote,
                        code: FailureCode::NegotiationTimeout,
                        reason: "phase1 negotiation timed out".into(),
                    });
                    self.expire_phase1(key, TerminationReason::NegotiationFailed, now);
                }
            }
        }
    }

    fn phase1_lifetime(&mut self, key: Phase1Key, now: Instant) {
        let (skey, dying) = match self.registry.phase1_mut(key) {
            Some(p1) => {
                p1.lifetime_timer = None;
                (p1.session, p1.is_dying)
            }
            None => return,
        };
        if dying {
            self.send_phase1_delete(key);
            self.expire_phase1(key, TerminationReason::Expired, now);
            return;
        }
        let is_client = self
            .registry
            .session(skey)
            .map(|s| s.is_client)
            .unwrap_or(false);
        if is_client {
            // Client side rekeys before the SA lapses; the old handle
            // drains behind the supersede timers once the replacement
            // establishes, but gets a teardown bound anyway in case the
            // rekey never completes.
            let remote = self
                .registry
                .session(skey)
                .map(|s| s.endpoints.remote);
            self.mark_phase1_dying(key, None, now);
            if let Some(remote) = remote {
                if let Err(e) = self.initiate(remote, now) {
                    warn!(%remote, error = %e, "phase1 rekey failed to start");
                }
            }
        } else {
            self.send_phase1_delete(key);
            self.expire_phase1(key, TerminationReason::Expired, now);
        }
    }

    fn phase1_teardown(&mut self, key: Phase1Key, now: Instant) {
        if let Some(p1) = self.registry.phase1_mut(key) {
            p1.teardown_timer = None;
        }
        self.send_phase1_delete(key);
        self.expire_phase1(key, TerminationReason::Superseded, now);
    }

    fn arm_phase2_retransmit(&mut self, key: Phase2Key, now: Instant) {
        let interval = match self.registry.phase2(key) {
            Some(p2) => p2.remote.retry_interval,
            None => return,
        };
        let token = self.sched.schedule(now, interval, TimerEvent::Phase2Retransmit(key));
        if let Some(p2) = self.registry.phase2_mut(key) {
            if let Some(old) = p2.retransmit_timer.replace(token) {
                self.sched.cancel(old);
            }
        }
    }

    fn phase2_retransmit(&mut self, key: Phase2Key, now: Instant) {
        let (remote, resend) = {
            let session = self.registry.phase2(key).map(|p| p.session);
            let remote = session
                .and_then(|s| self.registry.session(s))
                .map(|s| s.endpoints.remote);
            let resend = match self.registry.phase2_mut(key) {
                Some(p2) => {
                    p2.retransmit_timer = None;
                    if p2.is_established() || p2.is_dying {
                        None
                    } else if p2.retries_left > 0 {
                        p2.retries_left -= 1;
                        p2.last_sent.clone()
                    } else {
                        None
                    }
                }
                None => return,
            };
            (remote, resend)
        };
        let remote = match remote {
            Some(r) => r,
            None => return,
        };
        match resend {
            Some(msg) => {
                self.send(remote, msg);
                self.arm_phase2_retransmit(key, now);
            }
            None => {
                let negotiating = self
                    .registry
                    .phase2(key)
                    .map(|p| p.state.is_negotiating())
                    .unwrap_or(false);
                if negotiating {
                    self.emit(IkeEvent::PhaseFail {
                        kind: PhaseKind::Phase2,
                        remote,
                        reason: "retransmission budget exhausted",
                    });
                    self.notify(ControlNotify::IkeFailed {
                        remote,
                        code: FailureCode::NegotiationTimeout,
                        reason: "phase2 negotiation timed out".into(),
                    });
                    self.expire_phase2(key, TerminationReason::NegotiationFailed, now);
                }
            }
        }
    }

    fn phase2_lifetime(&mut self, key: Phase2Key, now: Instant) {
        let (skey, dying, kind) = match self.registry.phase2_mut(key) {
            Some(p2) => {
                p2.lifetime_timer = None;
                (p2.session, p2.is_dying, p2.kind)
            }
            None => return,
        };
        let is_client = self
            .registry
            .session(skey)
            .map(|s| s.is_client)
            .unwrap_or(false);
        if !dying && is_client && kind == Phase2Kind::QuickMode {
            let (spid, proposal, encap, l2tp) = match self.registry.phase2(key) {
                Some(p2) => (p2.spid, p2.proposal.clone(), p2.encap, p2.l2tp),
                None => return,
            };
            self.mark_phase2_dying(key, now);
            if let Err(e) = self.start_phase2_inner(skey, spid, proposal, encap, l2tp, true, now) {
                warn!(error = %e, "phase2 rekey failed to start");
            }
        } else {
            self.send_phase2_delete(key);
            self.expire_phase2(key, TerminationReason::Expired, now);
        }
    }

    fn phase2_teardown(&mut self, key: Phase2Key, now: Instant) {
        if let Some(p2) = self.registry.phase2_mut(key) {
            p2.teardown_timer = None;
        }
        self.send_phase2_delete(key);
        self.expire_phase2(key, TerminationReason::Superseded, now);
    }

    // ─── DPD ─────────────────────────────────────────────────────────

    fn send_dpd_probe(&mut self, key: Phase1Key, now: Instant) {
        let (icookie, rcookie, seq, timeout, remote) = {
            let p1 = match self.registry.phase1_mut(key) {
                Some(p) => p,
                None => return,
            };
            if p1.dpd.pending.is_some() {
                return;
            }
            p1.dpd.seq = p1.dpd.seq.wrapping_add(1).max(1);
            let seq = p1.dpd.seq;
            p1.dpd.pending = Some(seq);
            let timeout = p1
                .remote
                .dpd
                .as_ref()
                .map(|d| d.retry_timeout)
                .unwrap_or(Duration::from_secs(5));
            (p1.initiator_cookie, p1.responder_cookie, seq, timeout, p1.session)
        };
        let remote = match self.registry.session(remote) {
            Some(s) => s.endpoints.remote,
            None => return,
        };

        let mut spi = Vec::with_capacity(16);
        spi.extend_from_slice(&icookie);
        spi.extend_from_slice(&rcookie);
        let msgid = self.next_msgid();
        let probe = IsakmpMessage::new(
            IsakmpHeader {
                initiator_cookie: icookie,
                responder_cookie: rcookie,
                exchange: ExchangeType::Informational,
                flags: 0,
                message_id: msgid,
            },
            vec![Payload::Notification(NotifyPayload {
                doi: ironike_proto::constants::IPSEC_DOI,
                protocol: PROTO_ISAKMP,
                spi,
                code: NotifyType::RUThere.to_u16(),
                data: seq.to_be_bytes().to_vec(),
            })],
        );
        debug!(phase1 = %key.tag(), %remote, seq, "dpd probe");
        self.send(remote, probe);

        let token = self.sched.schedule(now, timeout, TimerEvent::DpdWait(key));
        if let Some(p1) = self.registry.phase1_mut(key) {
            if let Some(old) = p1.dpd_wait_timer.replace(token) {
                self.sched.cancel(old);
            }
        }
    }

    fn dpd_wait_expired(&mut self, key: Phase1Key, now: Instant) {
        let (skey, fails, max_fails, pending_seq, timeout) = {
            let p1 = match self.registry.phase1_mut(key) {
                Some(p) => p,
                None => return,
            };
            p1.dpd_wait_timer = None;
            if p1.dpd.pending.is_none() {
                return;
            }
            p1.dpd.fails += 1;
            let max = p1.remote.dpd.as_ref().map(|d| d.max_fails).unwrap_or(5);
            let timeout = p1
                .remote
                .dpd
                .as_ref()
                .map(|d| d.retry_timeout)
                .unwrap_or(Duration::from_secs(5));
            (p1.session, p1.dpd.fails, max, p1.dpd.pending, timeout)
        };
        let remote = match self.registry.session(skey) {
            Some(s) => s.endpoints.remote,
            None => return,
        };

        if fails >= max_fails {
            // Peer presumed dead: purge, never probe again.
            warn!(phase1 = %key.tag(), %remote, fails, "dpd exhausted, peer presumed dead");
            self.emit(IkeEvent::PhaseFail {
                kind: PhaseKind::Phase1,
                remote,
                reason: "dead peer detection exhausted",
            });
            self.notify(ControlNotify::IkeFailed {
                remote,
                code: FailureCode::PeerDead,
                reason: "dpd probes unacknowledged".into(),
            });
            self.cleanup_session(skey, TerminationReason::PeerDead, now);
            return;
        }

        // Resend the pending probe and keep waiting.
        let (icookie, rcookie) = match self.registry.phase1(key) {
            Some(p1) => (p1.initiator_cookie, p1.responder_cookie),
            None => return,
        };
        let seq = pending_seq.unwrap_or(0);
        let mut spi = Vec::with_capacity(16);
        spi.extend_from_slice(&icookie);
        spi.extend_from_slice(&rcookie);
        let msgid = self.next_msgid();
        let probe = IsakmpMessage::new(
            IsakmpHeader {
                initiator_cookie: icookie,
                responder_cookie: rcookie,
                exchange: ExchangeType::Informational,
                flags: 0,
                message_id: msgid,
            },
            vec![Payload::Notification(NotifyPayload {
                doi: ironike_proto::constants::IPSEC_DOI,
                protocol: PROTO_ISAKMP,
                spi,
                code: NotifyType::RUThere.to_u16(),
                data: seq.to_be_bytes().to_vec(),
            })],
        );
        debug!(phase1 = %key.tag(), %remote, seq, fails, "dpd probe retry");
        self.send(remote, probe);
        let token = self.sched.schedule(now, timeout, TimerEvent::DpdWait(key));
        if let Some(p1) = self.registry.phase1_mut(key) {
            p1.dpd_wait_timer = Some(token);
        }
    }

    // ─── Traffic monitor ─────────────────────────────────────────────

    fn traffic_sample(&mut self, skey: SessionKey, now: Instant) {
        let (established, period, probe_wanted, remote) = {
            let session = match self.registry.session_mut(skey) {
                Some(s) => s,
                None => return,
            };
            session.sample_timer = None;
            let remote = session.endpoints.remote;
            match &mut session.monitor {
                Some(monitor) => {
                    let probe = monitor.should_probe();
                    let period = monitor.sample_period();
                    monitor.begin_window();
                    (session.established, period, probe, remote)
                }
                None => return,
            }
        };
        if !established {
            return;
        }

        if probe_wanted {
            let candidate = self.registry.established_phase1(skey).filter(|k| {
                self.registry
                    .phase1(*k)
                    .map(|p| p.peer_supports_dpd && p.remote.dpd.is_some())
                    .unwrap_or(false)
            });
            if let Some(ph1) = candidate {
                self.send_dpd_probe(ph1, now);
            }
        }

        for direction in [Direction::Inbound, Direction::Outbound] {
            let seq = self.gateway.submit(SadbRequest::QueryStats {
                session: skey,
                direction,
                remote,
            });
            self.pending_sadb
                .insert(seq, SadbOwner::SessionStats(skey, direction));
        }

        let token = self.sched.schedule(now, period, TimerEvent::TrafficSample(skey));
        if let Some(session) = self.registry.session_mut(skey) {
            session.sample_timer = Some(token);
        }
    }

    fn idle_timeout(&mut self, skey: SessionKey, now: Instant) {
        let remote = match self.registry.session_mut(skey) {
            Some(session) => {
                session.idle_timer = None;
                session.endpoints.remote
            }
            None => return,
        };
        info!(%remote, "session idle, tearing down");
        self.notify(ControlNotify::IkeFailed {
            remote,
            code: FailureCode::IdleTimeout,
            reason: "no traffic within idle timeout".into(),
        });
        self.cleanup_session(skey, TerminationReason::IdleTimeout, now);
    }

    // ─── SADB replies ────────────────────────────────────────────────

    fn handle_sadb_reply(&mut self, reply: SadbReply, now: Instant) {
        let owner = match self.pending_sadb.remove(&reply.seq()) {
            Some(owner) => owner,
            None => {
                debug!(seq = reply.seq(), "stray sadb reply");
                return;
            }
        };
        match (reply, owner) {
            (SadbReply::Spi { spi, .. }, SadbOwner::Phase2Spi(key)) => {
                self.phase2_spi_ready(key, spi, now);
            }
            (SadbReply::Installed { .. }, SadbOwner::Phase2Install(key)) => {
                let done = match self.registry.phase2_mut(key) {
                    Some(p2) => p2.on_installed().unwrap_or(false),
                    None => false,
                };
                if done {
                    self.finalize_phase2_established(key, now);
                }
            }
            (SadbReply::Stats { direction, entries, .. }, SadbOwner::SessionStats(skey, _)) => {
                self.absorb_stats(skey, direction, &entries, now);
            }
            (SadbReply::Failed { message, .. }, SadbOwner::Phase2Spi(key))
            | (SadbReply::Failed { message, .. }, SadbOwner::Phase2Install(key)) => {
                let remote = self
                    .registry
                    .phase2(key)
                    .and_then(|p| self.registry.session(p.session))
                    .map(|s| s.endpoints.remote);
                warn!(phase2 = %key.tag(), error = %message, "kernel rejected SA operation");
                if let Some(remote) = remote {
                    self.emit(IkeEvent::PhaseFail {
                        kind: PhaseKind::Phase2,
                        remote,
                        reason: "kernel SA operation failed",
                    });
                    self.notify(ControlNotify::IkeFailed {
                        remote,
                        code: FailureCode::InternalError,
                        reason: message,
                    });
                }
                self.expire_phase2(key, TerminationReason::NegotiationFailed, now);
            }
            (SadbReply::Failed { message, .. }, SadbOwner::SessionStats(..)) => {
                debug!(error = %message, "stats query failed");
            }
            (SadbReply::Deleted { .. }, _) | (_, SadbOwner::FireAndForget) => {}
            (reply, _) => {
                debug!(?reply, "sadb reply did not match its owner");
            }
        }
    }

    fn phase2_spi_ready(&mut self, key: Phase2Key, spi: u32, now: Instant) {
        if self.ensure_phase2_bound(key).is_err() {
            self.expire_phase2(key, TerminationReason::NegotiationFailed, now);
            return;
        }
        let step = {
            let crypto = &*self.crypto;
            match self.registry.quick_step_parts(key) {
                Some((p2, p1)) => match p1.material.as_ref() {
                    Some(material) => {
                        let ctx = Ph1Context {
                            initiator_cookie: p1.initiator_cookie,
                            responder_cookie: p1.responder_cookie,
                            material,
                        };
                        p2.on_spi(spi, &ctx, crypto)
                    }
                    None => Err(EngineError::NoHandle(0)),
                },
                None => return,
            }
        };
        let remote = match self
            .registry
            .phase2(key)
            .and_then(|p| self.registry.session(p.session))
        {
            Some(s) => s.endpoints.remote,
            None => return,
        };
        match step {
            Ok(step) => {
                if let Some(reply) = step.reply {
                    self.send(remote, reply);
                    self.arm_phase2_retransmit(key, now);
                }
            }
            Err(e) => {
                debug!(phase2 = %key.tag(), error = %e, "spi reply rejected");
            }
        }
    }

    fn absorb_stats(&mut self, skey: SessionKey, direction: Direction, entries: &[(u32, u64)], now: Instant) {
        let total: u64 = entries.iter().map(|(_, bytes)| bytes).sum();
        let (refresh, idle_timeout) = match self.registry.session_mut(skey) {
            Some(session) => match &mut session.monitor {
                Some(monitor) => {
                    match direction {
                        Direction::Inbound => monitor.observe_inbound(total),
                        Direction::Outbound => monitor.observe_outbound(total),
                    };
                    (
                        monitor.idle_refreshed(),
                        monitor.idle.as_ref().map(|i| i.timeout),
                    )
                }
                None => return,
            },
            None => return,
        };
        if refresh {
            if let Some(timeout) = idle_timeout {
                let token = self.sched.schedule(now, timeout, TimerEvent::IdleTimeout(skey));
                if let Some(session) = self.registry.session_mut(skey) {
                    if let Some(old) = session.idle_timer.replace(token) {
                        self.sched.cancel(old);
                    }
                }
            }
        }
    }

    // ─── Control commands ────────────────────────────────────────────

    pub fn handle_control(&mut self, cmd: ControlCommand, now: Instant) {
        match cmd {
            ControlCommand::Connect { remote } => {
                if let Err(e) = self.initiate(remote, now) {
                    warn!(%remote, error = %e, "connect failed");
                    self.notify(ControlNotify::IkeFailed {
                        remote,
                        code: FailureCode::InternalError,
                        reason: e.to_string(),
                    });
                }
            }
            ControlCommand::Disconnect { remote } => {
                let pair = EndpointPair::new(self.cfg.listen, remote);
                match self.registry.resolve(&pair) {
                    Some(skey) => {
                        self.notify(ControlNotify::IkeFailed {
                            remote,
                            code: FailureCode::UserRequested,
                            reason: "disconnect requested".into(),
                        });
                        self.cleanup_session(skey, TerminationReason::UserRequested, now);
                    }
                    None => debug!(%remote, "disconnect for unknown session"),
                }
            }
            ControlCommand::StartPhase2 { remote, spid } => {
                if let Err(e) = self.start_phase2(remote, spid, now) {
                    warn!(%remote, spid, error = %e, "start-phase2 failed");
                    self.notify(ControlNotify::IkeFailed {
                        remote,
                        code: FailureCode::InternalError,
                        reason: e.to_string(),
                    });
                }
            }
            ControlCommand::StartDpd { remote } => {
                let pair = EndpointPair::new(self.cfg.listen, remote);
                if let Some(ph1) = self
                    .registry
                    .resolve(&pair)
                    .and_then(|skey| self.registry.established_phase1(skey))
                {
                    self.send_dpd_probe(ph1, now);
                }
            }
            ControlCommand::XauthAnswer { remote, username, .. } => {
                self.finish_xauth(remote, &username, now);
            }
            ControlCommand::Bind { remote } => {
                self.bound_controllers.insert(remote);
            }
            ControlCommand::Unbind { remote } => {
                self.bound_controllers.remove(&remote);
            }
            ControlCommand::Assert { remote } => {
                // Failover assert: force a rekey of the established
                // Phase 1.
                let pair = EndpointPair::new(self.cfg.listen, remote);
                if let Some(ph1) = self
                    .registry
                    .resolve(&pair)
                    .and_then(|skey| self.registry.established_phase1(skey))
                {
                    self.mark_phase1_dying(ph1, None, now);
                    if let Err(e) = self.initiate(remote, now) {
                        warn!(%remote, error = %e, "assert rekey failed");
                    }
                }
            }
            ControlCommand::Status => {
                let sessions = self.status_snapshot();
                self.notifications.push(ControlNotify::Status { sessions });
            }
        }
    }

    fn status_snapshot(&self) -> Vec<SessionStatus> {
        self.registry
            .session_keys()
            .into_iter()
            .filter_map(|k| self.registry.session(k))
            .map(|s| SessionStatus {
                local: s.endpoints.local,
                remote: s.endpoints.remote,
                established: s.established,
                is_client: s.is_client,
                ports_floated: s.ports_floated,
                active_phase1: s.active_phase1,
                active_phase2: s.active_phase2,
            })
            .collect()
    }

    fn finish_xauth(&mut self, remote: SocketAddr, username: &str, now: Instant) {
        let pair = EndpointPair::new(self.cfg.listen, remote);
        let skey = match self.registry.resolve(&pair) {
            Some(s) => s,
            None => return,
        };
        let ph1 = match self.registry.established_phase1(skey) {
            Some(k) => k,
            None => return,
        };
        let pending = self
            .registry
            .phase1(ph1)
            .map(|p| p.xauth_pending)
            .unwrap_or(false);
        if !pending {
            return;
        }

        // Find and retire the parked tracking handle.
        let tracker = self
            .registry
            .session(skey)
            .map(|s| s.phase2s.clone())
            .unwrap_or_default()
            .into_iter()
            .find(|k| {
                self.registry
                    .phase2(*k)
                    .map(|p| p.kind == Phase2Kind::ModeConfig)
                    .unwrap_or(false)
            });
        let msgid = tracker
            .and_then(|k| self.registry.phase2(k).map(|p| p.msgid))
            .unwrap_or_else(|| self.next_msgid());

        let (icookie, rcookie) = match self.registry.phase1(ph1) {
            Some(p1) => (p1.initiator_cookie, p1.responder_cookie),
            None => return,
        };
        // The attribute body itself is opaque sub-protocol; only the
        // lifecycle effect is modeled here.
        let reply = IsakmpMessage::new(
            IsakmpHeader {
                initiator_cookie: icookie,
                responder_cookie: rcookie,
                exchange: ExchangeType::Transaction,
                flags: ironike_proto::message::flags::ENCRYPTED,
                message_id: msgid,
            },
            vec![Payload::Attributes(username.as_bytes().to_vec())],
        );
        self.send(remote, reply);
        if let Some(p1) = self.registry.phase1_mut(ph1) {
            p1.xauth_pending = false;
        }
        if let Some(tracker) = tracker {
            self.expire_phase2(tracker, TerminationReason::UserRequested, now);
        }
    }

    // ─── Local initiation ────────────────────────────────────────────

    /// Start a Phase 1 negotiation toward a configured peer.
    pub fn initiate(&mut self, remote: SocketAddr, now: Instant) -> EngineResult<Phase1Key> {
        let remote_cfg = self
            .cfg
            .policy_for(remote)
            .ok_or(EngineError::NoPolicy(remote))?;
        let pair = EndpointPair::new(self.cfg.listen, remote);
        let (skey, _) = self.registry.resolve_or_create(&pair, now);

        let mut phase1 = Phase1::new_initiator(skey, remote_cfg, self.crypto.as_ref(), now);
        let msg = phase1.initiate(self.crypto.as_ref())?;
        let key = self.registry.link_phase1(skey, phase1, true);

        self.notify(ControlNotify::PhaseStart {
            phase: NotifyPhase::Phase1,
            remote,
        });
        self.send(remote, msg);
        self.arm_phase1_retransmit(key, now);
        info!(phase1 = %key.tag(), %remote, "phase1 initiated");
        Ok(key)
    }

    /// Start a Quick Mode negotiation for a policy id.
    pub fn start_phase2(&mut self, remote: SocketAddr, spid: u32, now: Instant) -> EngineResult<Phase2Key> {
        let pair = EndpointPair::new(self.cfg.listen, remote);
        let skey = self
            .registry
            .resolve(&pair)
            .ok_or(EngineError::NoSession(remote))?;
        let remote_cfg = self
            .registry
            .established_phase1(skey)
            .and_then(|k| self.registry.phase1(k))
            .map(|p| Arc::clone(&p.remote))
            .ok_or(EngineError::NoHandle(0))?;
        let encap = if remote_cfg.transport {
            SaEncapMode::Transport
        } else {
            SaEncapMode::Tunnel
        };
        let l2tp = remote_cfg.l2tp;
        let proposal = remote_cfg.proposal.clone();
        self.start_phase2_inner(skey, spid, proposal, encap, l2tp, false, now)
    }

    fn start_phase2_inner(
        &mut self,
        skey: SessionKey,
        spid: u32,
        proposal: Vec<u8>,
        encap: SaEncapMode,
        l2tp: bool,
        is_rekey: bool,
        now: Instant,
    ) -> EngineResult<Phase2Key> {
        let ph1 = self
            .registry
            .established_phase1(skey)
            .ok_or_else(|| EngineError::NoHandle(0))?;
        let remote_cfg = self
            .registry
            .phase1(ph1)
            .map(|p| Arc::clone(&p.remote))
            .ok_or(EngineError::NoHandle(0))?;
        let remote = self
            .registry
            .session(skey)
            .map(|s| s.endpoints.remote)
            .ok_or_else(|| EngineError::NoHandle(0))?;

        let msgid = self.next_msgid();
        let mut phase2 = Phase2::new_initiator(skey, spid, msgid, proposal, encap, l2tp, remote_cfg, now);
        phase2.is_rekey = is_rekey;
        phase2.park_for_spi()?;
        let key = self.registry.link_phase2(skey, phase2);
        self.registry.bind_phase2(key, ph1)?;

        let seq = self.gateway.submit(SadbRequest::GetSpi { remote });
        self.pending_sadb.insert(seq, SadbOwner::Phase2Spi(key));
        self.notify(ControlNotify::PhaseStart {
            phase: NotifyPhase::Phase2,
            remote,
        });
        debug!(phase2 = %key.tag(), %remote, spid, rekey = is_rekey, "phase2 started");
        Ok(key)
    }

    // ─── Teardown paths ──────────────────────────────────────────────

    fn send_phase1_delete(&mut self, key: Phase1Key) {
        let (icookie, rcookie, skey, established) = match self.registry.phase1(key) {
            Some(p1) => (
                p1.initiator_cookie,
                p1.responder_cookie,
                p1.session,
                p1.is_established(),
            ),
            None => return,
        };
        if !established {
            return;
        }
        let remote = match self.registry.session(skey) {
            Some(s) => s.endpoints.remote,
            None => return,
        };
        let mut spi = Vec::with_capacity(16);
        spi.extend_from_slice(&icookie);
        spi.extend_from_slice(&rcookie);
        let msgid = self.next_msgid();
        let msg = IsakmpMessage::new(
            IsakmpHeader {
                initiator_cookie: icookie,
                responder_cookie: rcookie,
                exchange: ExchangeType::Informational,
                flags: 0,
                message_id: msgid,
            },
            vec![Payload::Delete(DeletePayload::new(PROTO_ISAKMP, vec![spi]))],
        );
        self.send(remote, msg);
    }

    fn send_phase2_delete(&mut self, key: Phase2Key) {
        let (skey, local_spi, bind) = match self.registry.phase2(key) {
            Some(p2) => (p2.session, p2.local_spi, p2.ph1bind),
            None => return,
        };
        let spi = match local_spi {
            Some(s) => s,
            None => return,
        };
        let remote = match self.registry.session(skey) {
            Some(s) => s.endpoints.remote,
            None => return,
        };
        let (icookie, rcookie) = match bind.and_then(|b| self.registry.phase1(b)) {
            Some(p1) => (p1.initiator_cookie, p1.responder_cookie),
            None => ([0u8; 8], [0u8; 8]),
        };
        let msgid = self.next_msgid();
        let msg = IsakmpMessage::new(
            IsakmpHeader {
                initiator_cookie: icookie,
                responder_cookie: rcookie,
                exchange: ExchangeType::Informational,
                flags: 0,
                message_id: msgid,
            },
            vec![Payload::Delete(DeletePayload::new(
                PROTO_ESP,
                vec![spi.to_be_bytes().to_vec()],
            ))],
        );
        // Peer-facing notify only; the kernel delete happens on expiry.
        self.send(remote, msg);
    }

    /// Expire a Phase 1: cancel every timer it holds, unlink it (its
    /// children rebind to the best survivor), and retire the session if
    /// this emptied it.
    fn expire_phase1(&mut self, key: Phase1Key, reason: TerminationReason, now: Instant) {
        let timers = match self.registry.phase1_mut(key) {
            Some(p1) => {
                p1.state = crate::phase1::Phase1State::Expired;
                p1.take_timers()
            }
            None => return,
        };
        for token in timers {
            self.sched.cancel(token);
        }
        if let Some(unlinked) = self.registry.unlink_phase1(key) {
            debug!(phase1 = %key.tag(), ?reason, "phase1 expired");
            drop(unlinked.handle);
            if let Some(skey) = unlinked.session_emptied {
                self.finish_session(skey, reason, now);
            }
        }
    }

    /// Expire a Phase 2: cancel timers, remove its kernel SA if one was
    /// installed, unlink it.
    fn expire_phase2(&mut self, key: Phase2Key, reason: TerminationReason, now: Instant) {
        let (timers, installed_spi, skey) = match self.registry.phase2_mut(key) {
            Some(p2) => {
                let was_installed = matches!(
                    p2.state,
                    crate::phase2::Phase2State::AddSa | crate::phase2::Phase2State::Established
                );
                p2.state = crate::phase2::Phase2State::Expired;
                (
                    p2.take_timers(),
                    p2.local_spi.filter(|_| was_installed),
                    p2.session,
                )
            }
            None => return,
        };
        for token in timers {
            self.sched.cancel(token);
        }
        if let Some(spi) = installed_spi {
            if let Some(remote) = self.registry.session(skey).map(|s| s.endpoints.remote) {
                let seq = self.gateway.submit(SadbRequest::Delete { spi, remote });
                self.pending_sadb.insert(seq, SadbOwner::FireAndForget);
            }
        }
        if let Some(unlinked) = self.registry.unlink_phase2(key) {
            debug!(phase2 = %key.tag(), ?reason, "phase2 expired");
            drop(unlinked.handle);
            if let Some(skey) = unlinked.session_emptied {
                self.finish_session(skey, reason, now);
            }
        }
    }

    /// Tear a whole session down deliberately: deletes toward the peer
    /// and the kernel for everything live, then handle expiry.
    pub fn cleanup_session(&mut self, skey: SessionKey, reason: TerminationReason, now: Instant) {
        if let Some(session) = self.registry.session_mut(skey) {
            if session.termination.is_none() {
                session.termination = Some(reason);
            }
        } else {
            return;
        }

        let phase2s = self
            .registry
            .session(skey)
            .map(|s| s.phase2s.clone())
            .unwrap_or_default();
        for key in phase2s {
            self.send_phase2_delete(key);
            self.expire_phase2(key, reason, now);
        }
        let phase1s = self
            .registry
            .session(skey)
            .map(|s| s.phase1s.clone())
            .unwrap_or_default();
        for key in phase1s {
            self.send_phase1_delete(key);
            self.expire_phase1(key, reason, now);
        }
        // Sessions with no handles never hit the emptied path above.
        if self.registry.session(skey).is_some() {
            self.finish_session(skey, reason, now);
        }
    }

    /// Final session bookkeeping once both active counts reached zero.
    fn finish_session(&mut self, skey: SessionKey, reason: TerminationReason, now: Instant) {
        let (remote, timers, reason) = match self.registry.session_mut(skey) {
            Some(session) => {
                session.stopped_at = Some(now);
                let reason = *session.termination.get_or_insert(reason);
                let timers: Vec<_> = [session.sample_timer.take(), session.idle_timer.take()]
                    .into_iter()
                    .flatten()
                    .collect();
                (session.endpoints.remote, timers, reason)
            }
            None => return,
        };
        for token in timers {
            self.sched.cancel(token);
        }
        self.registry.remove_session(skey);
        info!(%remote, ?reason, "session removed");
        self.emit(IkeEvent::SessionClosed { remote, reason });
    }

    /// Orderly shutdown: tear down every session.
    pub fn shutdown(&mut self, now: Instant) {
        for skey in self.registry.session_keys() {
            self.cleanup_session(skey, TerminationReason::Shutdown, now);
        }
    }
}
