//! Phase 2 (IPsec SA) negotiation handles.
//!
//! One `Phase2` per Quick Mode attempt. Informational and ModeConfig
//! exchanges are tracked with the same handle type (`Phase2Kind`) so
//! message ids have a single home, but only Quick Mode handles install
//! SAs or take part in supersede elections.
//!
//! Kernel interaction is asynchronous: a handle parks in `SpiWait`
//! until the PF_KEY SPI reply arrives and in `AddSa` until both
//! install acknowledgements come back.

use std::sync::Arc;
use std::time::Instant;

use ironike_proto::constants::ExchangeType;
use ironike_proto::message::{flags, IsakmpHeader, IsakmpMessage, Payload};
use ironike_proto::policy::RemoteConfig;
use ironike_proto::{CryptoBackend, KeyMaterial, PayloadType};

use crate::error::{EngineError, EngineResult};
use crate::phase1::Role;
use crate::sched::Token;
use crate::session::{Phase1Key, SessionKey};

/// What this handle negotiates (or merely tracks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase2Kind {
    QuickMode,
    Informational,
    ModeConfig,
}

/// Traffic encapsulation of the negotiated SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaEncapMode {
    Tunnel,
    Transport,
}

/// Phase 2 state ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase2State {
    Start,
    /// Parked awaiting the kernel's SPI reply.
    SpiWait,
    Msg1Sent,
    Msg2Received,
    Msg2Sent,
    /// Parked awaiting install acknowledgements.
    AddSa,
    Established,
    Expired,
}

impl Phase2State {
    pub fn is_established(self) -> bool {
        self == Phase2State::Established
    }

    pub fn is_negotiating(self) -> bool {
        !matches!(self, Phase2State::Established | Phase2State::Expired)
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase2State::Start => "start",
            Phase2State::SpiWait => "spi-wait",
            Phase2State::Msg1Sent => "msg1-sent",
            Phase2State::Msg2Received => "msg2-received",
            Phase2State::Msg2Sent => "msg2-sent",
            Phase2State::AddSa => "add-sa",
            Phase2State::Established => "established",
            Phase2State::Expired => "expired",
        }
    }
}

/// Phase 1 context a Quick Mode step runs under.
pub struct Ph1Context<'a> {
    pub initiator_cookie: [u8; 8],
    pub responder_cookie: [u8; 8],
    pub material: &'a KeyMaterial,
}

/// What a successful step asks the caller to do.
#[derive(Debug)]
pub struct Phase2Step {
    pub reply: Option<IsakmpMessage>,
    /// Submit inbound+outbound installs now.
    pub install: bool,
}

/// One IPsec-SA negotiation attempt (or tracked exchange).
pub struct Phase2 {
    pub session: SessionKey,
    /// Mutable binding to the covering Phase 1; survives Phase 1 rekey
    /// by being rebound.
    pub ph1bind: Option<Phase1Key>,
    pub kind: Phase2Kind,
    pub role: Role,
    pub state: Phase2State,

    /// Quick Mode message id.
    pub msgid: u32,
    /// Local policy id this negotiation satisfies.
    pub spid: u32,

    pub is_dying: bool,
    pub is_rekey: bool,
    pub retries_left: u32,
    pub remote: Arc<RemoteConfig>,

    /// Opaque proposal body; by convention its first four bytes carry
    /// the sender's SPI, the only part the lifecycle needs.
    pub proposal: Vec<u8>,
    pub approval: Option<Vec<u8>>,
    pub local_spi: Option<u32>,
    pub peer_spi: Option<u32>,

    pub encap: SaEncapMode,
    /// Traffic selector targets the L2TP port.
    pub l2tp: bool,

    nonce_local: Option<Vec<u8>>,

    /// Outstanding install acknowledgements.
    pub pending_installs: u8,

    pub last_sent: Option<IsakmpMessage>,

    pub retransmit_timer: Option<Token>,
    pub lifetime_timer: Option<Token>,
    pub teardown_timer: Option<Token>,

    pub created_at: Instant,
    pub established_at: Option<Instant>,
}

const NONCE_LEN: usize = 16;

/// Extract the conventional 4-byte SPI prefix from an opaque SA body.
fn spi_of(body: &[u8]) -> Option<u32> {
    if body.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
}

fn with_spi(spi: u32, rest: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + rest.len());
    out.extend_from_slice(&spi.to_be_bytes());
    out.extend_from_slice(rest);
    out
}

impl Phase2 {
    pub fn new_initiator(
        session: SessionKey,
        spid: u32,
        msgid: u32,
        proposal: Vec<u8>,
        encap: SaEncapMode,
        l2tp: bool,
        remote: Arc<RemoteConfig>,
        now: Instant,
    ) -> Self {
        Phase2 {
            session,
            ph1bind: None,
            kind: Phase2Kind::QuickMode,
            role: Role::Initiator,
            state: Phase2State::Start,
            msgid,
            spid,
            is_dying: false,
            is_rekey: false,
            retries_left: remote.retry_limit,
            remote,
            proposal,
            approval: None,
            local_spi: None,
            peer_spi: None,
            encap,
            l2tp,
            nonce_local: None,
            pending_installs: 0,
            last_sent: None,
            retransmit_timer: None,
            lifetime_timer: None,
            teardown_timer: None,
            created_at: now,
            established_at: None,
        }
    }

    pub fn new_responder(
        session: SessionKey,
        msgid: u32,
        remote: Arc<RemoteConfig>,
        now: Instant,
    ) -> Self {
        let mut p = Phase2::new_initiator(
            session,
            0,
            msgid,
            Vec::new(),
            SaEncapMode::Tunnel,
            false,
            remote,
            now,
        );
        p.role = Role::Responder;
        p
    }

    pub fn new_tracking(
        session: SessionKey,
        kind: Phase2Kind,
        msgid: u32,
        remote: Arc<RemoteConfig>,
        now: Instant,
    ) -> Self {
        let mut p = Phase2::new_responder(session, msgid, remote, now);
        p.kind = kind;
        p
    }

    pub fn is_established(&self) -> bool {
        self.state.is_established()
    }

    fn expect(&self, expected: Phase2State) -> EngineResult<()> {
        if self.state != expected {
            return Err(EngineError::StateMismatch {
                expected: expected.name(),
                actual: self.state.name(),
            });
        }
        Ok(())
    }

    fn header(&self, ph1: &Ph1Context<'_>) -> IsakmpHeader {
        IsakmpHeader {
            initiator_cookie: ph1.initiator_cookie,
            responder_cookie: ph1.responder_cookie,
            exchange: ExchangeType::QuickMode,
            flags: flags::ENCRYPTED,
            message_id: self.msgid,
        }
    }

    fn qm_hash(&self, ph1: &Ph1Context<'_>, crypto: &dyn CryptoBackend) -> Vec<u8> {
        crypto.auth_hash(ph1.material, &[&self.msgid.to_be_bytes(), b"quick"])
    }

    fn check_qm_hash(
        &self,
        msg: &IsakmpMessage,
        ph1: &Ph1Context<'_>,
        crypto: &dyn CryptoBackend,
    ) -> EngineResult<()> {
        let hash = match msg.find(PayloadType::Hash) {
            Some(Payload::Hash(h)) => h,
            _ => return Err(EngineError::MissingPayload("hash")),
        };
        if !crypto.verify_auth(ph1.material, &[&self.msgid.to_be_bytes(), b"quick"], hash) {
            return Err(EngineError::AuthFailed);
        }
        Ok(())
    }

    fn require_sa<'m>(msg: &'m IsakmpMessage) -> EngineResult<&'m [u8]> {
        match msg.find(PayloadType::Sa) {
            Some(Payload::Sa(b)) => Ok(b),
            _ => Err(EngineError::MissingPayload("SA")),
        }
    }

    /// Move a fresh handle into `SpiWait`; the engine submits the
    /// kernel SPI request alongside.
    pub fn park_for_spi(&mut self) -> EngineResult<()> {
        self.expect(Phase2State::Start)?;
        self.state = Phase2State::SpiWait;
        Ok(())
    }

    /// The kernel answered our SPI request. Produces QM1 (initiator)
    /// or QM2 (responder).
    pub fn on_spi(
        &mut self,
        spi: u32,
        ph1: &Ph1Context<'_>,
        crypto: &dyn CryptoBackend,
    ) -> EngineResult<Phase2Step> {
        self.expect(Phase2State::SpiWait)?;
        self.local_spi = Some(spi);

        match self.role {
            Role::Initiator => {
                self.nonce_local = Some(crypto.nonce(NONCE_LEN));
                let sa = with_spi(spi, &self.proposal);
                let msg = IsakmpMessage::new(
                    self.header(ph1),
                    vec![
                        Payload::Hash(self.qm_hash(ph1, crypto)),
                        Payload::Sa(sa),
                        Payload::Nonce(self.nonce_local.clone().unwrap()),
                    ],
                );
                self.state = Phase2State::Msg1Sent;
                self.last_sent = Some(msg.clone());
                Ok(Phase2Step {
                    reply: Some(msg),
                    install: false,
                })
            }
            Role::Responder => {
                self.nonce_local = Some(crypto.nonce(NONCE_LEN));
                let sa = with_spi(spi, self.approval.as_deref().unwrap_or(&[]));
                let msg = IsakmpMessage::new(
                    self.header(ph1),
                    vec![
                        Payload::Hash(self.qm_hash(ph1, crypto)),
                        Payload::Sa(sa),
                        Payload::Nonce(self.nonce_local.clone().unwrap()),
                    ],
                );
                self.state = Phase2State::Msg2Sent;
                self.last_sent = Some(msg.clone());
                Ok(Phase2Step {
                    reply: Some(msg),
                    install: false,
                })
            }
        }
    }

    /// Advance on a received Quick Mode message.
    pub fn on_message(
        &mut self,
        msg: &IsakmpMessage,
        ph1: &Ph1Context<'_>,
        crypto: &dyn CryptoBackend,
    ) -> EngineResult<Phase2Step> {
        match (self.role, self.state) {
            // Responder receives QM1.
            (Role::Responder, Phase2State::Start) => {
                self.check_qm_hash(msg, ph1, crypto)?;
                let offer = Self::require_sa(msg)?;
                self.peer_spi = spi_of(offer);
                // Approval mirrors the offer past its SPI prefix.
                self.approval = Some(offer.get(4..).unwrap_or(&[]).to_vec());
                self.proposal = offer.to_vec();
                self.state = Phase2State::SpiWait;
                Ok(Phase2Step {
                    reply: None,
                    install: false,
                })
            }

            // Initiator receives QM2.
            (Role::Initiator, Phase2State::Msg1Sent) => {
                self.check_qm_hash(msg, ph1, crypto)?;
                let approval = Self::require_sa(msg)?;
                self.peer_spi = spi_of(approval);
                self.approval = Some(approval.to_vec());
                self.state = Phase2State::Msg2Received;

                let ack = IsakmpMessage::new(
                    self.header(ph1),
                    vec![Payload::Hash(self.qm_hash(ph1, crypto))],
                );
                self.state = Phase2State::AddSa;
                self.pending_installs = 2;
                self.last_sent = Some(ack.clone());
                Ok(Phase2Step {
                    reply: Some(ack),
                    install: true,
                })
            }

            // Responder receives QM3.
            (Role::Responder, Phase2State::Msg2Sent) => {
                self.check_qm_hash(msg, ph1, crypto)?;
                self.state = Phase2State::AddSa;
                self.pending_installs = 2;
                Ok(Phase2Step {
                    reply: None,
                    install: true,
                })
            }

            (_, actual) => Err(EngineError::StateMismatch {
                expected: "a receive-ready rung",
                actual: actual.name(),
            }),
        }
    }

    /// One install acknowledgement arrived. Returns true when the SA
    /// pair is fully installed and the handle should establish.
    pub fn on_installed(&mut self) -> EngineResult<bool> {
        self.expect(Phase2State::AddSa)?;
        self.pending_installs = self.pending_installs.saturating_sub(1);
        Ok(self.pending_installs == 0)
    }

    /// All timer tokens this handle may hold, for teardown cancellation.
    pub fn take_timers(&mut self) -> Vec<Token> {
        [
            self.retransmit_timer.take(),
            self.lifetime_timer.take(),
            self.teardown_timer.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::session::{EndpointPair, Session};
    use ironike_proto::select_backend;

    fn fixtures() -> (SessionKey, Arc<RemoteConfig>, Box<dyn CryptoBackend>, KeyMaterial) {
        let mut sessions: Arena<Session> = Arena::new();
        let pair = EndpointPair::new(
            "10.0.0.1:500".parse().unwrap(),
            "10.0.0.2:500".parse().unwrap(),
        );
        let skey = sessions.insert(Session::new(pair, Instant::now()));
        let material = KeyMaterial::from_bytes(vec![0x55; 96]);
        (skey, Arc::new(RemoteConfig::default()), select_backend(), material)
    }

    fn ctx(material: &KeyMaterial) -> Ph1Context<'_> {
        Ph1Context {
            initiator_cookie: [1u8; 8],
            responder_cookie: [2u8; 8],
            material,
        }
    }

    #[test]
    fn quick_mode_full_exchange() {
        let (skey, remote, crypto, material) = fixtures();
        let now = Instant::now();
        let ph1 = ctx(&material);

        let mut initiator = Phase2::new_initiator(
            skey,
            7,
            0x1000,
            vec![0xab; 8],
            SaEncapMode::Tunnel,
            false,
            remote.clone(),
            now,
        );
        initiator.park_for_spi().unwrap();
        let qm1 = initiator
            .on_spi(0x11111111, &ph1, crypto.as_ref())
            .unwrap()
            .reply
            .unwrap();
        assert_eq!(initiator.state, Phase2State::Msg1Sent);

        let mut responder = Phase2::new_responder(skey, 0x1000, remote, now);
        let step = responder.on_message(&qm1, &ph1, crypto.as_ref()).unwrap();
        assert!(step.reply.is_none());
        assert_eq!(responder.state, Phase2State::SpiWait);
        assert_eq!(responder.peer_spi, Some(0x11111111));

        let qm2 = responder
            .on_spi(0x22222222, &ph1, crypto.as_ref())
            .unwrap()
            .reply
            .unwrap();
        assert_eq!(responder.state, Phase2State::Msg2Sent);

        let step = initiator.on_message(&qm2, &ph1, crypto.as_ref()).unwrap();
        let qm3 = step.reply.unwrap();
        assert!(step.install);
        assert_eq!(initiator.state, Phase2State::AddSa);
        assert_eq!(initiator.peer_spi, Some(0x22222222));

        let step = responder.on_message(&qm3, &ph1, crypto.as_ref()).unwrap();
        assert!(step.install);
        assert_eq!(responder.state, Phase2State::AddSa);

        // Install acks complete both sides.
        assert!(!initiator.on_installed().unwrap());
        assert!(initiator.on_installed().unwrap());
        assert!(!responder.on_installed().unwrap());
        assert!(responder.on_installed().unwrap());
    }

    #[test]
    fn bad_hash_rejected() {
        let (skey, remote, crypto, material) = fixtures();
        let wrong = KeyMaterial::from_bytes(vec![0x77; 96]);
        let now = Instant::now();

        let mut initiator = Phase2::new_initiator(
            skey,
            1,
            0x2000,
            vec![0; 4],
            SaEncapMode::Transport,
            true,
            remote.clone(),
            now,
        );
        initiator.park_for_spi().unwrap();
        let qm1 = initiator
            .on_spi(1, &ctx(&material), crypto.as_ref())
            .unwrap()
            .reply
            .unwrap();

        let mut responder = Phase2::new_responder(skey, 0x2000, remote, now);
        let err = responder
            .on_message(&qm1, &ctx(&wrong), crypto.as_ref())
            .unwrap_err();
        assert!(matches!(err, EngineError::AuthFailed));
        assert_eq!(responder.state, Phase2State::Start);
    }

    #[test]
    fn state_mismatch_rejected() {
        let (skey, remote, crypto, material) = fixtures();
        let now = Instant::now();
        let mut p = Phase2::new_initiator(
            skey,
            1,
            0x3000,
            vec![],
            SaEncapMode::Tunnel,
            false,
            remote,
            now,
        );
        // SPI reply without parking first.
        let err = p.on_spi(9, &ctx(&material), crypto.as_ref()).unwrap_err();
        assert!(matches!(err, EngineError::StateMismatch { .. }));
        assert_eq!(p.state, Phase2State::Start);
    }

    #[test]
    fn double_park_rejected() {
        let (skey, remote, _, _) = fixtures();
        let mut p = Phase2::new_initiator(
            skey,
            1,
            0x4000,
            vec![],
            SaEncapMode::Tunnel,
            false,
            remote,
            Instant::now(),
        );
        p.park_for_spi().unwrap();
        assert!(p.park_for_spi().is_err());
    }
}
