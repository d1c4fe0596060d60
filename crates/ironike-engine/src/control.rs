//! Control socket protocol.
//!
//! External controllers drive the daemon over a local TCP connection
//! exchanging NDJSON messages: one serde-tagged JSON object per line.
//! Commands flow in, status notifications flow out, keyed by the
//! remote peer address.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Commands a controller can issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Start (or restart) Phase 1 toward a configured peer.
    Connect { remote: SocketAddr },
    /// Tear the whole session down.
    Disconnect { remote: SocketAddr },
    /// Start a Quick Mode negotiation for a policy id.
    StartPhase2 { remote: SocketAddr, spid: u32 },
    /// Send a DPD probe immediately.
    StartDpd { remote: SocketAddr },
    /// Answer a pending XAUTH challenge.
    XauthAnswer {
        remote: SocketAddr,
        username: String,
        password: String,
    },
    /// Restrict notifications to this controller's peer address.
    Bind { remote: IpAddr },
    Unbind { remote: IpAddr },
    /// Force a rekey of the established Phase 1 (failover assert).
    Assert { remote: SocketAddr },
    /// Snapshot of live sessions.
    Status,
}

/// Which phase a notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyPhase {
    Phase1,
    Phase2,
}

/// Structured failure codes surfaced to controllers. Idle and DPD
/// teardowns are distinguished from user-initiated disconnects so
/// upstream accounting can separate failure from expected termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    PeerDead,
    IdleTimeout,
    AuthenticationFailed,
    NegotiationTimeout,
    NoProposalChosen,
    UserRequested,
    InternalError,
}

/// Notifications the daemon emits toward controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlNotify {
    PhaseStart {
        phase: NotifyPhase,
        remote: SocketAddr,
    },
    PhaseEstablished {
        phase: NotifyPhase,
        remote: SocketAddr,
        rekey: bool,
    },
    /// Peer requested extended authentication; a controller must
    /// answer with `XauthAnswer`.
    NeedAuthinfo { remote: SocketAddr },
    IkeFailed {
        remote: SocketAddr,
        code: FailureCode,
        reason: String,
    },
    Status {
        sessions: Vec<SessionStatus>,
    },
}

/// One row of the `Status` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub established: bool,
    pub is_client: bool,
    pub ports_floated: bool,
    pub active_phase1: u32,
    pub active_phase2: u32,
}

/// Encode a message as one NDJSON line.
pub fn encode_line<T: Serialize>(msg: &T) -> String {
    let mut line = serde_json::to_string(msg).expect("control messages serialize");
    line.push('\n');
    line
}

/// Decode one NDJSON line.
pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        let cmd = ControlCommand::StartPhase2 {
            remote: "10.0.0.2:500".parse().unwrap(),
            spid: 12,
        };
        let line = encode_line(&cmd);
        assert!(line.ends_with('\n'));
        let back: ControlCommand = decode_line(&line).unwrap();
        match back {
            ControlCommand::StartPhase2 { spid, .. } => assert_eq!(spid, 12),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn notify_round_trip() {
        let n = ControlNotify::IkeFailed {
            remote: "10.0.0.2:500".parse().unwrap(),
            code: FailureCode::PeerDead,
            reason: "dpd probes exhausted".into(),
        };
        let back: ControlNotify = decode_line(&encode_line(&n)).unwrap();
        match back {
            ControlNotify::IkeFailed { code, .. } => assert_eq!(code, FailureCode::PeerDead),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(decode_line::<ControlCommand>("{not json").is_err());
    }
}
