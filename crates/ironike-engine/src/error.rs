//! Engine error types

use std::net::SocketAddr;

/// Errors that can occur in the keying engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A state-machine step ran against the wrong predecessor state
    #[error("state mismatch: expected {expected}, handle is in {actual}")]
    StateMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// A required payload was absent from the peer's message
    #[error("missing {0} payload")]
    MissingPayload(&'static str),

    /// Peer authentication hash/signature did not verify
    #[error("authentication failed")]
    AuthFailed,

    /// Attempt to bind a Phase 2 to a Phase 1 of a different session
    #[error("cross-session phase1 bind rejected")]
    CrossSessionBind,

    /// No session resolvable for the endpoint pair
    #[error("no session for {0}")]
    NoSession(SocketAddr),

    /// No negotiation handle matches the message
    #[error("no negotiation matches message id {0:#x}")]
    NoHandle(u32),

    /// Peer offered nothing we accept
    #[error("no proposal chosen for {0}")]
    NoProposalChosen(SocketAddr),

    /// No configured policy covers the peer
    #[error("no remote policy for {0}")]
    NoPolicy(SocketAddr),

    /// Dead peer detection exhausted its probe budget
    #[error("peer {0} presumed dead")]
    PeerDead(SocketAddr),

    /// Crypto collaborator failure
    #[error("crypto: {0}")]
    Crypto(#[from] ironike_proto::CryptoError),

    /// Message model failure
    #[error("protocol: {0}")]
    Proto(#[from] ironike_proto::ProtoError),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
