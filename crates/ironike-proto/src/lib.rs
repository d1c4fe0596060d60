//! ironike protocol support
//!
//! This crate carries everything the keying engine consumes but does not
//! own: the ISAKMP header/message model, well-known protocol constants,
//! per-peer negotiation policy types, and the crypto collaborator that
//! produces and validates the opaque handshake material.
//!
//! Payload *bodies* are deliberately semi-opaque. The engine routes on
//! the 28-byte header and the payload chain structure; the cryptographic
//! meaning of SA/KE/Nonce/Hash bodies lives behind [`crypto::CryptoBackend`].

pub mod constants;
pub mod crypto;
pub mod message;
pub mod policy;
pub mod software;

pub use constants::{ExchangeType, NattVersion, NotifyType, PayloadType};
pub use crypto::{CryptoBackend, CryptoError, DhKeyPair, KeyMaterial};
pub use message::{DeletePayload, IsakmpHeader, IsakmpMessage, NotifyPayload, Payload};
pub use policy::{DpdAlgorithm, DpdPolicy, ExchangeMode, IdleDirection, IdlePolicy, RemoteConfig};

use software::SoftwareBackend;

/// Select the crypto backend for this build.
///
/// Only the software backend exists today; the indirection keeps the
/// engine ignorant of which one it got.
pub fn select_backend() -> Box<dyn CryptoBackend> {
    Box::new(SoftwareBackend::new())
}

/// Errors from the message model.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// Datagram shorter than the fixed ISAKMP header
    #[error("truncated message: {0} bytes, need at least {1}")]
    Truncated(usize, usize),

    /// Major version field is not ISAKMP v1
    #[error("unsupported ISAKMP version 0x{0:02x}")]
    BadVersion(u8),

    /// Exchange type octet not known to this implementation
    #[error("unknown exchange type {0}")]
    UnknownExchange(u8),

    /// A payload length field points past the end of the message
    #[error("payload overruns message: offset {0}, claimed length {1}")]
    PayloadOverrun(usize, u16),

    /// A payload length field is below the generic header size
    #[error("payload length {0} below generic header size")]
    PayloadUnderrun(u16),

    /// Header length field disagrees with the datagram size
    #[error("header claims {0} bytes, datagram has {1}")]
    LengthMismatch(u32, usize),

    /// Structured payload body (notify/delete) malformed
    #[error("malformed {0} payload body")]
    MalformedBody(&'static str),
}
