//! ISAKMP / IKEv1 protocol constants (RFC 2408, RFC 2409, RFC 3706, RFC 3947)

/// Well-known ISAKMP UDP port.
pub const ISAKMP_PORT: u16 = 500;

/// NAT-Traversal floated UDP port (RFC 3947).
pub const ISAKMP_NATT_PORT: u16 = 4500;

/// ISAKMP major/minor version octet: v1.0.
pub const ISAKMP_VERSION: u8 = 0x10;

/// Fixed ISAKMP header size.
pub const ISAKMP_HEADER_LEN: usize = 28;

/// Generic payload header size (next-payload, reserved, length).
pub const GENERIC_PAYLOAD_HEADER_LEN: usize = 4;

/// IPSEC DOI number carried in notify/delete payloads.
pub const IPSEC_DOI: u32 = 1;

/// Exchange types (RFC 2408 section 3.1 plus the IPSEC DOI additions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExchangeType {
    /// Base exchange (1) — accepted on the wire, never initiated here
    Base = 1,
    /// Identity Protection, i.e. Main Mode (2)
    IdentityProtection = 2,
    /// Authentication Only (3)
    AuthOnly = 3,
    /// Aggressive Mode (4)
    Aggressive = 4,
    /// Informational (5)
    Informational = 5,
    /// Quick Mode (32, IPSEC DOI)
    QuickMode = 32,
    /// New Group Mode (33, IPSEC DOI)
    NewGroup = 33,
    /// ISAKMP transaction exchange for ModeConfig/XAUTH (6)
    Transaction = 6,
}

impl ExchangeType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ExchangeType::Base),
            2 => Some(ExchangeType::IdentityProtection),
            3 => Some(ExchangeType::AuthOnly),
            4 => Some(ExchangeType::Aggressive),
            5 => Some(ExchangeType::Informational),
            6 => Some(ExchangeType::Transaction),
            32 => Some(ExchangeType::QuickMode),
            33 => Some(ExchangeType::NewGroup),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Does this exchange negotiate a Phase 1 SA?
    pub fn is_phase1(self) -> bool {
        matches!(
            self,
            ExchangeType::IdentityProtection | ExchangeType::Aggressive | ExchangeType::Base
        )
    }
}

/// Payload type tags (RFC 2408 section 3.1, RFC 3947 NAT payloads).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    None = 0,
    Sa = 1,
    Proposal = 2,
    Transform = 3,
    KeyExchange = 4,
    Identification = 5,
    Certificate = 6,
    CertRequest = 7,
    Hash = 8,
    Signature = 9,
    Nonce = 10,
    Notification = 11,
    Delete = 12,
    VendorId = 13,
    Attributes = 14,
    NatDiscovery = 20,
    NatOriginalAddress = 21,
}

impl PayloadType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PayloadType::None),
            1 => Some(PayloadType::Sa),
            2 => Some(PayloadType::Proposal),
            3 => Some(PayloadType::Transform),
            4 => Some(PayloadType::KeyExchange),
            5 => Some(PayloadType::Identification),
            6 => Some(PayloadType::Certificate),
            7 => Some(PayloadType::CertRequest),
            8 => Some(PayloadType::Hash),
            9 => Some(PayloadType::Signature),
            10 => Some(PayloadType::Nonce),
            11 => Some(PayloadType::Notification),
            12 => Some(PayloadType::Delete),
            13 => Some(PayloadType::VendorId),
            14 => Some(PayloadType::Attributes),
            20 => Some(PayloadType::NatDiscovery),
            21 => Some(PayloadType::NatOriginalAddress),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Notify message types the engine acts on (RFC 2408 section 3.14.1,
/// DPD codes from RFC 3706 section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum NotifyType {
    InvalidCookie = 4,
    InvalidExchangeType = 7,
    InvalidSpi = 11,
    NoProposalChosen = 14,
    PayloadMalformed = 16,
    InvalidKeyInformation = 17,
    InvalidIdInformation = 18,
    AuthenticationFailed = 24,
    /// INITIAL-CONTACT (IPSEC DOI status)
    InitialContact = 24578,
    /// RESPONDER-LIFETIME (IPSEC DOI status)
    ResponderLifetime = 24576,
    /// DPD R-U-THERE probe
    RUThere = 36136,
    /// DPD R-U-THERE-ACK response
    RUThereAck = 36137,
}

impl NotifyType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            4 => Some(NotifyType::InvalidCookie),
            7 => Some(NotifyType::InvalidExchangeType),
            11 => Some(NotifyType::InvalidSpi),
            14 => Some(NotifyType::NoProposalChosen),
            16 => Some(NotifyType::PayloadMalformed),
            17 => Some(NotifyType::InvalidKeyInformation),
            18 => Some(NotifyType::InvalidIdInformation),
            24 => Some(NotifyType::AuthenticationFailed),
            24578 => Some(NotifyType::InitialContact),
            24576 => Some(NotifyType::ResponderLifetime),
            36136 => Some(NotifyType::RUThere),
            36137 => Some(NotifyType::RUThereAck),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// NAT-Traversal draft/RFC generations, newest preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NattVersion {
    Draft02,
    Draft03,
    Rfc3947,
}

/// Vendor ID bodies the capability scan matches against.
pub mod vendor {
    /// RFC 3706 Dead Peer Detection
    pub const DPD: [u8; 16] = [
        0xaf, 0xca, 0xd7, 0x13, 0x68, 0xa1, 0xf1, 0xc9, 0x6b, 0x86, 0x96, 0xfc, 0x77, 0x57, 0x01,
        0x00,
    ];

    /// MD5("RFC 3947") — final NAT-T
    pub const NATT_RFC3947: [u8; 16] = [
        0x4a, 0x13, 0x1c, 0x81, 0x07, 0x03, 0x58, 0x45, 0x5c, 0x57, 0x28, 0xf2, 0x0e, 0x95, 0x45,
        0x2f,
    ];

    /// draft-ietf-ipsec-nat-t-ike-02\n
    pub const NATT_DRAFT02: [u8; 16] = [
        0x90, 0xcb, 0x80, 0x91, 0x3e, 0xbb, 0x69, 0x6e, 0x08, 0x63, 0x81, 0xb5, 0xec, 0x42, 0x7b,
        0x1f,
    ];

    /// draft-ietf-ipsec-nat-t-ike-03
    pub const NATT_DRAFT03: [u8; 16] = [
        0x7d, 0x94, 0x19, 0xa6, 0x53, 0x10, 0xca, 0x6f, 0x2c, 0x17, 0x9d, 0x92, 0x15, 0x52, 0x9d,
        0x56,
    ];

    /// IKE fragmentation capability
    pub const FRAGMENTATION: [u8; 16] = [
        0x40, 0x48, 0xb7, 0xd5, 0x6e, 0xbc, 0xe8, 0x85, 0x25, 0xe7, 0xde, 0x7f, 0x00, 0xd6, 0xc2,
        0xd3,
    ];

    /// XAUTH (draft-beaulieu-ike-xauth)
    pub const XAUTH: [u8; 8] = [0x09, 0x00, 0x26, 0x89, 0xdf, 0xd6, 0xb7, 0x12];

    /// Cisco Unity
    pub const UNITY: [u8; 16] = [
        0x12, 0xf5, 0xf2, 0x8c, 0x45, 0x71, 0x68, 0xa9, 0x70, 0x2d, 0x9f, 0xe2, 0x74, 0xcc, 0x01,
        0x00,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_type_round_trip() {
        for raw in [1u8, 2, 3, 4, 5, 6, 32, 33] {
            let et = ExchangeType::from_u8(raw).unwrap();
            assert_eq!(et.to_u8(), raw);
        }
        assert!(ExchangeType::from_u8(99).is_none());
    }

    #[test]
    fn phase1_exchanges() {
        assert!(ExchangeType::IdentityProtection.is_phase1());
        assert!(ExchangeType::Aggressive.is_phase1());
        assert!(!ExchangeType::QuickMode.is_phase1());
        assert!(!ExchangeType::Informational.is_phase1());
    }

    #[test]
    fn natt_version_ordering() {
        assert!(NattVersion::Rfc3947 > NattVersion::Draft03);
        assert!(NattVersion::Draft03 > NattVersion::Draft02);
    }

    #[test]
    fn dpd_notify_codes() {
        assert_eq!(NotifyType::RUThere.to_u16(), 36136);
        assert_eq!(NotifyType::from_u16(36137), Some(NotifyType::RUThereAck));
    }
}
