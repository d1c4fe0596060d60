//! ISAKMP message model: fixed header codec plus the generic payload
//! chain walk.
//!
//! The engine routes on header fields (cookies, exchange type, message
//! id) and on which payload types are present. Payload bodies stay
//! opaque byte vectors except the three the lifecycle contract needs
//! structure from: Notification, Delete, and VendorId.

use crate::constants::{
    ExchangeType, NotifyType, PayloadType, GENERIC_PAYLOAD_HEADER_LEN, ISAKMP_HEADER_LEN,
    ISAKMP_VERSION,
};
use crate::ProtoError;

/// Header flag bits (RFC 2408 section 3.1).
pub mod flags {
    pub const ENCRYPTED: u8 = 0x01;
    pub const COMMIT: u8 = 0x02;
    pub const AUTH_ONLY: u8 = 0x04;
}

/// The fixed 28-byte ISAKMP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsakmpHeader {
    pub initiator_cookie: [u8; 8],
    pub responder_cookie: [u8; 8],
    pub exchange: ExchangeType,
    pub flags: u8,
    pub message_id: u32,
}

impl IsakmpHeader {
    /// Decode the header and return it with the total message length the
    /// peer claimed.
    pub fn decode(buf: &[u8]) -> Result<(Self, u32), ProtoError> {
        if buf.len() < ISAKMP_HEADER_LEN {
            return Err(ProtoError::Truncated(buf.len(), ISAKMP_HEADER_LEN));
        }
        let version = buf[17];
        if version != ISAKMP_VERSION {
            return Err(ProtoError::BadVersion(version));
        }
        let exchange =
            ExchangeType::from_u8(buf[18]).ok_or(ProtoError::UnknownExchange(buf[18]))?;

        let mut initiator_cookie = [0u8; 8];
        initiator_cookie.copy_from_slice(&buf[0..8]);
        let mut responder_cookie = [0u8; 8];
        responder_cookie.copy_from_slice(&buf[8..16]);

        let message_id = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);
        let length = u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]);

        Ok((
            IsakmpHeader {
                initiator_cookie,
                responder_cookie,
                exchange,
                flags: buf[19],
                message_id,
            },
            length,
        ))
    }

    fn encode_into(&self, first_payload: u8, total_len: u32, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.initiator_cookie);
        out.extend_from_slice(&self.responder_cookie);
        out.push(first_payload);
        out.push(ISAKMP_VERSION);
        out.push(self.exchange.to_u8());
        out.push(self.flags);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&total_len.to_be_bytes());
    }

    /// Short hex fingerprint of the cookie pair, for log lines.
    pub fn cookie_tag(&self) -> String {
        format!(
            "{}:{}",
            hex::encode(&self.initiator_cookie[..4]),
            hex::encode(&self.responder_cookie[..4])
        )
    }
}

/// Structured body of a Notification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    pub doi: u32,
    pub protocol: u8,
    pub spi: Vec<u8>,
    /// Raw notify code; [`NotifyPayload::notify_type`] maps the known ones.
    pub code: u16,
    pub data: Vec<u8>,
}

impl NotifyPayload {
    pub fn new(code: NotifyType) -> Self {
        NotifyPayload {
            doi: crate::constants::IPSEC_DOI,
            protocol: 1,
            spi: Vec::new(),
            code: code.to_u16(),
            data: Vec::new(),
        }
    }

    pub fn with_spi(code: NotifyType, spi: Vec<u8>) -> Self {
        NotifyPayload {
            spi,
            ..NotifyPayload::new(code)
        }
    }

    pub fn notify_type(&self) -> Option<NotifyType> {
        NotifyType::from_u16(self.code)
    }

    fn decode(body: &[u8]) -> Result<Self, ProtoError> {
        if body.len() < 8 {
            return Err(ProtoError::MalformedBody("notification"));
        }
        let doi = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let protocol = body[4];
        let spi_len = body[5] as usize;
        let code = u16::from_be_bytes([body[6], body[7]]);
        if body.len() < 8 + spi_len {
            return Err(ProtoError::MalformedBody("notification"));
        }
        Ok(NotifyPayload {
            doi,
            protocol,
            spi: body[8..8 + spi_len].to_vec(),
            code,
            data: body[8 + spi_len..].to_vec(),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.spi.len() + self.data.len());
        out.extend_from_slice(&self.doi.to_be_bytes());
        out.push(self.protocol);
        out.push(self.spi.len() as u8);
        out.extend_from_slice(&self.code.to_be_bytes());
        out.extend_from_slice(&self.spi);
        out.extend_from_slice(&self.data);
        out
    }
}

/// Structured body of a Delete payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    pub doi: u32,
    pub protocol: u8,
    pub spis: Vec<Vec<u8>>,
}

impl DeletePayload {
    pub fn new(protocol: u8, spis: Vec<Vec<u8>>) -> Self {
        DeletePayload {
            doi: crate::constants::IPSEC_DOI,
            protocol,
            spis,
        }
    }

    fn decode(body: &[u8]) -> Result<Self, ProtoError> {
        if body.len() < 8 {
            return Err(ProtoError::MalformedBody("delete"));
        }
        let doi = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let protocol = body[4];
        let spi_len = body[5] as usize;
        let count = u16::from_be_bytes([body[6], body[7]]) as usize;
        if body.len() < 8 + spi_len * count {
            return Err(ProtoError::MalformedBody("delete"));
        }
        let mut spis = Vec::with_capacity(count);
        for i in 0..count {
            spis.push(body[8 + i * spi_len..8 + (i + 1) * spi_len].to_vec());
        }
        Ok(DeletePayload { doi, protocol, spis })
    }

    fn encode(&self) -> Vec<u8> {
        let spi_len = self.spis.first().map(|s| s.len()).unwrap_or(0);
        let mut out = Vec::with_capacity(8 + spi_len * self.spis.len());
        out.extend_from_slice(&self.doi.to_be_bytes());
        out.push(self.protocol);
        out.push(spi_len as u8);
        out.extend_from_slice(&(self.spis.len() as u16).to_be_bytes());
        for spi in &self.spis {
            out.extend_from_slice(spi);
        }
        out
    }
}

/// One payload in the chain. Bodies without structural meaning to the
/// engine stay as raw bytes for the crypto collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Sa(Vec<u8>),
    KeyExchange(Vec<u8>),
    Identification(Vec<u8>),
    Certificate(Vec<u8>),
    CertRequest(Vec<u8>),
    Hash(Vec<u8>),
    Signature(Vec<u8>),
    Nonce(Vec<u8>),
    Notification(NotifyPayload),
    Delete(DeletePayload),
    VendorId(Vec<u8>),
    Attributes(Vec<u8>),
    NatDiscovery(Vec<u8>),
    NatOriginalAddress(Vec<u8>),
}

impl Payload {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Payload::Sa(_) => PayloadType::Sa,
            Payload::KeyExchange(_) => PayloadType::KeyExchange,
            Payload::Identification(_) => PayloadType::Identification,
            Payload::Certificate(_) => PayloadType::Certificate,
            Payload::CertRequest(_) => PayloadType::CertRequest,
            Payload::Hash(_) => PayloadType::Hash,
            Payload::Signature(_) => PayloadType::Signature,
            Payload::Nonce(_) => PayloadType::Nonce,
            Payload::Notification(_) => PayloadType::Notification,
            Payload::Delete(_) => PayloadType::Delete,
            Payload::VendorId(_) => PayloadType::VendorId,
            Payload::Attributes(_) => PayloadType::Attributes,
            Payload::NatDiscovery(_) => PayloadType::NatDiscovery,
            Payload::NatOriginalAddress(_) => PayloadType::NatOriginalAddress,
        }
    }

    fn body(&self) -> Vec<u8> {
        match self {
            Payload::Notification(n) => n.encode(),
            Payload::Delete(d) => d.encode(),
            Payload::Sa(b)
            | Payload::KeyExchange(b)
            | Payload::Identification(b)
            | Payload::Certificate(b)
            | Payload::CertRequest(b)
            | Payload::Hash(b)
            | Payload::Signature(b)
            | Payload::Nonce(b)
            | Payload::VendorId(b)
            | Payload::Attributes(b)
            | Payload::NatDiscovery(b)
            | Payload::NatOriginalAddress(b) => b.clone(),
        }
    }

    fn from_raw(ptype: PayloadType, body: &[u8]) -> Result<Option<Self>, ProtoError> {
        Ok(Some(match ptype {
            PayloadType::Sa => Payload::Sa(body.to_vec()),
            PayloadType::KeyExchange => Payload::KeyExchange(body.to_vec()),
            PayloadType::Identification => Payload::Identification(body.to_vec()),
            PayloadType::Certificate => Payload::Certificate(body.to_vec()),
            PayloadType::CertRequest => Payload::CertRequest(body.to_vec()),
            PayloadType::Hash => Payload::Hash(body.to_vec()),
            PayloadType::Signature => Payload::Signature(body.to_vec()),
            PayloadType::Nonce => Payload::Nonce(body.to_vec()),
            PayloadType::Notification => Payload::Notification(NotifyPayload::decode(body)?),
            PayloadType::Delete => Payload::Delete(DeletePayload::decode(body)?),
            PayloadType::VendorId => Payload::VendorId(body.to_vec()),
            PayloadType::Attributes => Payload::Attributes(body.to_vec()),
            PayloadType::NatDiscovery => Payload::NatDiscovery(body.to_vec()),
            PayloadType::NatOriginalAddress => Payload::NatOriginalAddress(body.to_vec()),
            // Proposal/Transform only occur nested inside SA bodies,
            // which we keep opaque; a top-level one is skipped.
            PayloadType::Proposal | PayloadType::Transform | PayloadType::None => return Ok(None),
        }))
    }
}

/// A decoded ISAKMP message: header plus payload chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsakmpMessage {
    pub header: IsakmpHeader,
    pub payloads: Vec<Payload>,
}

impl IsakmpMessage {
    pub fn new(header: IsakmpHeader, payloads: Vec<Payload>) -> Self {
        IsakmpMessage { header, payloads }
    }

    /// Walk the generic payload chain of a datagram.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtoError> {
        let (header, claimed_len) = IsakmpHeader::decode(buf)?;
        if claimed_len as usize != buf.len() {
            return Err(ProtoError::LengthMismatch(claimed_len, buf.len()));
        }

        let mut payloads = Vec::new();
        let mut next = buf[16];
        let mut offset = ISAKMP_HEADER_LEN;

        while next != PayloadType::None.to_u8() {
            if buf.len() < offset + GENERIC_PAYLOAD_HEADER_LEN {
                return Err(ProtoError::Truncated(buf.len(), offset + GENERIC_PAYLOAD_HEADER_LEN));
            }
            let this_type = next;
            next = buf[offset];
            let plen = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]);
            if (plen as usize) < GENERIC_PAYLOAD_HEADER_LEN {
                return Err(ProtoError::PayloadUnderrun(plen));
            }
            if offset + plen as usize > buf.len() {
                return Err(ProtoError::PayloadOverrun(offset, plen));
            }
            let body = &buf[offset + GENERIC_PAYLOAD_HEADER_LEN..offset + plen as usize];
            if let Some(ptype) = PayloadType::from_u8(this_type) {
                if let Some(p) = Payload::from_raw(ptype, body)? {
                    payloads.push(p);
                }
            }
            // Unknown payload types are skipped, not fatal: the chain
            // framing still tells us where the next one starts.
            offset += plen as usize;
        }

        Ok(IsakmpMessage { header, payloads })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let bodies: Vec<(u8, Vec<u8>)> = self
            .payloads
            .iter()
            .map(|p| (p.payload_type().to_u8(), p.body()))
            .collect();

        let total: usize = ISAKMP_HEADER_LEN
            + bodies
                .iter()
                .map(|(_, b)| GENERIC_PAYLOAD_HEADER_LEN + b.len())
                .sum::<usize>();

        let mut out = Vec::with_capacity(total);
        let first = bodies.first().map(|(t, _)| *t).unwrap_or(0);
        self.header.encode_into(first, total as u32, &mut out);

        for (i, (_, body)) in bodies.iter().enumerate() {
            let next = bodies.get(i + 1).map(|(t, _)| *t).unwrap_or(0);
            out.push(next);
            out.push(0);
            out.extend_from_slice(&((GENERIC_PAYLOAD_HEADER_LEN + body.len()) as u16).to_be_bytes());
            out.extend_from_slice(body);
        }
        out
    }

    /// First payload of the given type, if present.
    pub fn find(&self, ptype: PayloadType) -> Option<&Payload> {
        self.payloads.iter().find(|p| p.payload_type() == ptype)
    }

    pub fn has(&self, ptype: PayloadType) -> bool {
        self.find(ptype).is_some()
    }

    /// All vendor-id bodies in the chain.
    pub fn vendor_ids(&self) -> impl Iterator<Item = &[u8]> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::VendorId(b) => Some(b.as_slice()),
            _ => None,
        })
    }

    /// All notification payloads in the chain.
    pub fn notifications(&self) -> impl Iterator<Item = &NotifyPayload> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::Notification(n) => Some(n),
            _ => None,
        })
    }
}
