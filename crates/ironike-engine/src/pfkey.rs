//! PF_KEY gateway seam.
//!
//! The engine talks to the kernel security-association database
//! through a request/reply contract: every request gets a sequence
//! number, and replies arrive later as events carrying it. The wire
//! encoding of the kernel protocol lives behind the trait; the engine
//! never sees it.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::session::SessionKey;

/// Traffic direction of an SA or a statistics query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A request toward the kernel SADB.
#[derive(Debug, Clone)]
pub enum SadbRequest {
    /// Reserve a fresh SPI for an inbound SA.
    GetSpi { remote: SocketAddr },
    /// Install one direction of a negotiated SA pair.
    Install {
        direction: Direction,
        spi: u32,
        remote: SocketAddr,
        /// Opaque negotiated SA material.
        sa: Vec<u8>,
    },
    /// Remove an SA by SPI.
    Delete { spi: u32, remote: SocketAddr },
    /// Read the byte counters of a session's SAs in one direction.
    QueryStats {
        session: SessionKey,
        direction: Direction,
        remote: SocketAddr,
    },
}

/// A reply from the kernel SADB, correlated by sequence number.
#[derive(Debug, Clone)]
pub enum SadbReply {
    Spi { seq: u32, spi: u32 },
    Installed { seq: u32 },
    Deleted { seq: u32 },
    Stats {
        seq: u32,
        direction: Direction,
        /// `(spi, byte_count)` per live SA.
        entries: Vec<(u32, u64)>,
    },
    Failed { seq: u32, message: String },
}

impl SadbReply {
    pub fn seq(&self) -> u32 {
        match self {
            SadbReply::Spi { seq, .. }
            | SadbReply::Installed { seq }
            | SadbReply::Deleted { seq }
            | SadbReply::Stats { seq, .. }
            | SadbReply::Failed { seq, .. } => *seq,
        }
    }
}

/// The gateway the engine submits SADB work through. Replies are
/// polled once per event-loop turn.
pub trait SadbGateway: Send {
    /// Submit a request; returns its sequence number.
    fn submit(&mut self, request: SadbRequest) -> u32;

    /// Next pending reply, if any.
    fn poll_reply(&mut self) -> Option<SadbReply>;
}

/// Development gateway that acknowledges everything immediately,
/// synthesizing SPIs from its sequence counter. Lets the full keying
/// path run on hosts without a kernel SADB attachment.
pub struct LoopbackGateway {
    next_seq: u32,
    replies: VecDeque<SadbReply>,
}

impl LoopbackGateway {
    pub fn new() -> Self {
        LoopbackGateway {
            next_seq: 1,
            replies: VecDeque::new(),
        }
    }
}

impl Default for LoopbackGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl SadbGateway for LoopbackGateway {
    fn submit(&mut self, request: SadbRequest) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        let reply = match request {
            SadbRequest::GetSpi { .. } => SadbReply::Spi {
                seq,
                spi: 0x1000_0000 | seq,
            },
            SadbRequest::Install { .. } => SadbReply::Installed { seq },
            SadbRequest::Delete { .. } => SadbReply::Deleted { seq },
            SadbRequest::QueryStats { direction, .. } => SadbReply::Stats {
                seq,
                direction,
                entries: Vec::new(),
            },
        };
        self.replies.push_back(reply);
        seq
    }

    fn poll_reply(&mut self) -> Option<SadbReply> {
        self.replies.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_acks_in_order() {
        let mut gw = LoopbackGateway::new();
        let remote: SocketAddr = "10.0.0.2:500".parse().unwrap();
        let s1 = gw.submit(SadbRequest::GetSpi { remote });
        let s2 = gw.submit(SadbRequest::Delete { spi: 7, remote });
        assert_ne!(s1, s2);

        match gw.poll_reply().unwrap() {
            SadbReply::Spi { seq, spi } => {
                assert_eq!(seq, s1);
                assert_ne!(spi, 0);
            }
            other => panic!("expected Spi, got {:?}", other),
        }
        match gw.poll_reply().unwrap() {
            SadbReply::Deleted { seq } => assert_eq!(seq, s2),
            other => panic!("expected Deleted, got {:?}", other),
        }
        assert!(gw.poll_reply().is_none());
    }
}
