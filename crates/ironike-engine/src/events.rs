//! Structured engine events.
//!
//! Fire-and-forget: sinks never affect control flow. The daemon
//! installs [`LogSink`]; tests install a recording sink to assert on
//! what the engine reported.

use std::net::SocketAddr;

use serde::Serialize;

use crate::session::TerminationReason;

/// Which phase an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Phase1,
    Phase2,
}

/// Everything the engine reports about its own progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IkeEvent {
    PacketTx { remote: SocketAddr, ok: bool },
    PacketRx { remote: SocketAddr, ok: bool },
    PhaseSuccess { kind: PhaseKind, remote: SocketAddr },
    PhaseFail {
        kind: PhaseKind,
        remote: SocketAddr,
        reason: &'static str,
    },
    PhaseDrop { kind: PhaseKind, remote: SocketAddr },
    AuthSuccess { remote: SocketAddr },
    AuthFail { remote: SocketAddr },
    SessionClosed {
        remote: SocketAddr,
        reason: TerminationReason,
    },
}

/// Event consumer. Must never block or fail the caller.
pub trait EventSink: Send {
    fn notify(&mut self, event: &IkeEvent);
}

/// Sink that writes tracing lines.
pub struct LogSink;

impl EventSink for LogSink {
    fn notify(&mut self, event: &IkeEvent) {
        match event {
            IkeEvent::PacketTx { remote, ok } if !ok => {
                tracing::debug!(%remote, "packet send failed")
            }
            IkeEvent::PacketRx { remote, ok } if !ok => {
                tracing::debug!(%remote, "packet receive failed")
            }
            IkeEvent::PacketTx { .. } | IkeEvent::PacketRx { .. } => {}
            IkeEvent::PhaseSuccess { kind, remote } => {
                tracing::info!(?kind, %remote, "phase established")
            }
            IkeEvent::PhaseFail { kind, remote, reason } => {
                tracing::warn!(?kind, %remote, reason, "phase failed")
            }
            IkeEvent::PhaseDrop { kind, remote } => {
                tracing::debug!(?kind, %remote, "message dropped")
            }
            IkeEvent::AuthSuccess { remote } => tracing::info!(%remote, "peer authenticated"),
            IkeEvent::AuthFail { remote } => tracing::warn!(%remote, "peer authentication failed"),
            IkeEvent::SessionClosed { remote, reason } => {
                tracing::info!(%remote, ?reason, "session closed")
            }
        }
    }
}

/// Sink that drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn notify(&mut self, _event: &IkeEvent) {}
}
