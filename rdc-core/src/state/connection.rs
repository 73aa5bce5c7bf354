//! Session connection state machine.
//!
//! Provides a `ConnectionState` enum that models the layered lifecycle
//! of a session, with validated transitions that return `Result`
//! instead of panicking.

use std::time::Instant;

use crate::error::{RdcError, Result};

// ── ConnectionState ──────────────────────────────────────────────

/// The current phase of a session.
///
/// ```text
///  Disconnected ─► TransportConnected ─► SessionConnected ─► SecurityEstablished
///       ▲                                                          │
///       │                                                          ▼
///       └──── Disconnecting ◄──────── Active ◄─────────────── Licensed
/// ```
///
/// Any state may fall back to `Disconnected` through
/// [`force_disconnect`](Self::force_disconnect).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection. Initial and terminal state.
    #[default]
    Disconnected,

    /// TCP up and X.224 connection confirmed.
    TransportConnected,

    /// MCS domain joined, virtual channels instantiated.
    SessionConnected,

    /// Client random delivered, cipher keys derived.
    SecurityEstablished,

    /// Licence exchange finished.
    Licensed,

    /// Capabilities confirmed; drawing traffic flows.
    Active {
        /// When the session last entered `Active`.
        since: Instant,
    },

    /// Teardown in progress.
    Disconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::TransportConnected => write!(f, "TransportConnected"),
            Self::SessionConnected => write!(f, "SessionConnected"),
            Self::SecurityEstablished => write!(f, "SecurityEstablished"),
            Self::Licensed => write!(f, "Licensed"),
            Self::Active { .. } => write!(f, "Active"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// How long the session has been `Active`.
    pub fn active_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Active { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Disconnected`.
    pub fn transport_connected(&mut self) -> Result<()> {
        match self {
            Self::Disconnected => {
                *self = Self::TransportConnected;
                Ok(())
            }
            _ => Err(RdcError::InvalidState(
                "cannot connect transport: not in Disconnected state",
            )),
        }
    }

    /// Valid from: `TransportConnected`.
    pub fn session_connected(&mut self) -> Result<()> {
        match self {
            Self::TransportConnected => {
                *self = Self::SessionConnected;
                Ok(())
            }
            _ => Err(RdcError::InvalidState(
                "cannot join session: transport not connected",
            )),
        }
    }

    /// Valid from: `SessionConnected`.
    pub fn security_established(&mut self) -> Result<()> {
        match self {
            Self::SessionConnected => {
                *self = Self::SecurityEstablished;
                Ok(())
            }
            _ => Err(RdcError::InvalidState(
                "cannot establish security: session not connected",
            )),
        }
    }

    /// Valid from: `SecurityEstablished`.
    pub fn licensed(&mut self) -> Result<()> {
        match self {
            Self::SecurityEstablished => {
                *self = Self::Licensed;
                Ok(())
            }
            _ => Err(RdcError::InvalidState(
                "cannot complete licensing: security not established",
            )),
        }
    }

    /// Valid from: `Licensed`, or `Active` for a server-driven
    /// re-activation.
    pub fn activate(&mut self) -> Result<()> {
        match self {
            Self::Licensed | Self::Active { .. } => {
                *self = Self::Active {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(RdcError::InvalidState("cannot activate: not licensed")),
        }
    }

    /// Valid from any state except `Disconnected` and `Disconnecting`.
    pub fn begin_disconnect(&mut self) -> Result<()> {
        match self {
            Self::Disconnected | Self::Disconnecting => Err(RdcError::InvalidState(
                "cannot disconnect: no connection in progress",
            )),
            _ => {
                *self = Self::Disconnecting;
                Ok(())
            }
        }
    }

    /// Valid from: `Disconnecting`.
    pub fn finish_disconnect(&mut self) -> Result<()> {
        match self {
            Self::Disconnecting => {
                *self = Self::Disconnected;
                Ok(())
            }
            _ => Err(RdcError::InvalidState(
                "cannot finish disconnect: not in Disconnecting state",
            )),
        }
    }

    /// Force-reset to `Disconnected` regardless of current state.
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}

// ── Tests ────────────────────────────────────────────────────────
