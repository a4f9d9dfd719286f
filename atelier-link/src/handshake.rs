//! Pluggable authentication handshake, run once per transport-open event.
//!
//! The three wire protocols differ only in which frames and timeouts they
//! watch for, so they live behind one enum instead of three near-duplicate
//! supervisors. The supervisor drives whichever variant its channel was
//! built with through the same contract: contribute connection headers,
//! write a payload on open, classify inbound frames until an outcome.

use std::time::Duration;

use crate::error::ChannelError;
use crate::protocol;
use crate::transport::Transport;

/// Outcome of feeding one inbound frame to a handshake in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// The transport is authenticated; the channel may go active.
    Success,
    /// Authentication permanently rejected. Terminal; never retried.
    Rejected,
    /// Not a handshake frame; keep waiting.
    Ignore,
}

/// Authentication protocol for a freshly opened transport.
#[derive(Debug, Clone)]
pub enum HandshakeStrategy {
    /// Send a tagged probe frame carrying the token; the first inbound frame
    /// with the same tag decides the outcome by the presence of an
    /// identifying field.
    Probe,
    /// Send a named JSON envelope; success is the `welcome` envelope. Any
    /// other reply is ignored until the welcome is seen.
    Structured { role: String },
    /// The token travels as a connection header, so the transport's own open
    /// event is the success signal. A client-side timer guards against a
    /// server that silently drops a bad token instead of closing.
    HeaderAuth { timeout: Duration },
}

impl HandshakeStrategy {
    /// Extra connection headers for the transport request.
    pub fn auth_headers(&self, token: &str) -> Vec<(String, String)> {
        match self {
            Self::HeaderAuth { .. } => {
                vec![("Authorization".into(), format!("Bearer {token}"))]
            }
            _ => Vec::new(),
        }
    }

    /// Whether the open event itself completes this handshake.
    pub fn completes_on_open(&self) -> bool {
        matches!(self, Self::HeaderAuth { .. })
    }

    /// Deadline for observing the open event, when this variant guards it.
    pub fn open_deadline(&self) -> Option<Duration> {
        match self {
            Self::HeaderAuth { timeout } => Some(*timeout),
            _ => None,
        }
    }

    /// Write the authentication payload. Invoked as soon as the transport
    /// reports open; a no-op for the header variant.
    pub fn begin(&self, transport: &dyn Transport, token: &str) -> Result<(), ChannelError> {
        match self {
            Self::Probe => transport.send(&protocol::probe_auth_frame(token)),
            Self::Structured { role } => {
                transport.send(&protocol::structured_auth_frame(token, role))
            }
            Self::HeaderAuth { .. } => Ok(()),
        }
    }

    /// Classify one inbound frame while authenticating.
    pub fn classify(&self, frame: &str) -> HandshakeStep {
        match self {
            Self::Probe => match protocol::probe_auth_reply(frame) {
                Some(true) => HandshakeStep::Success,
                Some(false) => HandshakeStep::Rejected,
                None => HandshakeStep::Ignore,
            },
            Self::Structured { .. } => {
                if protocol::is_welcome_frame(frame) {
                    HandshakeStep::Success
                } else {
                    HandshakeStep::Ignore
                }
            }
            Self::HeaderAuth { .. } => HandshakeStep::Ignore,
        }
    }
}
