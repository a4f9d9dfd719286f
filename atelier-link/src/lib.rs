//! # atelier-link — Resilient real-time channels for Atelier
//!
//! Provides the three WebSocket channels a client keeps open against the
//! collaboration backend: document sync (OT data plane), presence (rooms),
//! and project events (named JSON envelopes). All three share one supervisor
//! architecture; they differ only in handshake variant, frame grammar, and
//! the registry hooked into the connection lifecycle.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │ DocSync      │  │ Presence     │  │ Event        │
//! │ Channel      │  │ Channel      │  │ Channel      │
//! └──────┬───────┘  └──────┬───────┘  └──────┬───────┘
//!        │ probe auth      │ header auth     │ authenticate/welcome
//!        ▼                 ▼                 ▼
//! ┌─────────────────────────────────────────────────┐
//! │ LinkDriver (per channel)                        │
//! │   state machine · readiness gate · keepalive    │
//! └──────┬──────────────────────────────┬───────────┘
//!        │ MessageRouter                │ hooks
//!        ▼                              ▼
//! ┌──────────────┐            ┌──────────────────────┐
//! │ WsTransport  │            │ SubscriptionMux /    │
//! │ (tungstenite)│            │ RoomRegistry         │
//! └──────────────┘            └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`channel`] — The three channel facades
//! - [`supervisor`] — Connection state machine, reconnect loop, keepalive
//! - [`gate`] — Epoch-counted single-resolution readiness gate
//! - [`handshake`] — The three authentication variants
//! - [`router`] — Inbound frame demultiplexing, gated outbound path
//! - [`subscription`] — Document subscription multiplexer
//! - [`rooms`] — Presence room membership
//! - [`protocol`] — Wire frame grammar for all three variants
//! - [`transport`] — WebSocket transport and the [`transport::Connector`] seam

pub mod channel;
pub mod config;
pub mod error;
pub mod gate;
pub mod handshake;
pub mod protocol;
pub mod rooms;
pub mod router;
pub mod subscription;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use channel::{DocSyncChannel, DocSyncEvent, EventChannel, PresenceChannel, PresenceEvent, ServerEvent};
pub use config::ChannelConfig;
pub use error::ChannelError;
pub use subscription::{DocLoad, DocSession, RemoteDoc, SubscriptionState};
pub use supervisor::LinkState;
pub use transport::{Connector, Transport, TransportEvent, TransportRequest};
