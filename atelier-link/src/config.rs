//! Per-channel configuration.

use std::time::Duration;

/// Tunables for one channel. The endpoint URL and origin are fixed at
/// construction and never change across reconnects.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Origin header sent with every connection attempt.
    pub origin: String,
    /// Heartbeat period while the channel is active.
    pub keepalive_interval: Duration,
    /// Fixed delay between reconnect attempts. Deliberately not exponential;
    /// see DESIGN.md.
    pub reconnect_delay: Duration,
    /// Guard window for handshakes whose success signal is the transport's
    /// own open event.
    pub handshake_timeout: Duration,
    /// Re-send room join requests after a reconnect. Off by default: local
    /// membership records persist across epochs but historically were never
    /// resent to the server, unlike document subscriptions.
    pub rejoin_rooms: bool,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            origin: origin.into(),
            keepalive_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
            rejoin_rooms: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::new("wss://sync.atelier.app/ws", "https://atelier.app");
        assert_eq!(config.url, "wss://sync.atelier.app/ws");
        assert_eq!(config.origin, "https://atelier.app");
        assert_eq!(config.keepalive_interval, Duration::from_secs(1));
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert!(!config.rejoin_rooms);
    }
}
