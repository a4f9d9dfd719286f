//! The three channel facades: document sync, presence, and project events.
//!
//! Each facade wires one supervisor to its handshake variant, router and
//! registries, and exposes the boundary contract: an event receiver taken
//! once via `take_event_rx`, `watch`-based connected/error/state
//! observables, and the async gated operations.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::handshake::HandshakeStrategy;
use crate::protocol::{self, EventFrame, PresenceFrame};
use crate::rooms::RoomRegistry;
use crate::router::{MessageRouter, Outbound};
use crate::subscription::{DocSession, RemoteDoc, SubscriptionMultiplexer, SubscriptionState};
use crate::supervisor::{KeepaliveFn, LinkDriver, LinkShared, LinkState, NoHooks};
use crate::transport::{Connector, WsConnector};

/// Events emitted by the document-sync channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocSyncEvent {
    /// A save the server finished persisting.
    SaveCompleted { status: String, correlation_id: String },
}

/// Events emitted by the presence channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Joined { room: String, project: u64, participant: Uuid },
    Left { room: String, project: u64, participant: Uuid },
}

/// A named inbound event on the project-event channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    pub name: String,
    pub payload: Value,
}

/// Shared plumbing of the three facades.
struct ChannelCore {
    shared: Arc<LinkShared>,
    outbound: Outbound,
    driver: Mutex<Option<LinkDriver>>,
}

impl ChannelCore {
    /// Start epoch 1. Ignored when already linked or permanently closed;
    /// nothing is thrown out of connect.
    fn connect(&self, token: String) {
        if *self.shared.shutdown.borrow() {
            log::warn!("connect on a disconnected channel ignored");
            return;
        }
        let Some(driver) = self.driver.lock().unwrap().take() else {
            log::warn!("channel already linked");
            return;
        };
        tokio::spawn(driver.run(token));
    }

    /// Permanent teardown; the channel is not restartable. Returns whether
    /// the supervisor had never been started, in which case the caller must
    /// tear down its registries itself.
    fn disconnect(&self) -> bool {
        self.shared.shutdown.send_replace(true);
        let never_started = self.driver.lock().unwrap().take().is_some();
        if never_started {
            self.shared.gate.reject(ChannelError::Disconnected);
        }
        never_started
    }

    fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    fn connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    fn connected_watch(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    fn last_error(&self) -> Option<ChannelError> {
        self.shared.error.borrow().clone()
    }

    fn error_watch(&self) -> watch::Receiver<Option<ChannelError>> {
        self.shared.error.subscribe()
    }
}

fn ping_keepalive(outbound: Outbound) -> KeepaliveFn {
    Arc::new(move || {
        let outbound = outbound.clone();
        tokio::spawn(async move {
            if let Err(e) = outbound.send(protocol::PING_FRAME).await {
                log::debug!("heartbeat send failed: {e}");
            }
        });
    })
}

// ───────────────────────────────────────────────────────────────────
// Document sync
// ───────────────────────────────────────────────────────────────────

/// The document-sync channel: probe-frame handshake, OT data plane, tagged
/// control lines, and the subscription multiplexer.
pub struct DocSyncChannel {
    core: ChannelCore,
    multiplexer: Arc<SubscriptionMultiplexer>,
    event_rx: Option<mpsc::UnboundedReceiver<DocSyncEvent>>,
}

impl DocSyncChannel {
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        session: Arc<dyn DocSession>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let data_session = session.clone();
        let save_tx = event_tx.clone();
        let router = MessageRouter::new(Box::new(move |frame| data_session.handle_frame(frame)))
            .on_control(
                "saved",
                Box::new(move |line| {
                    let mut args = line.args.into_iter();
                    let status = args.next().unwrap_or_default();
                    let correlation_id = args.next().unwrap_or_default();
                    let _ = save_tx.send(DocSyncEvent::SaveCompleted { status, correlation_id });
                }),
            );

        // Build the multiplexer against the same gate the supervisor will
        // resolve, then hand it to the supervisor as the lifecycle hooks.
        let shared = LinkShared::new(config);
        let outbound = Outbound::new(shared.gate.clone());
        let multiplexer =
            Arc::new(SubscriptionMultiplexer::new(session.clone(), shared.gate.clone()));
        let ka_session = session;
        let keepalive: KeepaliveFn = Arc::new(move || ka_session.ping());
        let driver = LinkDriver::new(
            shared.clone(),
            connector,
            HandshakeStrategy::Probe,
            Arc::new(router),
            multiplexer.clone(),
            keepalive,
        );
        let core = ChannelCore { shared, outbound, driver: Mutex::new(Some(driver)) };

        Self { core, multiplexer, event_rx: Some(event_rx) }
    }

    /// Production construction over tokio-tungstenite.
    pub fn with_ws(config: ChannelConfig, session: Arc<dyn DocSession>) -> Self {
        Self::new(config, Arc::new(WsConnector), session)
    }

    pub fn connect(&self, token: impl Into<String>) {
        self.core.connect(token.into());
    }

    pub fn disconnect(&self) {
        if self.core.disconnect() {
            self.multiplexer.teardown();
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<DocSyncEvent>> {
        self.event_rx.take()
    }

    /// Generic gated send.
    pub async fn send(&self, frame: &str) -> Result<(), ChannelError> {
        self.core.outbound.send(frame).await
    }

    pub async fn subscribe(&self, collection: &str, key: &str) -> Option<Arc<dyn RemoteDoc>> {
        self.multiplexer.subscribe(collection, key).await
    }

    pub async fn unsubscribe(&self, collection: &str, key: &str) {
        self.multiplexer.unsubscribe(collection, key).await
    }

    pub async fn bulk_subscribe(
        &self,
        list: &[(String, String)],
    ) -> Vec<Option<Arc<dyn RemoteDoc>>> {
        self.multiplexer.bulk_subscribe(list).await
    }

    pub async fn bulk_unsubscribe(&self, list: &[(String, String)]) {
        self.multiplexer.bulk_unsubscribe(list).await
    }

    pub fn subscription_state(&self, collection: &str, key: &str) -> Option<SubscriptionState> {
        self.multiplexer.state_of(collection, key)
    }

    pub fn state(&self) -> LinkState {
        self.core.state()
    }

    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.core.state_watch()
    }

    pub fn connected(&self) -> bool {
        self.core.connected()
    }

    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.core.connected_watch()
    }

    pub fn last_error(&self) -> Option<ChannelError> {
        self.core.last_error()
    }

    pub fn error_watch(&self) -> watch::Receiver<Option<ChannelError>> {
        self.core.error_watch()
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence
// ───────────────────────────────────────────────────────────────────

/// The presence channel: header-preauthenticated handshake guarded by a
/// client timer, `"ping"`/`"pong"` heartbeats, and room membership.
pub struct PresenceChannel {
    core: ChannelCore,
    rooms: Arc<RoomRegistry>,
    event_rx: Option<mpsc::UnboundedReceiver<PresenceEvent>>,
}

impl PresenceChannel {
    pub fn new(config: ChannelConfig, connector: Arc<dyn Connector>, local_id: Uuid) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let shared = LinkShared::new(config.clone());
        let outbound = Outbound::new(shared.gate.clone());
        let rooms = Arc::new(RoomRegistry::new(local_id, outbound.clone(), config.rejoin_rooms));

        let data_rooms = rooms.clone();
        let router = MessageRouter::new(Box::new(move |frame| {
            if let Some(error) = protocol::frame_error(frame) {
                log::warn!("presence error frame suppressed: {error}");
                return;
            }
            match serde_json::from_str::<PresenceFrame>(frame) {
                Ok(parsed) => {
                    data_rooms.apply_remote(&parsed);
                    let event = match &parsed {
                        PresenceFrame::Join { room, project, id, .. } => PresenceEvent::Joined {
                            room: room.clone(),
                            project: *project,
                            participant: *id,
                        },
                        PresenceFrame::Leave { room, project, id } => PresenceEvent::Left {
                            room: room.clone(),
                            project: *project,
                            participant: *id,
                        },
                    };
                    let _ = event_tx.send(event);
                }
                Err(e) => log::warn!("unparseable presence frame: {e}"),
            }
        }))
        .with_heartbeat_reply(protocol::PONG_FRAME);

        let driver = LinkDriver::new(
            shared.clone(),
            connector,
            HandshakeStrategy::HeaderAuth { timeout: config.handshake_timeout },
            Arc::new(router),
            rooms.clone(),
            ping_keepalive(outbound.clone()),
        );
        let core = ChannelCore { shared, outbound, driver: Mutex::new(Some(driver)) };

        Self { core, rooms, event_rx: Some(event_rx) }
    }

    pub fn with_ws(config: ChannelConfig, local_id: Uuid) -> Self {
        Self::new(config, Arc::new(WsConnector), local_id)
    }

    pub fn connect(&self, token: impl Into<String>) {
        self.core.connect(token.into());
    }

    pub fn disconnect(&self) {
        self.core.disconnect();
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<PresenceEvent>> {
        self.event_rx.take()
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn join(&self, room: &str, project: u64) {
        self.rooms.join(room, project);
    }

    pub fn leave(&self, room: &str, project: u64) {
        self.rooms.leave(room, project);
    }

    pub fn state(&self) -> LinkState {
        self.core.state()
    }

    pub fn connected(&self) -> bool {
        self.core.connected()
    }

    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.core.connected_watch()
    }

    pub fn last_error(&self) -> Option<ChannelError> {
        self.core.last_error()
    }

    pub fn error_watch(&self) -> watch::Receiver<Option<ChannelError>> {
        self.core.error_watch()
    }
}

// ───────────────────────────────────────────────────────────────────
// Project events
// ───────────────────────────────────────────────────────────────────

/// The project-event channel: structured authenticate/welcome handshake and
/// named JSON envelopes in both directions.
pub struct EventChannel {
    core: ChannelCore,
    event_rx: Option<mpsc::UnboundedReceiver<ServerEvent>>,
}

impl EventChannel {
    pub fn new(config: ChannelConfig, connector: Arc<dyn Connector>, role: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let router = MessageRouter::new(Box::new(move |frame| {
            if let Some(error) = protocol::frame_error(frame) {
                log::warn!("event error frame suppressed: {error}");
                return;
            }
            match EventFrame::parse(frame) {
                Some(parsed) => {
                    let _ = event_tx.send(ServerEvent { name: parsed.name, payload: parsed.payload });
                }
                None => log::warn!("unparseable event frame"),
            }
        }))
        .with_heartbeat_reply(protocol::PONG_FRAME);

        let shared = LinkShared::new(config);
        let outbound = Outbound::new(shared.gate.clone());
        let driver = LinkDriver::new(
            shared.clone(),
            connector,
            HandshakeStrategy::Structured { role: role.into() },
            Arc::new(router),
            Arc::new(NoHooks),
            ping_keepalive(outbound.clone()),
        );
        let core = ChannelCore { shared, outbound, driver: Mutex::new(Some(driver)) };

        Self { core, event_rx: Some(event_rx) }
    }

    pub fn with_ws(config: ChannelConfig, role: impl Into<String>) -> Self {
        Self::new(config, Arc::new(WsConnector), role)
    }

    pub fn connect(&self, token: impl Into<String>) {
        self.core.connect(token.into());
    }

    pub fn disconnect(&self) {
        self.core.disconnect();
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Send a named event envelope.
    pub async fn send(&self, name: &str, payload: Value) -> Result<(), ChannelError> {
        self.core.outbound.send(&EventFrame::encode(name, payload)).await
    }

    pub fn state(&self) -> LinkState {
        self.core.state()
    }

    pub fn connected(&self) -> bool {
        self.core.connected()
    }

    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.core.connected_watch()
    }

    pub fn last_error(&self) -> Option<ChannelError> {
        self.core.last_error()
    }

    pub fn error_watch(&self) -> watch::Receiver<Option<ChannelError>> {
        self.core.error_watch()
    }
}
