//! Integration tests for the channel lifecycle.
//!
//! These tests drive the real supervisor, router and registries against a
//! scripted in-memory connector, verifying the connect/authenticate/active
//! cycle, reconnection, and the terminal failure paths under paused time.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use atelier_link::channel::{DocSyncChannel, DocSyncEvent, EventChannel, PresenceChannel, PresenceEvent};
use atelier_link::config::ChannelConfig;
use atelier_link::error::ChannelError;
use atelier_link::subscription::{composite_key, DocLoad, DocSession, RemoteDoc, SubscriptionState};
use atelier_link::supervisor::LinkState;
use atelier_link::transport::{ConnectResult, Connector, Transport, TransportEvent, TransportRequest};
use futures_util::future::BoxFuture;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::yield_now;
use tokio::time::{advance, Duration};
use uuid::Uuid;

// ── scripted transport ──────────────────────────────────────────────

struct FakeTransport {
    sent: Mutex<Vec<String>>,
    open: AtomicBool,
    closed_with: Mutex<Option<u16>>,
}

impl FakeTransport {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn closed_with(&self) -> Option<u16> {
        *self.closed_with.lock().unwrap()
    }
}

impl Transport for FakeTransport {
    fn send(&self, frame: &str) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Transport("socket writer gone".into()));
        }
        self.sent.lock().unwrap().push(frame.to_owned());
        Ok(())
    }

    fn close(&self, code: u16) {
        self.open.store(false, Ordering::SeqCst);
        self.closed_with.lock().unwrap().get_or_insert(code);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Connector producing one scripted transport per attempt. The test keeps
/// the event sender, playing the server's side by hand.
struct FakeConnector {
    auto_open: bool,
    attempts: AtomicUsize,
    requests: Mutex<Vec<TransportRequest>>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    senders: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
}

impl FakeConnector {
    fn new(auto_open: bool) -> Arc<Self> {
        Arc::new(Self {
            auto_open,
            attempts: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            transports: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
        })
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn transport(&self, attempt: usize) -> Arc<FakeTransport> {
        self.transports.lock().unwrap()[attempt].clone()
    }

    fn request(&self, attempt: usize) -> TransportRequest {
        self.requests.lock().unwrap()[attempt].clone()
    }

    async fn serve(&self, attempt: usize, event: TransportEvent) {
        let sender = self.senders.lock().unwrap()[attempt].clone();
        sender.send(event).await.unwrap();
    }
}

impl Connector for FakeConnector {
    fn connect(&self, request: TransportRequest) -> BoxFuture<'static, ConnectResult> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let transport = Arc::new(FakeTransport {
            sent: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
            closed_with: Mutex::new(None),
        });
        let (event_tx, event_rx) = mpsc::channel(64);
        self.transports.lock().unwrap().push(transport.clone());
        self.senders.lock().unwrap().push(event_tx.clone());
        let auto_open = self.auto_open;
        Box::pin(async move {
            if auto_open {
                let _ = event_tx.send(TransportEvent::Open).await;
            }
            Ok((transport as Arc<dyn Transport>, event_rx))
        })
    }
}

// ── scripted OT session ─────────────────────────────────────────────

struct FakeDoc {
    subscribes: AtomicUsize,
    server_subscribed: AtomicBool,
    destroyed: AtomicBool,
    load: watch::Sender<DocLoad>,
}

impl RemoteDoc for FakeDoc {
    fn subscribe(&self) {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        self.server_subscribed.store(true, Ordering::SeqCst);
        let _ = self.load.send(DocLoad::Loaded);
    }
    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        let _ = self.load.send(DocLoad::Destroyed);
    }
    fn is_subscribed(&self) -> bool {
        self.server_subscribed.load(Ordering::SeqCst)
    }
    fn load_state(&self) -> watch::Receiver<DocLoad> {
        self.load.subscribe()
    }
}

struct FakeSession {
    docs: Mutex<Vec<(String, Arc<FakeDoc>)>>,
    pings: AtomicUsize,
}

impl FakeSession {
    fn new() -> Arc<Self> {
        Arc::new(Self { docs: Mutex::new(Vec::new()), pings: AtomicUsize::new(0) })
    }

    fn doc(&self, index: usize) -> Arc<FakeDoc> {
        self.docs.lock().unwrap()[index].1.clone()
    }

    fn total_subscribes(&self) -> usize {
        self.docs
            .lock()
            .unwrap()
            .iter()
            .map(|(_, doc)| doc.subscribes.load(Ordering::SeqCst))
            .sum()
    }
}

impl DocSession for FakeSession {
    fn open_doc(&self, collection: &str, key: &str) -> Arc<dyn RemoteDoc> {
        let doc = Arc::new(FakeDoc {
            subscribes: AtomicUsize::new(0),
            server_subscribed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            load: watch::channel(DocLoad::Pending).0,
        });
        self.docs.lock().unwrap().push((composite_key(collection, key), doc.clone()));
        doc
    }
    fn start_batch(&self) {}
    fn end_batch(&self) {}
    fn handle_frame(&self, _frame: &str) {}
    fn ping(&self) {
        self.pings.fetch_add(1, Ordering::SeqCst);
    }
}

// ── helpers ─────────────────────────────────────────────────────────

fn config() -> ChannelConfig {
    ChannelConfig::new("wss://sync.atelier.test/ws", "https://atelier.test")
}

/// Let every spawned task run to its next suspension point.
async fn settle() {
    for _ in 0..10 {
        yield_now().await;
    }
}

async fn probe_accept(connector: &FakeConnector, attempt: usize) {
    connector
        .serve(attempt, TransportEvent::Frame(r#"auth{"id":"s-1"}"#.into()))
        .await;
    settle().await;
}

// ── document sync ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_probe_handshake_connects_and_sends() {
    let connector = FakeConnector::new(true);
    let session = FakeSession::new();
    let mut channel = DocSyncChannel::new(config(), connector.clone(), session.clone());
    let mut events = channel.take_event_rx().unwrap();

    channel.connect("tok-1");
    settle().await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(channel.state(), LinkState::Authenticating);
    let sent = connector.transport(0).sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].starts_with("auth{"));
    assert!(sent[0].contains("tok-1"));

    probe_accept(&connector, 0).await;
    assert!(channel.connected());
    assert_eq!(channel.state(), LinkState::Active);

    channel.send("op:payload").await.unwrap();
    assert!(connector.transport(0).sent().contains(&"op:payload".to_owned()));

    let doc = channel.subscribe("pages", "p-1").await;
    assert!(doc.is_some());
    assert_eq!(
        channel.subscription_state("pages", "p-1"),
        Some(SubscriptionState::Subscribed)
    );

    // The keepalive drives the session's own ping primitive.
    for _ in 0..2 {
        advance(Duration::from_secs(1)).await;
        settle().await;
    }
    assert_eq!(session.pings.load(Ordering::SeqCst), 2);

    // A save-completion control line is routed off the data plane.
    connector
        .serve(0, TransportEvent::Frame("saved:ok:42".into()))
        .await;
    settle().await;
    assert_eq!(
        events.try_recv().unwrap(),
        DocSyncEvent::SaveCompleted { status: "ok".into(), correlation_id: "42".into() }
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejected_token_fails_without_retry() {
    let connector = FakeConnector::new(true);
    let channel = DocSyncChannel::new(config(), connector.clone(), FakeSession::new());

    channel.connect("bad-token");
    settle().await;
    connector
        .serve(0, TransportEvent::Frame(r#"auth{"reason":"invalid token"}"#.into()))
        .await;
    settle().await;

    assert_eq!(channel.state(), LinkState::Failed);
    assert_eq!(channel.last_error(), Some(ChannelError::AuthRejected));
    assert!(!channel.connected());
    assert_eq!(connector.transport(0).closed_with(), Some(4401));

    // No reconnect attempt, however long we wait.
    advance(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_close_code_not_retried() {
    let connector = FakeConnector::new(true);
    let channel = DocSyncChannel::new(config(), connector.clone(), FakeSession::new());

    channel.connect("tok-1");
    settle().await;
    probe_accept(&connector, 0).await;
    assert!(channel.connected());

    connector.serve(0, TransportEvent::Closed { code: 4401 }).await;
    settle().await;
    assert_eq!(channel.state(), LinkState::Failed);
    assert_eq!(channel.last_error(), Some(ChannelError::AuthRejected));

    advance(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_failure_destroys_subscriptions() {
    let connector = FakeConnector::new(true);
    let session = FakeSession::new();
    let channel = DocSyncChannel::new(config(), connector.clone(), session.clone());

    channel.connect("tok-1");
    settle().await;
    probe_accept(&connector, 0).await;
    channel.subscribe("pages", "p-1").await.unwrap();

    connector.serve(0, TransportEvent::Closed { code: 4401 }).await;
    settle().await;
    assert_eq!(channel.state(), LinkState::Failed);
    assert!(session.doc(0).destroyed.load(Ordering::SeqCst));
    assert_eq!(channel.subscription_state("pages", "p-1"), None);

    // disconnect() after the terminal exit finds nothing left to tear down.
    channel.disconnect();
    settle().await;
    assert_eq!(channel.subscription_state("pages", "p-1"), None);
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_close_reconnects_and_rebinds_sends() {
    let connector = FakeConnector::new(true);
    let channel = Arc::new(DocSyncChannel::new(
        config(),
        connector.clone(),
        FakeSession::new(),
    ));

    channel.connect("tok-1");
    settle().await;
    probe_accept(&connector, 0).await;
    assert!(channel.connected());

    connector.serve(0, TransportEvent::Closed { code: 1006 }).await;
    settle().await;
    assert!(!channel.connected());
    assert_eq!(channel.state(), LinkState::Reconnecting);

    // A send issued during the gap parks on the fresh gate.
    let gap_send = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.send("queued-op").await })
    };
    settle().await;
    assert!(!gap_send.is_finished());

    advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(connector.attempts(), 2);
    probe_accept(&connector, 1).await;
    assert!(channel.connected());

    gap_send.await.unwrap().unwrap();
    let second = connector.transport(1).sent();
    assert!(second.contains(&"queued-op".to_owned()));
    assert!(!connector.transport(0).sent().contains(&"queued-op".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn test_resume_reissues_forgotten_subscriptions() {
    let connector = FakeConnector::new(true);
    let session = FakeSession::new();
    let channel = DocSyncChannel::new(config(), connector.clone(), session.clone());

    channel.connect("tok-1");
    settle().await;
    probe_accept(&connector, 0).await;

    for key in ["a", "b", "c"] {
        channel.subscribe("pages", key).await.unwrap();
    }
    assert_eq!(session.total_subscribes(), 3);

    connector.serve(0, TransportEvent::Closed { code: 1006 }).await;
    settle().await;
    assert_eq!(
        channel.subscription_state("pages", "a"),
        Some(SubscriptionState::Paused)
    );

    // The server forgot one of the three across the reconnect.
    session.doc(1).server_subscribed.store(false, Ordering::SeqCst);

    advance(Duration::from_secs(1)).await;
    settle().await;
    probe_accept(&connector, 1).await;
    assert!(channel.connected());

    assert_eq!(session.total_subscribes(), 4);
    for key in ["a", "b", "c"] {
        assert_eq!(
            channel.subscription_state("pages", key),
            Some(SubscriptionState::Subscribed)
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_tears_down_and_rejects_gap_waiters() {
    let connector = FakeConnector::new(true);
    let session = FakeSession::new();
    let channel = Arc::new(DocSyncChannel::new(config(), connector.clone(), session.clone()));

    channel.connect("tok-1");
    settle().await;
    probe_accept(&connector, 0).await;
    channel.subscribe("pages", "p-1").await.unwrap();

    // Drop into the reconnect gap, park a send on the pending gate, then
    // disconnect before the retry fires.
    connector.serve(0, TransportEvent::Closed { code: 1006 }).await;
    settle().await;
    let gap_send = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.send("late-op").await })
    };
    settle().await;

    channel.disconnect();
    settle().await;
    assert_eq!(gap_send.await.unwrap(), Err(ChannelError::Disconnected));
    assert_eq!(channel.state(), LinkState::Idle);
    assert!(session.doc(0).destroyed.load(Ordering::SeqCst));
    assert_eq!(channel.subscription_state("pages", "p-1"), None);
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_before_connect_settles_waiters() {
    let connector = FakeConnector::new(true);
    let channel = Arc::new(DocSyncChannel::new(config(), connector.clone(), FakeSession::new()));

    let parked = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.subscribe("pages", "p-1").await })
    };
    settle().await;

    channel.disconnect();
    settle().await;
    assert!(parked.await.unwrap().is_none());
    assert_eq!(connector.attempts(), 0);
}

// ── presence ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_header_auth_activates_on_open() {
    let connector = FakeConnector::new(true);
    let local = Uuid::new_v4();
    let mut channel = PresenceChannel::new(config(), connector.clone(), local);
    let mut events = channel.take_event_rx().unwrap();

    channel.connect("tok-p");
    settle().await;
    assert!(channel.connected());
    let request = connector.request(0);
    assert!(request
        .headers
        .contains(&("Authorization".to_owned(), "Bearer tok-p".to_owned())));

    channel.join("board", 7);
    settle().await;
    let sent = connector.transport(0).sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains(r#""t":"join""#));

    // A remote participant joins; the registry merges and an event fires.
    let other = Uuid::new_v4();
    let frame = format!(r#"{{"t":"join","room":"board","project":7,"id":"{other}"}}"#);
    connector.serve(0, TransportEvent::Frame(frame)).await;
    settle().await;
    assert_eq!(
        events.try_recv().unwrap(),
        PresenceEvent::Joined { room: "board".into(), project: 7, participant: other }
    );
    let members = channel.rooms().members("board", 7);
    assert!(members.contains(&local) && members.contains(&other));

    // Error frames are suppressed, heartbeat replies swallowed.
    connector
        .serve(0, TransportEvent::Frame(r#"{"t":"join","error":"forbidden"}"#.into()))
        .await;
    connector.serve(0, TransportEvent::Frame("\"pong\"".into())).await;
    settle().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_header_auth_timeout_is_terminal() {
    // The server accepts the socket but never finishes the open sequence.
    let connector = FakeConnector::new(false);
    let channel = PresenceChannel::new(config(), connector.clone(), Uuid::new_v4());

    channel.connect("silently-dropped");
    settle().await;
    assert!(!channel.connected());

    advance(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(channel.last_error(), Some(ChannelError::HandshakeTimeout));
    assert!(!channel.connected());
    assert_eq!(connector.transport(0).closed_with(), Some(4401));
    assert_eq!(connector.attempts(), 1);
}

// ── project events ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_structured_handshake_waits_for_welcome() {
    let connector = FakeConnector::new(true);
    let mut channel = EventChannel::new(config(), connector.clone(), "designer");
    let mut events = channel.take_event_rx().unwrap();

    channel.connect("tok-e");
    settle().await;
    let sent = connector.transport(0).sent();
    assert_eq!(sent.len(), 1);
    let auth: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(auth["name"], "authenticate");
    assert_eq!(auth["token"], "tok-e");
    assert_eq!(auth["type"], "designer");

    // Noise before the welcome is ignored, not a rejection.
    connector
        .serve(0, TransportEvent::Frame(r#"{"name":"project_updated"}"#.into()))
        .await;
    settle().await;
    assert!(!channel.connected());

    connector
        .serve(0, TransportEvent::Frame(r#"{"name":"welcome"}"#.into()))
        .await;
    settle().await;
    assert!(channel.connected());
    // The pre-welcome envelope was consumed by the handshake, not emitted.
    assert!(events.try_recv().is_err());

    connector
        .serve(0, TransportEvent::Frame(r#"{"name":"branch_created","branch":"b1"}"#.into()))
        .await;
    settle().await;
    let event = events.try_recv().unwrap();
    assert_eq!(event.name, "branch_created");
    assert_eq!(event.payload["branch"], "b1");

    channel.send("comment_added", json!({ "body": "hi" })).await.unwrap();
    let sent = connector.transport(0).sent();
    let out: serde_json::Value = serde_json::from_str(sent.last().unwrap()).unwrap();
    assert_eq!(out["name"], "comment_added");
    assert_eq!(out["body"], "hi");
}

#[tokio::test(start_paused = true)]
async fn test_event_channel_keepalive_pings() {
    let connector = FakeConnector::new(true);
    let channel = EventChannel::new(config(), connector.clone(), "designer");

    channel.connect("tok-e");
    settle().await;
    connector
        .serve(0, TransportEvent::Frame(r#"{"name":"welcome"}"#.into()))
        .await;
    settle().await;
    assert!(channel.connected());

    for _ in 0..3 {
        advance(Duration::from_secs(1)).await;
        settle().await;
    }
    let pings = connector
        .transport(0)
        .sent()
        .iter()
        .filter(|frame| frame.as_str() == "\"ping\"")
        .count();
    assert_eq!(pings, 3);
}
