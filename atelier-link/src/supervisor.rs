//! Connection supervisor: one transport at a time, driven through an
//! explicit state machine.
//!
//! ```text
//! Idle ──connect──▶ Connecting ──open──▶ Authenticating ──success──▶ Active
//!                       ▲                     │                        │
//!                       │                  failure                non-terminal
//!                       │                     ▼                      close
//!                       └─── delay ─── Reconnecting ◀────────────────┘
//!                                             Failed (terminal, no retry)
//! ```
//!
//! The supervisor exclusively owns the channel's transport, readiness gate
//! and keepalive task. Every close-then-reconnect cycle is a new epoch: the
//! gate is replaced with a fresh pending instance *before* the retry is
//! scheduled, and the keepalive task is cleared so at most one ever runs.
//! The retry delay is fixed, not exponential; a documented limitation.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::gate::GateCell;
use crate::handshake::{HandshakeStep, HandshakeStrategy};
use crate::router::MessageRouter;
use crate::transport::{
    is_terminal_close, Connector, Ready, Transport, TransportEvent, TransportRequest,
    CLOSE_ABNORMAL, CLOSE_AUTH_REJECTED, CLOSE_NORMAL,
};

/// Connection lifecycle of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Authenticating,
    Active,
    Reconnecting,
    Failed,
}

/// Variant-specific lifecycle hooks, invoked from the supervisor's own task.
pub trait LinkHooks: Send + Sync {
    /// The transport was lost with a non-terminal code.
    fn on_suspend(&self) {}
    /// Runs synchronously as the last step before a fresh epoch's gate
    /// resolves, so every caller the gate unblocks sees reconciled state.
    fn on_resume(&self) {}
    /// Permanent teardown on `disconnect()`.
    fn on_teardown(&self) {}
}

/// Hooks for channels without resumable state.
pub struct NoHooks;

impl LinkHooks for NoHooks {}

pub type KeepaliveFn = Arc<dyn Fn() + Send + Sync>;

/// State shared between a channel facade and its supervisor task.
pub struct LinkShared {
    pub config: ChannelConfig,
    pub gate: Arc<GateCell<Ready>>,
    pub state: watch::Sender<LinkState>,
    pub connected: watch::Sender<bool>,
    pub error: watch::Sender<Option<ChannelError>>,
    pub shutdown: watch::Sender<bool>,
}

impl LinkShared {
    pub fn new(config: ChannelConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            gate: Arc::new(GateCell::new()),
            state: watch::channel(LinkState::Idle).0,
            connected: watch::channel(false).0,
            error: watch::channel(None).0,
            shutdown: watch::channel(false).0,
        })
    }
}

/// Outcome of one phase of a connection attempt.
enum AttemptError {
    /// Recovered through the reconnect path.
    Transient(ChannelError),
    /// Fatal for the channel; no retry.
    Terminal(ChannelError),
}

/// Drives one channel's connect → authenticate → active → (reconnect |
/// failed) lifecycle until permanent shutdown.
pub struct LinkDriver {
    shared: Arc<LinkShared>,
    connector: Arc<dyn Connector>,
    strategy: HandshakeStrategy,
    router: Arc<MessageRouter>,
    hooks: Arc<dyn LinkHooks>,
    keepalive: KeepaliveFn,
}

impl LinkDriver {
    pub fn new(
        shared: Arc<LinkShared>,
        connector: Arc<dyn Connector>,
        strategy: HandshakeStrategy,
        router: Arc<MessageRouter>,
        hooks: Arc<dyn LinkHooks>,
        keepalive: KeepaliveFn,
    ) -> Self {
        Self { shared, connector, strategy, router, hooks, keepalive }
    }

    pub async fn run(self, token: String) {
        let mut shutdown = self.shared.shutdown.subscribe();
        let mut keepalive_task: Option<JoinHandle<()>> = None;
        let mut live_transport: Option<Arc<dyn Transport>> = None;

        'epochs: loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(LinkState::Connecting);
            let epoch = self.shared.gate.current().epoch();
            let request = TransportRequest {
                url: self.shared.config.url.clone(),
                origin: self.shared.config.origin.clone(),
                headers: self.strategy.auth_headers(&token),
            };

            // Connect and wait for the open event, under the guard deadline
            // when the handshake variant supplies one. The pending slot lets
            // the timeout arm force-close a transport the dropped future
            // already created.
            let pending: Arc<Mutex<Option<Arc<dyn Transport>>>> = Arc::new(Mutex::new(None));
            let opened = {
                let attempt = self.connect_until_open(request, pending.clone(), &mut shutdown);
                match self.strategy.open_deadline() {
                    Some(deadline) => match timeout(deadline, attempt).await {
                        Ok(result) => result,
                        Err(_) => {
                            if let Some(transport) = pending.lock().unwrap().take() {
                                transport.close(CLOSE_AUTH_REJECTED);
                            }
                            self.fail(ChannelError::HandshakeTimeout);
                            return;
                        }
                    },
                    None => attempt.await,
                }
            };
            let (transport, mut events) = match opened {
                Ok(pair) => pair,
                Err(AttemptError::Terminal(error)) => {
                    self.fail(error);
                    return;
                }
                Err(AttemptError::Transient(error)) => {
                    log::info!("connect attempt failed ({error}); retrying");
                    if !self.delay_retry(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            live_transport = Some(transport.clone());

            // The handshake writes its payload as soon as the transport
            // reports open; for the header variant the open event itself is
            // the success signal.
            self.set_state(LinkState::Authenticating);
            let authenticated = if self.strategy.completes_on_open() {
                Ok(())
            } else {
                match self.strategy.begin(transport.as_ref(), &token) {
                    Ok(()) => self.handshake(&mut events, &mut shutdown).await,
                    Err(error) => Err(AttemptError::Transient(error)),
                }
            };
            match authenticated {
                Ok(()) => {}
                Err(AttemptError::Terminal(error)) => {
                    transport.close(CLOSE_AUTH_REJECTED);
                    self.fail(error);
                    return;
                }
                Err(AttemptError::Transient(error)) => {
                    log::info!("handshake interrupted ({error}); retrying");
                    live_transport = None;
                    if !self.delay_retry(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            }

            // Resume protocol runs before the gate resolves, so callers the
            // gate unblocks see a fully reconciled subscription set.
            self.hooks.on_resume();
            self.shared.gate.resolve(epoch, Ready { epoch, transport: transport.clone() });

            // At most one keepalive task per channel, however many times
            // re-authentication occurs.
            if let Some(task) = keepalive_task.take() {
                task.abort();
            }
            keepalive_task = Some(self.spawn_keepalive());

            self.set_state(LinkState::Active);
            self.shared.connected.send_replace(true);
            log::info!("channel active (epoch {epoch})");

            // Pump frames until the transport closes or shutdown.
            let close_code = loop {
                tokio::select! {
                    _ = shutdown.changed() => break None,
                    event = events.recv() => match event {
                        Some(TransportEvent::Frame(frame)) => self.router.route(&frame),
                        Some(TransportEvent::Closed { code }) => break Some(code),
                        Some(TransportEvent::Open) => {}
                        None => break Some(CLOSE_ABNORMAL),
                    }
                }
            };

            self.shared.connected.send_replace(false);
            match close_code {
                None => break 'epochs,
                Some(code) if is_terminal_close(code) => {
                    if let Some(task) = keepalive_task.take() {
                        task.abort();
                    }
                    self.fail(ChannelError::AuthRejected);
                    return;
                }
                Some(code) => {
                    log::info!("transport closed ({code}); reconnecting");
                    // Fresh epoch before the retry is scheduled: waiters that
                    // arrive during the gap bind to the new gate, never the
                    // dead transport.
                    self.shared.gate.replace();
                    if let Some(task) = keepalive_task.take() {
                        task.abort();
                    }
                    self.hooks.on_suspend();
                    live_transport = None;
                    if !self.delay_retry(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        // Permanent shutdown: close the transport, clear timers, tear down
        // registries, and reject any waiter still parked on the gate rather
        // than stranding it (see DESIGN.md).
        if let Some(task) = keepalive_task.take() {
            task.abort();
        }
        if let Some(transport) = live_transport.take() {
            transport.close(CLOSE_NORMAL);
        }
        self.hooks.on_teardown();
        self.shared.gate.reject(ChannelError::Disconnected);
        self.shared.connected.send_replace(false);
        self.set_state(LinkState::Idle);
        log::info!("channel shut down");
    }

    async fn connect_until_open(
        &self,
        request: TransportRequest,
        pending: Arc<Mutex<Option<Arc<dyn Transport>>>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), AttemptError> {
        let (transport, mut events) = tokio::select! {
            _ = shutdown.changed() => {
                return Err(AttemptError::Transient(ChannelError::Disconnected));
            }
            connected = self.connector.connect(request) => {
                connected.map_err(AttemptError::Transient)?
            }
        };
        *pending.lock().unwrap() = Some(transport.clone());
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    transport.close(CLOSE_NORMAL);
                    return Err(AttemptError::Transient(ChannelError::Disconnected));
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Open) => return Ok((transport, events)),
                    Some(TransportEvent::Closed { code }) if is_terminal_close(code) => {
                        return Err(AttemptError::Terminal(ChannelError::AuthRejected));
                    }
                    Some(TransportEvent::Closed { code }) => {
                        return Err(AttemptError::Transient(ChannelError::Transport(format!(
                            "closed before open: {code}"
                        ))));
                    }
                    Some(TransportEvent::Frame(_)) => {}
                    None => {
                        return Err(AttemptError::Transient(ChannelError::Transport(
                            "transport dropped before open".into(),
                        )));
                    }
                }
            }
        }
    }

    async fn handshake(
        &self,
        events: &mut mpsc::Receiver<TransportEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), AttemptError> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    return Err(AttemptError::Transient(ChannelError::Disconnected));
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Frame(frame)) => match self.strategy.classify(&frame) {
                        HandshakeStep::Success => return Ok(()),
                        HandshakeStep::Rejected => {
                            return Err(AttemptError::Terminal(ChannelError::AuthRejected));
                        }
                        HandshakeStep::Ignore => {}
                    },
                    Some(TransportEvent::Closed { code }) if is_terminal_close(code) => {
                        return Err(AttemptError::Terminal(ChannelError::AuthRejected));
                    }
                    Some(TransportEvent::Closed { code }) => {
                        return Err(AttemptError::Transient(ChannelError::Transport(format!(
                            "closed during handshake: {code}"
                        ))));
                    }
                    Some(TransportEvent::Open) => {}
                    None => {
                        return Err(AttemptError::Transient(ChannelError::Transport(
                            "transport dropped during handshake".into(),
                        )));
                    }
                }
            }
        }
    }

    /// Fixed-delay retry wait. Returns false when shutdown interrupts it.
    async fn delay_retry(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if *shutdown.borrow() {
            return false;
        }
        self.set_state(LinkState::Reconnecting);
        tokio::select! {
            _ = sleep(self.shared.config.reconnect_delay) => true,
            _ = shutdown.changed() => false,
        }
    }

    fn spawn_keepalive(&self) -> JoinHandle<()> {
        let interval = self.shared.config.keepalive_interval;
        let keepalive = self.keepalive.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval fires immediately; skip the zeroth tick.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                keepalive();
            }
        })
    }

    /// Terminal failure: one error-signal emission, no retry, registries
    /// torn down (the channel is dead, same as a disconnect), and the gate
    /// rejected so no dependent operation hangs on it.
    fn fail(&self, error: ChannelError) {
        log::warn!("channel failed: {error}");
        self.shared.error.send_replace(Some(error.clone()));
        self.shared.connected.send_replace(false);
        self.set_state(LinkState::Failed);
        self.hooks.on_teardown();
        self.shared.gate.reject(error);
    }

    fn set_state(&self, state: LinkState) {
        // send_replace stores the value even when no receiver is subscribed,
        // so state()/connected()/last_error() read current values without a
        // watcher held open.
        self.shared.state.send_replace(state);
    }
}
