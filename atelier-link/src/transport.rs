//! Transport seam between the supervisor and the wire.
//!
//! The supervisor only ever talks to [`Transport`] and [`Connector`], so the
//! whole connection lifecycle is testable against scripted in-memory
//! transports. [`WsConnector`] is the production implementation over
//! tokio-tungstenite, split into a writer task fed by a command channel and a
//! reader task that decodes inbound messages into [`TransportEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::error::ChannelError;

/// Close code for a permanently rejected authentication. Never retried.
pub const CLOSE_AUTH_REJECTED: u16 = 4401;
/// Normal closure, issued by `disconnect()`.
pub const CLOSE_NORMAL: u16 = 1000;
/// Synthetic code for an abnormally dropped connection.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Whether a close code must suppress reconnection.
pub fn is_terminal_close(code: u16) -> bool {
    code == CLOSE_AUTH_REJECTED
}

/// Events produced by a transport for the supervisor's pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket finished its open sequence.
    Open,
    /// One inbound text frame.
    Frame(String),
    /// The socket closed with the given code.
    Closed { code: u16 },
}

/// One live socket. At most one is current per channel.
pub trait Transport: Send + Sync {
    fn send(&self, frame: &str) -> Result<(), ChannelError>;
    fn close(&self, code: u16);
    fn is_open(&self) -> bool;
}

/// The `(epoch, transport)` pair a readiness gate resolves with.
#[derive(Clone)]
pub struct Ready {
    pub epoch: u64,
    pub transport: Arc<dyn Transport>,
}

/// Connection parameters for one transport attempt.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub origin: String,
    /// Extra headers, e.g. a pre-authenticated bearer token.
    pub headers: Vec<(String, String)>,
}

pub type ConnectResult = Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), ChannelError>;

/// Factory for transports. One `connect` call per epoch.
pub trait Connector: Send + Sync {
    fn connect(&self, request: TransportRequest) -> BoxFuture<'static, ConnectResult>;
}

enum WsCommand {
    Text(String),
    Close(u16),
}

struct WsTransport {
    commands: mpsc::UnboundedSender<WsCommand>,
    open: AtomicBool,
}

impl Transport for WsTransport {
    fn send(&self, frame: &str) -> Result<(), ChannelError> {
        self.commands
            .send(WsCommand::Text(frame.to_owned()))
            .map_err(|_| ChannelError::Transport("socket writer gone".into()))
    }

    fn close(&self, code: u16) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.commands.send(WsCommand::Close(code));
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Production connector over tokio-tungstenite.
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, request: TransportRequest) -> BoxFuture<'static, ConnectResult> {
        Box::pin(async move {
            use tokio_tungstenite::tungstenite::client::IntoClientRequest;
            use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
            use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
            use tokio_tungstenite::tungstenite::protocol::CloseFrame;
            use tokio_tungstenite::tungstenite::Message;

            let mut req = request
                .url
                .as_str()
                .into_client_request()
                .map_err(|e| ChannelError::Transport(e.to_string()))?;
            let origin = HeaderValue::from_str(&request.origin)
                .map_err(|e| ChannelError::Transport(e.to_string()))?;
            req.headers_mut().insert("Origin", origin);
            for (name, value) in &request.headers {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| ChannelError::Transport(e.to_string()))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| ChannelError::Transport(e.to_string()))?;
                req.headers_mut().insert(name, value);
            }

            let (stream, _response) = tokio_tungstenite::connect_async(req)
                .await
                .map_err(|e| ChannelError::Transport(e.to_string()))?;
            let (mut sink, mut source) = stream.split();

            let (command_tx, mut command_rx) = mpsc::unbounded_channel();
            let transport = Arc::new(WsTransport {
                commands: command_tx,
                open: AtomicBool::new(true),
            });

            // Writer task: forward queued commands to the socket.
            tokio::spawn(async move {
                while let Some(command) = command_rx.recv().await {
                    match command {
                        WsCommand::Text(text) => {
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        WsCommand::Close(code) => {
                            let frame = CloseFrame {
                                code: CloseCode::from(code),
                                reason: "".into(),
                            };
                            let _ = sink.send(Message::Close(Some(frame))).await;
                            break;
                        }
                    }
                }
            });

            let (event_tx, event_rx) = mpsc::channel(256);
            // connect_async resolves once the WebSocket handshake completes,
            // which is the open event for our purposes.
            let _ = event_tx.send(TransportEvent::Open).await;

            // Reader task: decode inbound messages into transport events.
            let reader_transport = transport.clone();
            tokio::spawn(async move {
                let mut close_code = CLOSE_ABNORMAL;
                while let Some(message) = source.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            if event_tx
                                .send(TransportEvent::Frame(text.to_string()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Ok(Message::Binary(bytes)) => {
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            if event_tx.send(TransportEvent::Frame(text)).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            close_code = frame
                                .map(|f| u16::from(f.code))
                                .unwrap_or(CLOSE_ABNORMAL);
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::debug!("socket read error: {e}");
                            break;
                        }
                    }
                }
                reader_transport.open.store(false, Ordering::SeqCst);
                let _ = event_tx.send(TransportEvent::Closed { code: close_code }).await;
            });

            Ok((transport as Arc<dyn Transport>, event_rx))
        })
    }
}
