//! Inbound frame classification and the gated outbound path.
//!
//! Every inbound frame is tested in order: heartbeat replies are swallowed
//! before any decoding, registered control lines dispatch to their named
//! handler and never reach the data plane, and everything else is forwarded
//! unchanged to the variant's own decoder (the OT session for document sync,
//! the JSON event decoder for presence/events).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ChannelError;
use crate::gate::GateCell;
use crate::protocol::ControlLine;
use crate::transport::Ready;

pub type ControlHandler = Box<dyn Fn(ControlLine) + Send + Sync>;
pub type DataHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Demultiplexes every inbound frame for the lifetime of a transport.
pub struct MessageRouter {
    heartbeat_reply: Option<String>,
    control: HashMap<String, ControlHandler>,
    data: DataHandler,
}

impl MessageRouter {
    pub fn new(data: DataHandler) -> Self {
        Self {
            heartbeat_reply: None,
            control: HashMap::new(),
            data,
        }
    }

    /// Reserved payload recognized and swallowed before general decoding.
    pub fn with_heartbeat_reply(mut self, reply: impl Into<String>) -> Self {
        self.heartbeat_reply = Some(reply.into());
        self
    }

    /// Register a named control handler.
    pub fn on_control(mut self, name: impl Into<String>, handler: ControlHandler) -> Self {
        self.control.insert(name.into(), handler);
        self
    }

    /// Route one inbound frame. A control-shaped frame whose tag has no
    /// registered handler falls through to the data plane, since data
    /// payloads may legally contain the delimiter.
    pub fn route(&self, frame: &str) {
        if self.heartbeat_reply.as_deref() == Some(frame) {
            return;
        }
        if let Some(line) = ControlLine::parse(frame) {
            if let Some(handler) = self.control.get(&line.name) {
                handler(line);
                return;
            }
        }
        (self.data)(frame);
    }
}

/// Outbound send facade. Writes straight to the transport while it is open;
/// otherwise re-routes through the current epoch's readiness gate and writes
/// to the transport captured from it. This covers a sub-protocol writing
/// immediately after being bound to a transport that has not finished its
/// open sequence: the payload is queued on the gate, not dropped.
///
/// Two sends issued while the transport is down each re-await the gate
/// independently; no ordering is guaranteed between them.
#[derive(Clone)]
pub struct Outbound {
    gate: Arc<GateCell<Ready>>,
}

impl Outbound {
    pub fn new(gate: Arc<GateCell<Ready>>) -> Self {
        Self { gate }
    }

    pub async fn send(&self, frame: &str) -> Result<(), ChannelError> {
        if let Some(ready) = self.gate.try_ready() {
            if ready.transport.is_open() {
                return ready.transport.send(frame);
            }
        }
        let ready = self.gate.wait().await?;
        ready.transport.send(frame)
    }
}
