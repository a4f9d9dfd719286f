//! Document subscription multiplexer for the sync channel.
//!
//! Subscriptions are identified solely by their composite `collection:key`
//! string. Subscribing an existing, non-destroyed key returns the existing
//! handle with no network effect; concurrent duplicates share one in-flight
//! attempt (the key is reserved before the first suspension point, so
//! exactly one network subscribe is issued). A subscription that the server
//! rejects resolves to `None`, the missing sentinel, never an error.
//!
//! Across reconnects the multiplexer pauses every tracked subscription and,
//! synchronously before the fresh epoch's gate resolves, reissues the
//! subscribe request for every handle the server no longer considers
//! subscribed.
//!
//! The operational-transform library behind [`DocSession`] is deliberately
//! opaque: the multiplexer only drives handles, batches and lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::gate::GateCell;
use crate::supervisor::LinkHooks;
use crate::transport::Ready;

/// Load settlement of a remote document handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocLoad {
    Pending,
    Loaded,
    /// The server rejected the subscribe request.
    Missing,
    Destroyed,
}

/// Handle to one remote document, owned by the OT session.
pub trait RemoteDoc: Send + Sync {
    /// Issue (or reissue) the network subscribe request.
    fn subscribe(&self);
    /// Destroy the handle, unsubscribing on the wire.
    fn destroy(&self);
    /// Whether the server currently considers this document subscribed.
    fn is_subscribed(&self) -> bool;
    /// Watch for load settlement.
    fn load_state(&self) -> watch::Receiver<DocLoad>;
}

/// The OT connection bound to a document-sync channel.
pub trait DocSession: Send + Sync {
    fn open_doc(&self, collection: &str, key: &str) -> Arc<dyn RemoteDoc>;
    /// Start-batch marker framing a bulk operation.
    fn start_batch(&self);
    /// End-batch marker framing a bulk operation.
    fn end_batch(&self);
    /// Data-plane frame for the session's own decoder.
    fn handle_frame(&self, frame: &str);
    /// Application-level heartbeat via the sub-protocol's own primitive.
    fn ping(&self);
}

/// Local lifecycle of a tracked subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Subscribed,
    Paused,
    Destroyed,
}

type DocResult = Option<Arc<dyn RemoteDoc>>;

struct SubEntry {
    /// Distinguishes this entry from a later one under the same key.
    id: u64,
    state: SubscriptionState,
    doc: Option<Arc<dyn RemoteDoc>>,
    settled: watch::Sender<Option<DocResult>>,
}

/// The sole identity of a subscription within a channel.
pub fn composite_key(collection: &str, key: &str) -> String {
    format!("{collection}:{key}")
}

enum SubscribeRole {
    Existing(Arc<dyn RemoteDoc>),
    Follow(watch::Receiver<Option<DocResult>>),
    Lead(u64),
}

pub struct SubscriptionMultiplexer {
    session: Arc<dyn DocSession>,
    gate: Arc<GateCell<Ready>>,
    subs: Mutex<HashMap<String, SubEntry>>,
    entry_ids: AtomicU64,
}

impl SubscriptionMultiplexer {
    pub fn new(session: Arc<dyn DocSession>, gate: Arc<GateCell<Ready>>) -> Self {
        Self {
            session,
            gate,
            subs: Mutex::new(HashMap::new()),
            entry_ids: AtomicU64::new(0),
        }
    }

    /// Subscribe to `(collection, key)`. Resolves with the document handle,
    /// or `None` when the server rejects it or the channel is torn down.
    pub async fn subscribe(&self, collection: &str, key: &str) -> Option<Arc<dyn RemoteDoc>> {
        let composite = composite_key(collection, key);
        let role = {
            let mut subs = self.subs.lock().unwrap();
            match subs.get(&composite) {
                Some(entry) if entry.state != SubscriptionState::Destroyed => {
                    match (&entry.doc, entry.state) {
                        (Some(doc), SubscriptionState::Subscribed | SubscriptionState::Paused) => {
                            SubscribeRole::Existing(doc.clone())
                        }
                        _ => SubscribeRole::Follow(entry.settled.subscribe()),
                    }
                }
                _ => {
                    let (settled, _) = watch::channel(None);
                    let id = self.entry_ids.fetch_add(1, Ordering::Relaxed) + 1;
                    subs.insert(
                        composite.clone(),
                        SubEntry { id, state: SubscriptionState::Pending, doc: None, settled },
                    );
                    SubscribeRole::Lead(id)
                }
            }
        };

        match role {
            SubscribeRole::Existing(doc) => Some(doc),
            SubscribeRole::Follow(mut settled) => {
                match settled.wait_for(|slot| slot.is_some()).await {
                    Ok(slot) => (*slot).clone().flatten(),
                    Err(_) => None,
                }
            }
            SubscribeRole::Lead(id) => self.drive_subscribe(&composite, id, collection, key).await,
        }
    }

    async fn drive_subscribe(
        &self,
        composite: &str,
        id: u64,
        collection: &str,
        key: &str,
    ) -> Option<Arc<dyn RemoteDoc>> {
        if self.gate.wait().await.is_err() {
            self.settle_missing(composite, id);
            return None;
        }

        let doc = self.session.open_doc(collection, key);
        {
            let mut subs = self.subs.lock().unwrap();
            match subs.get_mut(composite) {
                Some(entry) if entry.id == id => entry.doc = Some(doc.clone()),
                // Torn down or replaced while awaiting the gate.
                _ => {
                    doc.destroy();
                    return None;
                }
            }
        }

        // Watch the load state before issuing the request: a handle may
        // settle synchronously inside subscribe(), and a settlement sent
        // with no receiver attached is lost.
        let mut load = doc.load_state();
        doc.subscribe();
        let outcome = load.wait_for(|state| *state != DocLoad::Pending).await.map(|s| *s);
        match outcome {
            Ok(DocLoad::Loaded) => {
                let mut subs = self.subs.lock().unwrap();
                if let Some(entry) = subs.get_mut(composite) {
                    if entry.id == id {
                        if entry.state == SubscriptionState::Pending {
                            entry.state = SubscriptionState::Subscribed;
                        }
                        let _ = entry.settled.send(Some(Some(doc.clone())));
                    }
                }
                Some(doc)
            }
            Ok(DocLoad::Destroyed) => {
                log::debug!("document {composite} destroyed while loading");
                self.settle_missing(composite, id);
                None
            }
            Ok(DocLoad::Missing) | Ok(DocLoad::Pending) | Err(_) => {
                log::debug!("subscription {composite} settled without a document");
                self.settle_missing(composite, id);
                doc.destroy();
                None
            }
        }
    }

    /// Settle an entry's waiters with the missing sentinel and drop the
    /// entry, so a later subscribe for the same key starts fresh.
    fn settle_missing(&self, composite: &str, id: u64) {
        let mut subs = self.subs.lock().unwrap();
        if subs.get(composite).is_some_and(|entry| entry.id == id) {
            if let Some(entry) = subs.remove(composite) {
                let _ = entry.settled.send(Some(None));
            }
        }
    }

    /// Unsubscribe `(collection, key)`. A no-op when the key is untracked.
    pub async fn unsubscribe(&self, collection: &str, key: &str) {
        let composite = composite_key(collection, key);
        let (id, doc) = {
            let mut subs = self.subs.lock().unwrap();
            match subs.get_mut(&composite) {
                Some(entry) if entry.state != SubscriptionState::Destroyed => {
                    entry.state = SubscriptionState::Destroyed;
                    (entry.id, entry.doc.clone())
                }
                _ => return,
            }
        };
        let _ = self.gate.wait().await;
        if let Some(doc) = doc {
            doc.destroy();
        }
        let mut subs = self.subs.lock().unwrap();
        if subs.get(&composite).is_some_and(|entry| entry.id == id) {
            if let Some(entry) = subs.remove(&composite) {
                let _ = entry.settled.send(Some(None));
            }
        }
    }

    /// Subscribe a batch. The gate is awaited once, the batch is framed by
    /// exactly one start and one end marker (whatever N, zero included), and
    /// the individual subscribes interleave freely in between. Externally
    /// equivalent to N independent calls.
    pub async fn bulk_subscribe(
        &self,
        list: &[(String, String)],
    ) -> Vec<Option<Arc<dyn RemoteDoc>>> {
        if self.gate.wait().await.is_err() {
            return list.iter().map(|_| None).collect();
        }
        self.session.start_batch();
        let results = futures_util::future::join_all(
            list.iter().map(|(collection, key)| self.subscribe(collection, key)),
        )
        .await;
        self.session.end_batch();
        results
    }

    /// Unsubscribe a batch, framed like [`Self::bulk_subscribe`].
    pub async fn bulk_unsubscribe(&self, list: &[(String, String)]) {
        if self.gate.wait().await.is_err() {
            return;
        }
        self.session.start_batch();
        futures_util::future::join_all(
            list.iter().map(|(collection, key)| self.unsubscribe(collection, key)),
        )
        .await;
        self.session.end_batch();
    }

    /// Mark every live subscription paused. Invoked when the transport drops.
    pub fn pause_all(&self) {
        let mut subs = self.subs.lock().unwrap();
        for entry in subs.values_mut() {
            if entry.state == SubscriptionState::Subscribed {
                entry.state = SubscriptionState::Paused;
            }
        }
    }

    /// Resume protocol: reissue the subscribe request for every tracked,
    /// non-destroyed handle the server no longer considers subscribed, and
    /// flip paused entries back to subscribed. Runs synchronously before the
    /// reconnect's gate resolves.
    pub fn resume(&self) {
        let mut subs = self.subs.lock().unwrap();
        let mut reissued = 0usize;
        for entry in subs.values_mut() {
            if entry.state == SubscriptionState::Destroyed {
                continue;
            }
            if let Some(doc) = &entry.doc {
                if !doc.is_subscribed() {
                    doc.subscribe();
                    reissued += 1;
                }
            }
            if entry.state == SubscriptionState::Paused {
                entry.state = SubscriptionState::Subscribed;
            }
        }
        if reissued > 0 {
            log::info!("resumed {reissued} document subscriptions");
        }
    }

    /// Permanent teardown: destroy every tracked handle and clear the
    /// registry. Not a pause.
    pub fn teardown(&self) {
        let mut subs = self.subs.lock().unwrap();
        for (_, entry) in subs.drain() {
            if let Some(doc) = &entry.doc {
                doc.destroy();
            }
            let _ = entry.settled.send(Some(None));
        }
    }

    /// Local state of a tracked key, if any.
    pub fn state_of(&self, collection: &str, key: &str) -> Option<SubscriptionState> {
        let subs = self.subs.lock().unwrap();
        subs.get(&composite_key(collection, key)).map(|entry| entry.state)
    }

    pub fn tracked(&self) -> usize {
        self.subs.lock().unwrap().len()
    }
}

impl LinkHooks for SubscriptionMultiplexer {
    fn on_suspend(&self) {
        self.pause_all();
    }

    fn on_resume(&self) {
        self.resume();
    }

    fn on_teardown(&self) {
        self.teardown();
    }
}
