//! Readiness gate: a single-resolution slot gating every operation that
//! needs a live, authenticated transport.
//!
//! One gate exists per transport epoch. When the transport drops, the gate is
//! replaced wholesale with a fresh pending instance *before* a retry is
//! scheduled, so a caller that starts waiting during the gap binds to the new
//! epoch and can never observe the dead transport. Resolutions carrying a
//! stale epoch are detected and discarded.
//!
//! Unlike the promise it replaces, a gate that is still pending when the
//! channel permanently disconnects is rejected with
//! [`ChannelError::Disconnected`] instead of stranding its waiters; see
//! DESIGN.md.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::error::ChannelError;

pub type GateResult<T> = Result<T, ChannelError>;

/// One epoch's resolution slot. Settles exactly once.
pub struct ReadyGate<T: Clone> {
    epoch: u64,
    slot: watch::Sender<Option<GateResult<T>>>,
}

impl<T: Clone> ReadyGate<T> {
    fn new(epoch: u64) -> Self {
        let (slot, _) = watch::channel(None);
        Self { epoch, slot }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Settle the gate. Returns false if it was already settled.
    pub fn settle(&self, value: GateResult<T>) -> bool {
        let mut pending = Some(value);
        let mut settled = false;
        self.slot.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = pending.take();
                settled = true;
                true
            } else {
                false
            }
        });
        settled
    }

    /// The resolved value, if the gate settled successfully.
    pub fn try_ready(&self) -> Option<T> {
        match &*self.slot.borrow() {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Suspend until the gate settles.
    pub async fn wait(&self) -> GateResult<T> {
        let mut rx = self.slot.subscribe();
        // The Ref returned by wait_for borrows rx; copy the value out before
        // rx drops.
        let settled = match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        settled.unwrap_or(Err(ChannelError::Disconnected))
    }
}

/// Holder of the current epoch's gate.
pub struct GateCell<T: Clone> {
    current: Mutex<Arc<ReadyGate<T>>>,
    epochs: AtomicU64,
}

impl<T: Clone> GateCell<T> {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Arc::new(ReadyGate::new(1))),
            epochs: AtomicU64::new(1),
        }
    }

    pub fn current(&self) -> Arc<ReadyGate<T>> {
        self.current.lock().unwrap().clone()
    }

    /// Swap in a fresh pending gate for the next epoch. The old gate is
    /// abandoned unresolved; late resolutions against it are discarded by
    /// the epoch check in [`GateCell::resolve`].
    pub fn replace(&self) -> Arc<ReadyGate<T>> {
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let fresh = Arc::new(ReadyGate::new(epoch));
        *self.current.lock().unwrap() = fresh.clone();
        fresh
    }

    /// Resolve the current gate, but only if `epoch` still matches.
    /// Returns false for stale generations.
    pub fn resolve(&self, epoch: u64, value: T) -> bool {
        let gate = self.current();
        if gate.epoch() != epoch {
            return false;
        }
        gate.settle(Ok(value))
    }

    /// Reject the current gate, waking every parked waiter with an error.
    pub fn reject(&self, error: ChannelError) -> bool {
        self.current().settle(Err(error))
    }

    pub fn try_ready(&self) -> Option<T> {
        self.current().try_ready()
    }

    /// Suspend on the gate that is current at the moment of the call.
    pub async fn wait(&self) -> GateResult<T> {
        let gate = self.current();
        gate.wait().await
    }
}

impl<T: Clone> Default for GateCell<T> {
    fn default() -> Self {
        Self::new()
    }
}
