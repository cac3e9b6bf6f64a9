//! Issuance deduplication
//!
//! 🔒 At most one issuance per certificate name is in flight. Later callers
//! get a [`watch::Receiver`] that resolves once the owner's guard drops.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Result of trying to become the issuer for a name
pub enum ObtainSlot {
    /// We own the issuance; dropping the guard releases waiters
    Owner(ObtainGuard),
    /// Someone else is issuing; wait on this
    Busy(watch::Receiver<()>),
}

/// Registry of in-flight issuances
#[derive(Default)]
pub struct ObtainLocks {
    inflight: Mutex<HashMap<String, watch::Receiver<()>>>,
}

impl ObtainLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `name`, or learn who to wait for.
    pub fn acquire(self: &Arc<Self>, name: &str) -> ObtainSlot {
        let mut inflight = self.inflight.lock();
        if let Some(rx) = inflight.get(name) {
            return ObtainSlot::Busy(rx.clone());
        }
        let (tx, rx) = watch::channel(());
        inflight.insert(name.to_string(), rx);
        ObtainSlot::Owner(ObtainGuard {
            locks: Arc::clone(self),
            name: name.to_string(),
            _release: tx,
        })
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.inflight.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve once the current owner of `rx` has released.
    pub async fn wait(mut rx: watch::Receiver<()>) {
        // the sender is never used to send, only dropped
        while rx.changed().await.is_ok() {}
    }
}

/// Held by the issuing task for the duration of one attempt
pub struct ObtainGuard {
    locks: Arc<ObtainLocks>,
    name: String,
    _release: watch::Sender<()>,
}

impl Drop for ObtainGuard {
    fn drop(&mut self) {
        self.locks.inflight.lock().remove(&self.name);
        tracing::debug!("🔓 Released obtain lock for {}", self.name);
    }
}
