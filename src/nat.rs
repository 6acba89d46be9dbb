//! NAT table for UDP associations.
//!
//! One map carries both live upstream conns (keyed by the source endpoint
//! string) and creation gates (keyed with a `-lock` suffix) so that
//! load-or-store of a gate is a single atomic map operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::conn::PacketConn;

/// One-shot barrier for single-flight association creation.
///
/// The owner calls `open` exactly once; waiters parked in `wait` resume and
/// late waiters return immediately. The released flag closes the window
/// between a waiter registering and the owner notifying.
pub struct CreationGate {
    released: AtomicBool,
    notify: Notify,
}

impl CreationGate {
    pub fn new() -> Self {
        Self {
            released: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn open(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_open(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

impl Default for CreationGate {
    fn default() -> Self {
        Self::new()
    }
}

enum NatSlot {
    Conn(Arc<dyn PacketConn>),
    Gate(Arc<CreationGate>),
}

/// Concurrent keyed table of active upstream conns plus per-key creation
/// gates.
pub struct NatTable {
    slots: DashMap<String, NatSlot>,
}

impl NatTable {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    pub fn set(&self, key: String, conn: Arc<dyn PacketConn>) {
        self.slots.insert(key, NatSlot::Conn(conn));
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn PacketConn>> {
        match self.slots.get(key)?.value() {
            NatSlot::Conn(conn) => Some(Arc::clone(conn)),
            NatSlot::Gate(_) => None,
        }
    }

    pub fn remove(&self, key: &str) {
        self.slots.remove(key);
    }

    /// Atomic load-or-store of a creation gate under `key`.
    ///
    /// Returns `loaded == false` for exactly the one caller that installed
    /// the gate; every later caller gets `loaded == true` until the key is
    /// removed.
    pub fn get_or_create_gate(&self, key: &str) -> (Arc<CreationGate>, bool) {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(entry) => match entry.get() {
                NatSlot::Gate(gate) => (Arc::clone(gate), true),
                // A conn under a gate key means the keyspace was misused;
                // hand back an open gate so no caller parks forever.
                NatSlot::Conn(_) => {
                    let gate = Arc::new(CreationGate::new());
                    gate.open();
                    (gate, true)
                }
            },
            Entry::Vacant(slot) => {
                let gate = Arc::new(CreationGate::new());
                slot.insert(NatSlot::Gate(Arc::clone(&gate)));
                (gate, false)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new()
    }
}
