//! In-Memory Store
//!
//! Default [`Store`] implementation: a locked vector in insertion order plus
//! an id set for duplicate rejection. Linear scans are fine at the scale a
//! single server node keeps entries in memory.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::log::store::Store;
use crate::shared::{Action, Meta, MetaPatch};

/// In-memory log store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<(Action, Meta)>,
    ids: HashSet<String>,
    last_added: u64,
    last_sent: u64,
    last_received: u64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn add(&self, action: &Action, meta: &Meta) -> Option<Meta> {
        let mut inner = self.inner.lock().unwrap();
        if inner.ids.contains(&meta.id) {
            return None;
        }
        inner.last_added += 1;
        let mut stored = meta.clone();
        stored.added = Some(inner.last_added);
        inner.ids.insert(stored.id.clone());
        inner.entries.push((action.clone(), stored.clone()));
        Some(stored)
    }

    fn has(&self, id: &str) -> bool {
        self.inner.lock().unwrap().ids.contains(id)
    }

    fn change_meta(&self, id: &str, patch: &MetaPatch) -> bool {
        let mut inner = self.inner.lock().unwrap();
        for (_, meta) in inner.entries.iter_mut() {
            if meta.id == id {
                meta.apply(patch);
                return true;
            }
        }
        false
    }

    fn remove(&self, id: &str) -> Option<(Action, Meta)> {
        let mut inner = self.inner.lock().unwrap();
        let position = inner.entries.iter().position(|(_, meta)| meta.id == id)?;
        inner.ids.remove(id);
        Some(inner.entries.remove(position))
    }

    fn remove_reason(&self, reason: &str) -> Vec<(Action, Meta)> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(inner.entries.len());
        for (action, mut meta) in inner.entries.drain(..) {
            if meta.reasons.iter().any(|r| r == reason) {
                meta.reasons.retain(|r| r != reason);
                if meta.reasons.is_empty() {
                    inner.ids.remove(&meta.id);
                    removed.push((action, meta));
                    continue;
                }
            }
            kept.push((action, meta));
        }
        inner.entries = kept;
        removed
    }

    fn entries(&self) -> Vec<(Action, Meta)> {
        self.inner.lock().unwrap().entries.clone()
    }

    fn last_added(&self) -> u64 {
        self.inner.lock().unwrap().last_added
    }

    fn last_synced(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.last_sent, inner.last_received)
    }

    fn set_last_synced(&self, sent: Option<u64>, received: Option<u64>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(sent) = sent {
            inner.last_sent = sent;
        }
        if let Some(received) = received {
            inner.last_received = received;
        }
    }
}
