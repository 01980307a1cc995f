//! Log
//!
//! The log owns the store, the id clock, and the two dispatch points the
//! server core hooks into:
//!
//! - **preadd** - a synchronous hook that may mutate meta before the entry
//!   is inserted (the core uses it to stamp `server`, `status` and
//!   `subprotocol` and to normalize addressing)
//! - **add / clean events** - sent over an mpsc channel to a single
//!   dispatcher task, which serializes log-event handling the way the rest
//!   of the server expects
//!
//! Duplicate ids are rejected by the store; `add` returns `None` for them.

use std::sync::{Mutex, OnceLock};

use tokio::sync::mpsc;

use crate::log::store::Store;
use crate::shared::{Action, Meta, MetaPatch};

/// Synchronous hook run before an entry is inserted
pub type PreaddHook = Box<dyn Fn(&Action, &mut Meta) + Send + Sync>;

/// Log event delivered to the dispatcher task
#[derive(Debug, Clone)]
pub enum LogEvent {
    /// An entry was inserted
    Add {
        /// The inserted action
        action: Action,
        /// Meta as stored, with `added` assigned
        meta: Meta,
    },
    /// An entry lost its last reason and was removed
    Clean {
        /// The removed action
        action: Action,
        /// Meta at removal time
        meta: Meta,
    },
}

/// Source of logical time for id generation.
///
/// The default reads the wall clock in milliseconds; tests inject a
/// deterministic counter instead.
pub trait TimeSource: Send + Sync {
    /// Current logical time in milliseconds
    fn now_ms(&self) -> i64;
}

/// Wall-clock time source
pub struct SystemTime;

impl TimeSource for SystemTime {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Deterministic test clock: starts at zero, each call advances by one
#[derive(Default)]
pub struct TestTime {
    last: Mutex<i64>,
}

impl TestTime {
    /// Create a clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeSource for TestTime {
    fn now_ms(&self) -> i64 {
        let mut last = self.last.lock().unwrap();
        *last += 1;
        *last
    }
}

struct Clock {
    source: Box<dyn TimeSource>,
    state: Mutex<(i64, u64)>,
}

impl Clock {
    fn new(source: Box<dyn TimeSource>) -> Self {
        Self {
            source,
            state: Mutex::new((0, 0)),
        }
    }

    /// Next unique `(counter, seq)` pair. Repeated calls within one
    /// millisecond bump the sequence instead of the counter.
    fn tick(&self) -> (i64, u64) {
        let now = self.source.now_ms();
        let mut state = self.state.lock().unwrap();
        if now <= state.0 {
            state.1 += 1;
        } else {
            *state = (now, 0);
        }
        (state.0.max(now), state.1)
    }

    fn now(&self) -> i64 {
        self.source.now_ms()
    }
}

/// Append-only action log with preadd hook and event dispatch
pub struct Log {
    store: Box<dyn Store>,
    clock: Clock,
    node_id: String,
    preadd: OnceLock<PreaddHook>,
    events_tx: mpsc::UnboundedSender<LogEvent>,
}

impl Log {
    /// Create a log over the given store.
    ///
    /// Returns the log plus the receiving end of its event channel; the
    /// server core moves the receiver into its dispatcher task.
    pub fn new(
        store: Box<dyn Store>,
        time: Box<dyn TimeSource>,
        node_id: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<LogEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let log = Self {
            store,
            clock: Clock::new(time),
            node_id: node_id.into(),
            preadd: OnceLock::new(),
            events_tx,
        };
        (log, events_rx)
    }

    /// Install the preadd hook. May be called once.
    pub fn set_preadd(&self, hook: PreaddHook) {
        if self.preadd.set(hook).is_err() {
            panic!("preadd hook was already installed");
        }
    }

    /// Generate a fresh action id for this node
    pub fn generate_id(&self) -> String {
        let (counter, seq) = self.clock.tick();
        format!("{counter} {} {seq}", self.node_id)
    }

    /// Append an entry.
    ///
    /// Fills in `id` and `time` when absent, runs the preadd hook, inserts
    /// into the store and emits an `Add` event. Returns the stored meta, or
    /// `None` when the id was already present.
    pub fn add(&self, action: Action, mut meta: Meta) -> Option<Meta> {
        if meta.id.is_empty() {
            let (counter, seq) = self.clock.tick();
            meta.id = format!("{counter} {} {seq}", self.node_id);
            if meta.time == 0 {
                meta.time = counter;
            }
        }
        if meta.time == 0 {
            meta.time = self.clock.now();
        }
        if let Some(hook) = self.preadd.get() {
            hook(&action, &mut meta);
        }
        let stored = self.store.add(&action, &meta)?;
        let _ = self.events_tx.send(LogEvent::Add {
            action,
            meta: stored.clone(),
        });
        Some(stored)
    }

    /// Patch the meta of a stored entry
    pub fn change_meta(&self, id: &str, patch: &MetaPatch) -> bool {
        self.store.change_meta(id, patch)
    }

    /// Whether an entry with this id exists
    pub fn has(&self, id: &str) -> bool {
        self.store.has(id)
    }

    /// Strip a retention reason; entries left with no reasons are removed
    /// and emit `Clean` events
    pub fn remove_reason(&self, reason: &str) {
        for (action, meta) in self.store.remove_reason(reason) {
            let _ = self.events_tx.send(LogEvent::Clean { action, meta });
        }
    }

    /// All entries in insertion order
    pub fn entries(&self) -> Vec<(Action, Meta)> {
        self.store.entries()
    }

    /// Actions only, in insertion order. Test-friendly view of the log.
    pub fn actions(&self) -> Vec<Action> {
        self.store
            .entries()
            .into_iter()
            .map(|(action, _)| action)
            .collect()
    }

    /// The highest `added` index handed out so far
    pub fn last_added(&self) -> u64 {
        self.store.last_added()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::memory::MemoryStore;
    use crate::shared::ActionStatus;

    fn test_log() -> (Log, mpsc::UnboundedReceiver<LogEvent>) {
        Log::new(
            Box::new(MemoryStore::new()),
            Box::new(TestTime::new()),
            "server:test",
        )
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let (log, _rx) = test_log();
        let a = log.generate_id();
        let b = log.generate_id();
        assert_ne!(a, b);
        assert!(a.contains(" server:test "));
    }

    #[test]
    fn test_add_fills_id_and_time() {
        let (log, mut rx) = test_log();
        let meta = log.add(Action::new("test/a"), Meta::default()).unwrap();
        assert!(!meta.id.is_empty());
        assert!(meta.time > 0);
        assert_eq!(meta.added, Some(1));

        match rx.try_recv().unwrap() {
            LogEvent::Add { meta: event_meta, .. } => assert_eq!(event_meta, meta),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_add_returns_none() {
        let (log, mut rx) = test_log();
        let meta = Meta::with_id("1 10:uuid 0");
        assert!(log.add(Action::new("test/a"), meta.clone()).is_some());
        assert!(log.add(Action::new("test/a"), meta).is_none());

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_preadd_mutates_before_insert() {
        let (log, _rx) = test_log();
        log.set_preadd(Box::new(|_, meta| {
            meta.status = Some(ActionStatus::Waiting);
        }));
        let meta = log.add(Action::new("test/a"), Meta::default()).unwrap();
        assert_eq!(meta.status, Some(ActionStatus::Waiting));
        assert_eq!(log.entries()[0].1.status, Some(ActionStatus::Waiting));
    }

    #[test]
    fn test_remove_reason_emits_clean() {
        let (log, mut rx) = test_log();
        let mut meta = Meta::default();
        meta.reasons = vec!["keep".into()];
        log.add(Action::new("test/a"), meta).unwrap();
        let _ = rx.try_recv();

        log.remove_reason("keep");
        match rx.try_recv().unwrap() {
            LogEvent::Clean { action, .. } => assert_eq!(action.type_name, "test/a"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(log.entries().is_empty());
    }
}
