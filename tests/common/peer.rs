//! Test double for the sync peer contract.
//!
//! Records everything the server pushes at it and exposes waiting helpers
//! so tests can assert on delivered actions without racing the pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use synclog::server::SyncPeer;
use synclog::shared::{Action, Meta, ProtocolErrorKind};

pub struct TestPeer {
    pub node_id: String,
    pub subprotocol: String,
    connected: AtomicBool,
    accepted: AtomicBool,
    rejected: Mutex<Option<ProtocolErrorKind>>,
    sent: Mutex<Vec<(Action, Meta)>>,
    debug: Mutex<Vec<String>>,
}

impl TestPeer {
    pub fn new(node_id: &str, subprotocol: &str) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.to_string(),
            subprotocol: subprotocol.to_string(),
            connected: AtomicBool::new(true),
            accepted: AtomicBool::new(false),
            rejected: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            debug: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<(Action, Meta)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_actions(&self) -> Vec<Action> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(action, _)| action.clone())
            .collect()
    }

    pub fn debug_frames(&self) -> Vec<String> {
        self.debug.lock().unwrap().clone()
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn rejected_with(&self) -> Option<ProtocolErrorKind> {
        *self.rejected.lock().unwrap()
    }

    pub async fn wait_accepted(&self) {
        wait_until(|| self.is_accepted()).await;
    }

    pub async fn wait_rejected(&self) -> ProtocolErrorKind {
        wait_until(|| self.rejected_with().is_some()).await;
        self.rejected_with().unwrap()
    }

    pub async fn wait_for_actions(&self, count: usize) -> Vec<(Action, Meta)> {
        wait_until(|| self.sent.lock().unwrap().len() >= count).await;
        self.sent()
    }

    pub async fn wait_for_debug(&self, count: usize) -> Vec<String> {
        wait_until(|| self.debug.lock().unwrap().len() >= count).await;
        self.debug_frames()
    }
}

impl SyncPeer for TestPeer {
    fn send_action(&self, action: &Action, meta: &Meta) {
        self.sent
            .lock()
            .unwrap()
            .push((action.clone(), meta.clone()));
    }

    fn send_debug(&self, message: &str) {
        self.debug.lock().unwrap().push(message.to_string());
    }

    fn accept(&self) {
        self.accepted.store(true, Ordering::SeqCst);
    }

    fn reject(&self, kind: ProtocolErrorKind) {
        *self.rejected.lock().unwrap() = Some(kind);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Poll a condition until it holds, with a hard timeout
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}
