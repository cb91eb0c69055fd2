//! Shared helpers for proxy integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use arbor_access::{DataNode, Response, TransactionId, TransactionRequest, TreePath};
use arbor_client::proxy::{ConnectionEntry, ProxyParent, ProxyTransaction};

/// Lifecycle notification recorded by the test parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParentEvent {
    Sealed(TransactionId),
    Aborted(TransactionId),
    Completed(TransactionId),
}

/// Test double for the parent history: queues outgoing requests and records
/// lifecycle notifications. Entries stay queued until a test delivers a
/// response, mirroring a connection that releases entries on completion.
#[derive(Default)]
pub struct RecordingParent {
    queue: Mutex<VecDeque<ConnectionEntry>>,
    events: Mutex<Vec<ParentEvent>>,
}

impl RecordingParent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Pop the oldest queued entry. Panics if nothing was sent.
    pub fn pop(&self) -> ConnectionEntry {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .expect("no queued request")
    }

    /// Deliver `response` to the oldest queued entry, returning the request
    /// it answered. The callback runs with the queue unlocked.
    pub fn respond(&self, response: Response) -> TransactionRequest {
        let entry = self.pop();
        let request = entry.request.clone();
        (entry.callback)(response);
        request
    }

    /// Detach the queued entries, e.g. to hand them to `replay_messages`.
    pub fn take_queue(&self) -> VecDeque<ConnectionEntry> {
        std::mem::take(&mut *self.queue.lock().unwrap())
    }

    pub fn events(&self) -> Vec<ParentEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProxyParent for RecordingParent {
    fn send_request(&self, entry: ConnectionEntry) {
        self.queue.lock().unwrap().push_back(entry);
    }

    fn on_transaction_sealed(&self, target: TransactionId) {
        self.events
            .lock()
            .unwrap()
            .push(ParentEvent::Sealed(target));
    }

    fn abort_transaction(&self, target: TransactionId) {
        self.events
            .lock()
            .unwrap()
            .push(ParentEvent::Aborted(target));
    }

    fn complete_transaction(&self, target: TransactionId) {
        self.events
            .lock()
            .unwrap()
            .push(ParentEvent::Completed(target));
    }
}

pub fn tx(counter: u64) -> TransactionId {
    TransactionId::new(7, counter)
}

pub fn path(segment: &str) -> TreePath {
    TreePath::new([segment])
}

pub fn node(bytes: &[u8]) -> DataNode {
    DataNode::new(bytes.to_vec())
}

pub fn remote_proxy(parent: &Arc<RecordingParent>, counter: u64) -> Arc<ProxyTransaction> {
    ProxyTransaction::new_remote(Arc::clone(parent) as Arc<dyn ProxyParent>, tx(counter))
}

pub fn local_proxy(
    parent: &Arc<RecordingParent>,
    counter: u64,
    snapshot: BTreeMap<TreePath, DataNode>,
) -> Arc<ProxyTransaction> {
    ProxyTransaction::new_local(
        Arc::clone(parent) as Arc<dyn ProxyParent>,
        tx(counter),
        snapshot,
    )
}

pub fn snapshot_proxy(
    parent: &Arc<RecordingParent>,
    counter: u64,
    snapshot: BTreeMap<TreePath, DataNode>,
) -> Arc<ProxyTransaction> {
    ProxyTransaction::new_snapshot(
        Arc::clone(parent) as Arc<dyn ProxyParent>,
        tx(counter),
        snapshot,
    )
}
