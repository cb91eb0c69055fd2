//! Backend capability seam and the three adapter flavors.
//!
//! A proxy decides at creation time whether it operates on a local snapshot
//! (`SnapshotAdapter`, `LocalAdapter`) or talks to the shard leader through
//! the message queue (`RemoteAdapter`); once that decision is made we are
//! stuck with it for the life of the proxy. Reconnects install a fresh
//! proxy, which may pick a different flavor.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use arbor_access::{
    DataNode, PersistenceProtocol, RequestPayload, Response, TransactionRequest, TreeOperation,
    TreePath,
};
use tokio::sync::oneshot;
use tracing::debug;

use super::transaction::ProxyTransaction;
use super::types::{ProxyError, ResponseCallback};

/// Future handed to callers of `read`/`exists`/`direct_commit`.
pub type ReadFuture<T> = oneshot::Receiver<Result<T, ProxyError>>;

/// Operations a concrete backend flavor supplies to the proxy core.
///
/// `proxy` is always the transaction this adapter belongs to; adapters reach
/// sequencing, the request log, and the wire through it.
pub trait BackendAdapter: Send + Sync {
    /// Read-only proxies reject mutations and commits up front.
    fn is_snapshot_only(&self) -> bool;

    fn do_read(&self, proxy: &ProxyTransaction, path: &TreePath) -> ReadFuture<Option<DataNode>>;
    fn do_exists(&self, proxy: &ProxyTransaction, path: &TreePath) -> ReadFuture<bool>;

    fn do_write(&self, proxy: &ProxyTransaction, path: &TreePath, data: DataNode);
    fn do_merge(&self, proxy: &ProxyTransaction, path: &TreePath, data: DataNode);
    fn do_delete(&self, proxy: &ProxyTransaction, path: &TreePath);

    /// Finalize buffered operations. The core invokes this exactly once.
    fn do_seal(&self, proxy: &ProxyTransaction);

    /// Emit the abort-equivalent for an unsealed transaction.
    fn do_abort(&self, proxy: &ProxyTransaction);

    /// Transfer residual adapter state so the successor can itself be
    /// sealed. Runs while the predecessor's fast paths are fenced off.
    fn flush_state(&self, proxy: &ProxyTransaction, successor: &Arc<ProxyTransaction>);

    /// Build the commit-phase request. Called at most once per proxy.
    fn commit_request(&self, proxy: &ProxyTransaction, coordinated: bool) -> TransactionRequest;

    /// Accept a request replayed from a predecessor, re-sequencing it under
    /// this proxy's allocator.
    fn handle_forwarded_remote_request(
        &self,
        proxy: &ProxyTransaction,
        request: TransactionRequest,
        callback: ResponseCallback,
    );

    /// Re-target an in-flight request of this adapter at a local successor.
    fn forward_to_local(
        &self,
        proxy: &ProxyTransaction,
        successor: &Arc<ProxyTransaction>,
        request: TransactionRequest,
        callback: ResponseCallback,
    );

    /// Re-target an in-flight request of this adapter at a remote successor.
    fn forward_to_remote(
        &self,
        proxy: &ProxyTransaction,
        successor: &Arc<ProxyTransaction>,
        request: TransactionRequest,
        callback: ResponseCallback,
    );
}

/// Storage for the adapter flavor. Successor dispatch during replay matches
/// on the variant; anything other than local/remote cannot take over a
/// transaction.
pub enum Backend {
    Snapshot(SnapshotAdapter),
    Local(LocalAdapter),
    Remote(RemoteAdapter),
}

impl Deref for Backend {
    type Target = dyn BackendAdapter + 'static;

    fn deref(&self) -> &Self::Target {
        match self {
            Backend::Snapshot(adapter) => adapter,
            Backend::Local(adapter) => adapter,
            Backend::Remote(adapter) => adapter,
        }
    }
}

fn immediate<T: Send + 'static>(value: Result<T, ProxyError>) -> ReadFuture<T> {
    let (sender, receiver) = oneshot::channel();
    let _ = sender.send(value);
    receiver
}

/// Read-only view over a snapshot of the data tree.
pub struct SnapshotAdapter {
    snapshot: BTreeMap<TreePath, DataNode>,
}

impl SnapshotAdapter {
    pub fn new(snapshot: BTreeMap<TreePath, DataNode>) -> Self {
        Self { snapshot }
    }
}

impl BackendAdapter for SnapshotAdapter {
    fn is_snapshot_only(&self) -> bool {
        true
    }

    fn do_read(&self, _proxy: &ProxyTransaction, path: &TreePath) -> ReadFuture<Option<DataNode>> {
        immediate(Ok(self.snapshot.get(path).cloned()))
    }

    fn do_exists(&self, _proxy: &ProxyTransaction, path: &TreePath) -> ReadFuture<bool> {
        immediate(Ok(self.snapshot.contains_key(path)))
    }

    fn do_write(&self, _proxy: &ProxyTransaction, _path: &TreePath, _data: DataNode) {
        unreachable!("mutation on a read-only snapshot")
    }

    fn do_merge(&self, _proxy: &ProxyTransaction, _path: &TreePath, _data: DataNode) {
        unreachable!("mutation on a read-only snapshot")
    }

    fn do_delete(&self, _proxy: &ProxyTransaction, _path: &TreePath) {
        unreachable!("mutation on a read-only snapshot")
    }

    fn do_seal(&self, _proxy: &ProxyTransaction) {
        // Nothing buffered.
    }

    fn do_abort(&self, proxy: &ProxyTransaction) {
        proxy.send_abort(Box::new(|_response| {}));
    }

    fn flush_state(&self, _proxy: &ProxyTransaction, _successor: &Arc<ProxyTransaction>) {
        // Nothing to transfer.
    }

    fn commit_request(&self, proxy: &ProxyTransaction, _coordinated: bool) -> TransactionRequest {
        unreachable!("read-only snapshot {} cannot commit", proxy.id())
    }

    fn handle_forwarded_remote_request(
        &self,
        _proxy: &ProxyTransaction,
        request: TransactionRequest,
        callback: ResponseCallback,
    ) {
        match request.payload {
            RequestPayload::Read { path } => callback(Response::ReadSuccess {
                data: self.snapshot.get(&path).cloned(),
            }),
            RequestPayload::Exists { path } => callback(Response::ExistsSuccess {
                present: self.snapshot.contains_key(&path),
            }),
            other => panic!("read-only snapshot cannot accept {other:?}"),
        }
    }

    fn forward_to_local(
        &self,
        _proxy: &ProxyTransaction,
        successor: &Arc<ProxyTransaction>,
        request: TransactionRequest,
        callback: ResponseCallback,
    ) {
        successor.handle_forwarded_remote_request(request, callback);
    }

    fn forward_to_remote(
        &self,
        _proxy: &ProxyTransaction,
        successor: &Arc<ProxyTransaction>,
        request: TransactionRequest,
        callback: ResponseCallback,
    ) {
        successor.handle_forwarded_remote_request(request, callback);
    }
}

/// Read-write proxy operating on a local copy of the shard's data tree.
///
/// Mutations land in an ordered overlay; the whole modification batch
/// travels in a single commit-local request. Merge semantics belong to the
/// backend, so local reads approximate a merge as a replacement.
pub struct LocalAdapter {
    snapshot: BTreeMap<TreePath, DataNode>,
    overlay: Mutex<Overlay>,
}

#[derive(Default)]
struct Overlay {
    operations: Vec<TreeOperation>,
    sealed: bool,
}

impl LocalAdapter {
    pub fn new(snapshot: BTreeMap<TreePath, DataNode>) -> Self {
        Self {
            snapshot,
            overlay: Mutex::new(Overlay::default()),
        }
    }

    fn push(&self, operation: TreeOperation) {
        self.overlay
            .lock()
            .expect("overlay poisoned")
            .operations
            .push(operation);
    }

    pub(super) fn replay_operations(&self, operations: Vec<TreeOperation>) {
        self.overlay
            .lock()
            .expect("overlay poisoned")
            .operations
            .extend(operations);
    }

    /// Value at `path` with the overlay applied on top of the snapshot.
    fn effective(&self, path: &TreePath) -> Option<DataNode> {
        let overlay = self.overlay.lock().expect("overlay poisoned");
        let mut current = self.snapshot.get(path).cloned();
        for operation in &overlay.operations {
            if operation.path() != path {
                continue;
            }
            current = match operation {
                TreeOperation::Write { data, .. } | TreeOperation::Merge { data, .. } => {
                    Some(data.clone())
                }
                TreeOperation::Delete { .. } => None,
            };
        }
        current
    }

    fn take_operations(&self) -> Vec<TreeOperation> {
        std::mem::take(
            &mut self
                .overlay
                .lock()
                .expect("overlay poisoned")
                .operations,
        )
    }
}

impl BackendAdapter for LocalAdapter {
    fn is_snapshot_only(&self) -> bool {
        false
    }

    fn do_read(&self, _proxy: &ProxyTransaction, path: &TreePath) -> ReadFuture<Option<DataNode>> {
        immediate(Ok(self.effective(path)))
    }

    fn do_exists(&self, _proxy: &ProxyTransaction, path: &TreePath) -> ReadFuture<bool> {
        immediate(Ok(self.effective(path).is_some()))
    }

    fn do_write(&self, _proxy: &ProxyTransaction, path: &TreePath, data: DataNode) {
        self.push(TreeOperation::Write {
            path: path.clone(),
            data,
        });
    }

    fn do_merge(&self, _proxy: &ProxyTransaction, path: &TreePath, data: DataNode) {
        self.push(TreeOperation::Merge {
            path: path.clone(),
            data,
        });
    }

    fn do_delete(&self, _proxy: &ProxyTransaction, path: &TreePath) {
        self.push(TreeOperation::Delete { path: path.clone() });
    }

    fn do_seal(&self, _proxy: &ProxyTransaction) {
        self.overlay.lock().expect("overlay poisoned").sealed = true;
    }

    fn do_abort(&self, proxy: &ProxyTransaction) {
        proxy.send_abort(Box::new(|_response| {}));
    }

    fn flush_state(&self, proxy: &ProxyTransaction, successor: &Arc<ProxyTransaction>) {
        let operations = self.take_operations();
        if operations.is_empty() {
            return;
        }
        debug!(
            id = %proxy.id(),
            successor = %successor.id(),
            operations = operations.len(),
            "transferring buffered operations"
        );
        match successor.backend() {
            Backend::Local(local) => local.replay_operations(operations),
            Backend::Remote(remote) => remote.replay_operations(operations),
            Backend::Snapshot(_) => panic!("{successor:?} cannot accept transferred state"),
        }
    }

    fn commit_request(&self, proxy: &ProxyTransaction, coordinated: bool) -> TransactionRequest {
        TransactionRequest {
            target: proxy.id(),
            sequence: proxy.next_sequence(),
            payload: RequestPayload::CommitLocal {
                modifications: self.take_operations(),
                coordinated,
            },
        }
    }

    fn handle_forwarded_remote_request(
        &self,
        proxy: &ProxyTransaction,
        request: TransactionRequest,
        callback: ResponseCallback,
    ) {
        match request.payload {
            RequestPayload::Read { path } => callback(Response::ReadSuccess {
                data: self.effective(&path),
            }),
            RequestPayload::Exists { path } => callback(Response::ExistsSuccess {
                present: self.effective(&path).is_some(),
            }),
            RequestPayload::Modify {
                operations,
                protocol,
            } => {
                self.replay_operations(operations);
                match protocol {
                    PersistenceProtocol::Ready => {
                        let _ = proxy.ensure_sealed();
                        callback(Response::ModifySuccess);
                    }
                    PersistenceProtocol::Simple => {
                        let _ = proxy.ensure_sealed();
                        let request = self.commit_request(proxy, false);
                        proxy.send_request(request, callback);
                    }
                    PersistenceProtocol::ThreePhase => {
                        let _ = proxy.ensure_sealed();
                        let request = self.commit_request(proxy, true);
                        proxy.send_request(request, callback);
                    }
                    PersistenceProtocol::Abort => proxy.send_abort(callback),
                }
            }
            RequestPayload::CommitLocal {
                modifications,
                coordinated,
            } => {
                self.replay_operations(modifications);
                let _ = proxy.ensure_sealed();
                let request = self.commit_request(proxy, coordinated);
                proxy.send_request(request, callback);
            }
            payload @ (RequestPayload::Abort
            | RequestPayload::PreCommit
            | RequestPayload::DoCommit
            | RequestPayload::Purge) => {
                let request = TransactionRequest {
                    target: proxy.id(),
                    sequence: proxy.next_sequence(),
                    payload,
                };
                proxy.send_request(request, callback);
            }
        }
    }

    fn forward_to_local(
        &self,
        _proxy: &ProxyTransaction,
        successor: &Arc<ProxyTransaction>,
        request: TransactionRequest,
        callback: ResponseCallback,
    ) {
        successor.handle_forwarded_remote_request(request, callback);
    }

    fn forward_to_remote(
        &self,
        _proxy: &ProxyTransaction,
        successor: &Arc<ProxyTransaction>,
        request: TransactionRequest,
        callback: ResponseCallback,
    ) {
        successor.handle_forwarded_remote_request(request, callback);
    }
}

/// Read-write proxy batching modifications for a remote shard leader.
///
/// Reads go on the wire immediately; mutations are buffered and travel with
/// the commit request.
pub struct RemoteAdapter {
    buffer: Mutex<Vec<TreeOperation>>,
}

impl RemoteAdapter {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn replay_operations(&self, operations: Vec<TreeOperation>) {
        self.buffer
            .lock()
            .expect("modification buffer poisoned")
            .extend(operations);
    }

    fn push(&self, operation: TreeOperation) {
        self.buffer
            .lock()
            .expect("modification buffer poisoned")
            .push(operation);
    }

    fn take_operations(&self) -> Vec<TreeOperation> {
        std::mem::take(&mut *self.buffer.lock().expect("modification buffer poisoned"))
    }
}

impl Default for RemoteAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendAdapter for RemoteAdapter {
    fn is_snapshot_only(&self) -> bool {
        false
    }

    fn do_read(&self, proxy: &ProxyTransaction, path: &TreePath) -> ReadFuture<Option<DataNode>> {
        let (sender, receiver) = oneshot::channel();
        let this = proxy.handle();
        let request = TransactionRequest {
            target: proxy.id(),
            sequence: proxy.next_sequence(),
            payload: RequestPayload::Read { path: path.clone() },
        };
        proxy.send_request(
            request,
            Box::new(move |response| {
                let result = match response {
                    Response::ReadSuccess { data } => {
                        this.record_finished_request();
                        Ok(data)
                    }
                    Response::Failure(cause) => Err(ProxyError::ReadFailed(cause)),
                    other => Err(ProxyError::unhandled(&other)),
                };
                let _ = sender.send(result);
            }),
        );
        receiver
    }

    fn do_exists(&self, proxy: &ProxyTransaction, path: &TreePath) -> ReadFuture<bool> {
        let (sender, receiver) = oneshot::channel();
        let this = proxy.handle();
        let request = TransactionRequest {
            target: proxy.id(),
            sequence: proxy.next_sequence(),
            payload: RequestPayload::Exists { path: path.clone() },
        };
        proxy.send_request(
            request,
            Box::new(move |response| {
                let result = match response {
                    Response::ExistsSuccess { present } => {
                        this.record_finished_request();
                        Ok(present)
                    }
                    Response::Failure(cause) => Err(ProxyError::ReadFailed(cause)),
                    other => Err(ProxyError::unhandled(&other)),
                };
                let _ = sender.send(result);
            }),
        );
        receiver
    }

    fn do_write(&self, _proxy: &ProxyTransaction, path: &TreePath, data: DataNode) {
        self.push(TreeOperation::Write {
            path: path.clone(),
            data,
        });
    }

    fn do_merge(&self, _proxy: &ProxyTransaction, path: &TreePath, data: DataNode) {
        self.push(TreeOperation::Merge {
            path: path.clone(),
            data,
        });
    }

    fn do_delete(&self, _proxy: &ProxyTransaction, path: &TreePath) {
        self.push(TreeOperation::Delete { path: path.clone() });
    }

    fn do_seal(&self, _proxy: &ProxyTransaction) {
        // Buffered modifications travel with the commit request.
    }

    fn do_abort(&self, proxy: &ProxyTransaction) {
        proxy.send_abort(Box::new(|_response| {}));
    }

    fn flush_state(&self, proxy: &ProxyTransaction, successor: &Arc<ProxyTransaction>) {
        let operations = self.take_operations();
        if operations.is_empty() {
            return;
        }
        debug!(
            id = %proxy.id(),
            successor = %successor.id(),
            operations = operations.len(),
            "transferring buffered operations"
        );
        match successor.backend() {
            Backend::Local(local) => local.replay_operations(operations),
            Backend::Remote(remote) => remote.replay_operations(operations),
            Backend::Snapshot(_) => panic!("{successor:?} cannot accept transferred state"),
        }
    }

    fn commit_request(&self, proxy: &ProxyTransaction, coordinated: bool) -> TransactionRequest {
        let protocol = if coordinated {
            PersistenceProtocol::ThreePhase
        } else {
            PersistenceProtocol::Simple
        };
        TransactionRequest {
            target: proxy.id(),
            sequence: proxy.next_sequence(),
            payload: RequestPayload::Modify {
                operations: self.take_operations(),
                protocol,
            },
        }
    }

    fn handle_forwarded_remote_request(
        &self,
        proxy: &ProxyTransaction,
        request: TransactionRequest,
        callback: ResponseCallback,
    ) {
        // Re-sequence under this proxy's allocator and restate the target.
        let request = TransactionRequest {
            target: proxy.id(),
            sequence: proxy.next_sequence(),
            payload: request.payload,
        };
        let is_read = request.payload.is_read();
        let replay_copy = (!is_read).then(|| request.clone());
        let this = proxy.handle();
        proxy.send_request(
            request,
            Box::new(move |response| {
                // Keep the replay chain alive across a further reconnect.
                if !matches!(response, Response::Failure(_)) {
                    if is_read {
                        this.record_finished_request();
                    } else if let Some(copy) = replay_copy {
                        this.record_successful_request(copy);
                    }
                }
                callback(response);
            }),
        );
    }

    fn forward_to_local(
        &self,
        _proxy: &ProxyTransaction,
        successor: &Arc<ProxyTransaction>,
        request: TransactionRequest,
        callback: ResponseCallback,
    ) {
        successor.handle_forwarded_remote_request(request, callback);
    }

    fn forward_to_remote(
        &self,
        _proxy: &ProxyTransaction,
        successor: &Arc<ProxyTransaction>,
        request: TransactionRequest,
        callback: ResponseCallback,
    ) {
        successor.handle_forwarded_remote_request(request, callback);
    }
}
