//! User-facing transaction proxy state machine.
//!
//! A proxy translates transaction operations towards one backend shard and
//! hands an in-flight transaction over to a successor proxy when the
//! connection is rebuilt. It is not safe for concurrent use by multiple
//! application threads; transitions driven by the connection thread are.
//!
//! State keeping is split across two atomics so that the common operations
//! need a single atomic read. `sealed` is the user-visible flag and flips
//! exactly once in `seal`. The phase slot coordinates commit-driving
//! application threads with the successor-injecting connection thread:
//! settled phases use sentinel words, a reconnect swaps in a per-transition
//! cell whose latch the forced-slow application paths block on. Successor
//! injection runs with the connection queue locked and must not take the
//! proxy monitor, which is why `start_reconnect` (queue unlocked) is the
//! only connection-side entry that does.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use arbor_access::{
    DataNode, RequestPayload, Response, TransactionId, TransactionRequest, TreePath,
};
use tokio::sync::oneshot;
use tracing::debug;

use super::adapter::{Backend, LocalAdapter, ReadFuture, RemoteAdapter, SnapshotAdapter};
use super::state::{Phase, PhaseSlot, RequestLog};
use super::types::{ConnectionEntry, ProxyError, ProxyParent, ResponseCallback, VotingFuture};

pub struct ProxyTransaction {
    id: TransactionId,
    parent: Arc<dyn ProxyParent>,
    backend: Backend,
    self_handle: Weak<ProxyTransaction>,

    /// Written by the application thread only.
    sequence: AtomicU64,
    /// Written by the application thread, read by the connection thread once
    /// the phase slot has closed the fast paths.
    successful: RequestLog,

    sealed: AtomicBool,
    pub(super) phase: PhaseSlot,
    /// Serializes commit fast paths against successor installation. Never
    /// taken while holding the parent's queue lock.
    monitor: Mutex<()>,
    purged: AtomicBool,
}

impl ProxyTransaction {
    pub fn new(parent: Arc<dyn ProxyParent>, id: TransactionId, backend: Backend) -> Arc<Self> {
        Arc::new_cyclic(|self_handle| Self {
            id,
            parent,
            backend,
            self_handle: self_handle.clone(),
            sequence: AtomicU64::new(0),
            successful: RequestLog::default(),
            sealed: AtomicBool::new(false),
            phase: PhaseSlot::new(),
            monitor: Mutex::new(()),
            purged: AtomicBool::new(false),
        })
    }

    /// Proxy batching modifications for a remote shard leader.
    pub fn new_remote(parent: Arc<dyn ProxyParent>, id: TransactionId) -> Arc<Self> {
        Self::new(parent, id, Backend::Remote(RemoteAdapter::new()))
    }

    /// Read-write proxy operating on a local copy of the shard's data tree.
    pub fn new_local(
        parent: Arc<dyn ProxyParent>,
        id: TransactionId,
        snapshot: BTreeMap<TreePath, DataNode>,
    ) -> Arc<Self> {
        Self::new(parent, id, Backend::Local(LocalAdapter::new(snapshot)))
    }

    /// Read-only proxy over a snapshot of the shard's data tree.
    pub fn new_snapshot(
        parent: Arc<dyn ProxyParent>,
        id: TransactionId,
        snapshot: BTreeMap<TreePath, DataNode>,
    ) -> Arc<Self> {
        Self::new(parent, id, Backend::Snapshot(SnapshotAdapter::new(snapshot)))
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub(super) fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Strong handle for callbacks that outlive the current borrow.
    pub(super) fn handle(&self) -> Arc<Self> {
        self.self_handle.upgrade().expect("proxy dropped while in use")
    }

    pub(super) fn lock_monitor(&self) -> MutexGuard<'_, ()> {
        self.monitor.lock().expect("proxy monitor poisoned")
    }

    /// Return the current sequence number and advance the counter. Called
    /// only by the application thread.
    pub(super) fn next_sequence(&self) -> u64 {
        let ret = self.sequence.fetch_add(1, Ordering::Relaxed);
        debug!(id = %self.id, sequence = ret, "allocated sequence");
        ret
    }

    /// Advance the counter without allocating, re-aligning a successor with
    /// what its predecessor already spent.
    pub(super) fn increment_sequence(&self, delta: u64) {
        let next = self.sequence.fetch_add(delta, Ordering::Relaxed) + delta;
        debug!(id = %self.id, sequence = next, "incremented sequence");
    }

    pub(super) fn send_request(&self, request: TransactionRequest, callback: ResponseCallback) {
        debug!(id = %self.id, request = ?request.payload, sequence = request.sequence, "sending request");
        self.parent.send_request(ConnectionEntry { request, callback });
    }

    pub(super) fn record_successful_request(&self, request: TransactionRequest) {
        self.successful.record_request(request);
    }

    pub(super) fn record_finished_request(&self) {
        self.successful.record_finished();
    }

    pub(super) fn drain_successful_requests(&self) -> Vec<super::state::LogEntry> {
        self.successful.drain()
    }

    fn check_not_sealed(&self) -> Result<(), ProxyError> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(ProxyError::AlreadySealed(self.id));
        }
        Ok(())
    }

    fn check_sealed(&self) -> Result<(), ProxyError> {
        if !self.sealed.load(Ordering::Acquire) {
            return Err(ProxyError::NotSealed(self.id));
        }
        Ok(())
    }

    fn check_read_write(&self) -> Result<(), ProxyError> {
        if self.backend.is_snapshot_only() {
            return Err(ProxyError::ReadOnlyViolation(self.id));
        }
        Ok(())
    }

    pub fn read(&self, path: &TreePath) -> Result<ReadFuture<Option<DataNode>>, ProxyError> {
        self.check_not_sealed()?;
        Ok(self.backend.do_read(self, path))
    }

    pub fn exists(&self, path: &TreePath) -> Result<ReadFuture<bool>, ProxyError> {
        self.check_not_sealed()?;
        Ok(self.backend.do_exists(self, path))
    }

    pub fn write(&self, path: &TreePath, data: DataNode) -> Result<(), ProxyError> {
        self.check_read_write()?;
        self.check_not_sealed()?;
        self.backend.do_write(self, path, data);
        Ok(())
    }

    pub fn merge(&self, path: &TreePath, data: DataNode) -> Result<(), ProxyError> {
        self.check_read_write()?;
        self.check_not_sealed()?;
        self.backend.do_merge(self, path, data);
        Ok(())
    }

    pub fn delete(&self, path: &TreePath) -> Result<(), ProxyError> {
        self.check_read_write()?;
        self.check_not_sealed()?;
        self.backend.do_delete(self, path);
        Ok(())
    }

    /// Seal this transaction before it is committed or aborted. A second
    /// call fails with `DoubleSeal`.
    pub fn seal(&self) -> Result<(), ProxyError> {
        // User-visible state transitions first; the phase slot follows in
        // internal_seal.
        if self
            .sealed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ProxyError::DoubleSeal(self.id));
        }
        self.internal_seal()
    }

    /// Idempotent variant used on successors; only the winning call runs the
    /// seal procedure.
    pub fn ensure_sealed(&self) -> Result<(), ProxyError> {
        if self
            .sealed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.internal_seal()
        } else {
            Ok(())
        }
    }

    fn internal_seal(&self) -> Result<(), ProxyError> {
        self.backend.do_seal(self);
        self.parent.on_transaction_sealed(self.id);

        if !self.phase.try_advance(Phase::Open, Phase::Sealed) {
            // A successor interposed. It has not seen the final part of our
            // state, nor the fact we are sealed; transfer both and continue
            // the seal on the other side.
            let successor = self.await_successor()?;
            debug!(id = %self.id, successor = %successor.id, "continuing seal on successor");
            self.backend.flush_state(self, &successor);
            successor.ensure_sealed()?;
        }
        Ok(())
    }

    pub(super) fn await_successor(&self) -> Result<Arc<ProxyTransaction>, ProxyError> {
        self.phase
            .successor_cell()
            .await_successor()
            .map_err(|_| ProxyError::ReconnectAborted(self.id))
    }

    /// Abort an unsealed transaction and tell the parent to drop it.
    pub fn abort(&self) -> Result<(), ProxyError> {
        self.check_not_sealed()?;
        self.backend.do_abort(self);
        self.parent.abort_transaction(self.id);
        Ok(())
    }

    /// Abort a sealed transaction as a vote in a coordinated commit.
    pub fn abort_voting(&self, ret: &Arc<VotingFuture>) -> Result<(), ProxyError> {
        self.check_sealed()?;

        let ret = Arc::clone(ret);
        let this = self.handle();
        self.send_abort(Box::new(move |response| {
            match response {
                Response::AbortSuccess => ret.vote_yes(),
                Response::Failure(cause) => ret.vote_no(ProxyError::CommitFailed(cause)),
                other => ret.vote_no(ProxyError::unhandled(&other)),
            }

            // Terminal request, nothing to record.
            debug!(id = %this.id, "abort completed");
            this.purge();
        }));
        Ok(())
    }

    pub(super) fn send_abort(&self, callback: ResponseCallback) {
        let request = TransactionRequest {
            target: self.id,
            sequence: self.next_sequence(),
            payload: RequestPayload::Abort,
        };
        self.send_request(request, callback);
    }

    /// Commit without coordination; valid only when this shard is the sole
    /// participant. Resolves to `true` on success.
    pub fn direct_commit(&self) -> Result<oneshot::Receiver<Result<bool, ProxyError>>, ProxyError> {
        self.check_read_write()?;
        self.check_sealed()?;

        // Precludes start_reconnect from interfering with the fast path.
        {
            let _monitor = self.lock_monitor();
            if self.phase.try_advance(Phase::Sealed, Phase::Flushed) {
                let (sender, receiver) = oneshot::channel();
                let this = self.handle();
                let request = self.backend.commit_request(self, false);
                self.send_request(
                    request,
                    Box::new(move |response| {
                        let result = match response {
                            Response::CommitSuccess => Ok(true),
                            Response::Failure(cause) => Err(ProxyError::CommitFailed(cause)),
                            other => Err(ProxyError::unhandled(&other)),
                        };
                        let _ = sender.send(result);

                        // Terminal request, nothing to record.
                        debug!(id = %this.id, "direct commit completed");
                        this.purge();
                    }),
                );
                return Ok(receiver);
            }
        }

        // A successor interposed; wait for the hand-off and retry there.
        self.await_successor()?.direct_commit()
    }

    /// First phase of the coordinated commit.
    pub fn can_commit(&self, ret: &Arc<VotingFuture>) -> Result<(), ProxyError> {
        self.check_read_write()?;
        self.check_sealed()?;

        // Precludes start_reconnect from interfering with the fast path.
        {
            let _monitor = self.lock_monitor();
            if self.phase.try_advance(Phase::Sealed, Phase::Flushed) {
                let request = self.backend.commit_request(self, true);
                let replay_copy = request.clone();
                let ret = Arc::clone(ret);
                let this = self.handle();
                self.send_request(
                    request,
                    Box::new(move |response| {
                        match response {
                            Response::CanCommitSuccess => ret.vote_yes(),
                            Response::Failure(cause) => {
                                ret.vote_no(ProxyError::CommitFailed(cause))
                            }
                            other => ret.vote_no(ProxyError::unhandled(&other)),
                        }

                        // A reconnect may still need to replay this request.
                        this.record_successful_request(replay_copy);
                        debug!(id = %this.id, "can commit completed");
                    }),
                );
                return Ok(());
            }
        }

        // A successor interposed; wait for the hand-off and retry there.
        self.await_successor()?.can_commit(ret)
    }

    /// Second phase of the coordinated commit. Runs only after a successful
    /// `can_commit`, so the phase is already flushed.
    pub fn pre_commit(&self, ret: &Arc<VotingFuture>) -> Result<(), ProxyError> {
        self.check_read_write()?;
        self.check_sealed()?;

        let request = TransactionRequest {
            target: self.id,
            sequence: self.next_sequence(),
            payload: RequestPayload::PreCommit,
        };
        let replay_copy = request.clone();
        let ret = Arc::clone(ret);
        let this = self.handle();
        self.send_request(
            request,
            Box::new(move |response| {
                match response {
                    Response::PreCommitSuccess => ret.vote_yes(),
                    Response::Failure(cause) => ret.vote_no(ProxyError::CommitFailed(cause)),
                    other => ret.vote_no(ProxyError::unhandled(&other)),
                }

                this.on_pre_commit_complete(replay_copy);
            }),
        );
        Ok(())
    }

    fn on_pre_commit_complete(&self, request: TransactionRequest) {
        // The backend holds the full transaction state from here on; only
        // the pre-commit request is needed to resync after a reconnect.
        debug!(id = %self.id, "pre commit completed, clearing successful requests");
        self.successful.clear();
        self.record_successful_request(request);
    }

    /// Final phase of the coordinated commit.
    pub fn do_commit(&self, ret: &Arc<VotingFuture>) -> Result<(), ProxyError> {
        self.check_read_write()?;
        self.check_sealed()?;

        let request = TransactionRequest {
            target: self.id,
            sequence: self.next_sequence(),
            payload: RequestPayload::DoCommit,
        };
        let ret = Arc::clone(ret);
        let this = self.handle();
        self.send_request(
            request,
            Box::new(move |response| {
                match response {
                    Response::CommitSuccess => ret.vote_yes(),
                    Response::Failure(cause) => ret.vote_no(ProxyError::CommitFailed(cause)),
                    other => ret.vote_no(ProxyError::unhandled(&other)),
                }

                debug!(id = %this.id, "do commit completed");
                this.purge();
            }),
        );
        Ok(())
    }

    /// Terminal request releasing backend state for this transaction.
    /// Emitted at most once per proxy.
    pub fn purge(&self) {
        if self.purged.swap(true, Ordering::AcqRel) {
            return;
        }
        self.successful.clear();

        let request = TransactionRequest {
            target: self.id,
            sequence: self.next_sequence(),
            payload: RequestPayload::Purge,
        };
        let this = self.handle();
        self.send_request(
            request,
            Box::new(move |_response| {
                debug!(id = %this.id, "purge completed");
                this.parent.complete_transaction(this.id);
            }),
        );
    }

    /// Accept a request replayed from a predecessor proxy, re-sequenced
    /// under this proxy's allocator.
    pub fn handle_forwarded_remote_request(
        &self,
        request: TransactionRequest,
        callback: ResponseCallback,
    ) {
        self.backend
            .handle_forwarded_remote_request(self, request, callback);
    }
}

impl fmt::Debug for ProxyTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyTransaction")
            .field("identifier", &self.id)
            .field("state", &self.phase.describe())
            .finish()
    }
}
