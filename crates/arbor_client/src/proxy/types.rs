//! Shared contracts between the proxy core and its collaborators.
//!
//! The parent history owns every proxy and the connection they send on; the
//! proxy keeps a non-owning back-reference and reaches the wire exclusively
//! through [`ProxyParent`]. Commit-phase decisions across shards are
//! aggregated by [`VotingFuture`].

use std::fmt;
use std::sync::{Arc, Mutex};

use arbor_access::{RequestError, Response, TransactionId, TransactionRequest};
use thiserror::Error;
use tokio::sync::oneshot;

/// Callback invoked exactly once when the backend responds to a request.
pub type ResponseCallback = Box<dyn FnOnce(Response) + Send>;

/// A request queued on the connection together with its completion callback.
pub struct ConnectionEntry {
    pub request: TransactionRequest,
    pub callback: ResponseCallback,
}

impl fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// Seam towards the parent history which owns this proxy and its connection.
///
/// The parent's lifetime strictly dominates all of its proxies. None of
/// these operations may block.
pub trait ProxyParent: Send + Sync {
    /// Queue a request on the connection this history currently uses.
    fn send_request(&self, entry: ConnectionEntry);

    /// The transaction passed its user-visible point of no return.
    fn on_transaction_sealed(&self, target: TransactionId);

    /// An unsealed transaction was aborted and can be dropped.
    fn abort_transaction(&self, target: TransactionId);

    /// Purge was acknowledged; the proxy can be forgotten.
    fn complete_transaction(&self, target: TransactionId);
}

/// Error taxonomy of the proxy core.
///
/// The first four kinds surface synchronously at the call site; the rest
/// travel through returned futures or the voting aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("transaction {0} is a read-only snapshot")]
    ReadOnlyViolation(TransactionId),
    #[error("transaction {0} has already been sealed")]
    AlreadySealed(TransactionId),
    #[error("transaction {0} has not been sealed yet")]
    NotSealed(TransactionId),
    #[error("transaction {0} was sealed twice")]
    DoubleSeal(TransactionId),
    #[error("read failed: {0}")]
    ReadFailed(#[source] RequestError),
    #[error("commit failed: {0}")]
    CommitFailed(#[source] RequestError),
    #[error("unhandled response: {0}")]
    ProtocolViolation(String),
    #[error("interrupted while awaiting successor of {0}")]
    ReconnectAborted(TransactionId),
}

impl ProxyError {
    /// Catch-all for a response class that does not belong to the operation.
    pub fn unhandled(response: &Response) -> Self {
        ProxyError::ProtocolViolation(format!("{response:?}"))
    }
}

/// Aggregates per-shard votes into a single commit-phase decision.
///
/// One aggregate is created per commit phase with the number of
/// participating shards. The first no-vote resolves the future immediately
/// with its cause; otherwise the future resolves once every participant has
/// voted yes. Late votes are ignored.
pub struct VotingFuture {
    inner: Mutex<VoteState>,
}

struct VoteState {
    remaining: usize,
    sender: Option<oneshot::Sender<Result<(), ProxyError>>>,
}

impl VotingFuture {
    pub fn new(participants: usize) -> (Arc<Self>, oneshot::Receiver<Result<(), ProxyError>>) {
        let (sender, receiver) = oneshot::channel();
        let future = Arc::new(Self {
            inner: Mutex::new(VoteState {
                remaining: participants,
                sender: Some(sender),
            }),
        });
        (future, receiver)
    }

    pub fn vote_yes(&self) {
        let mut state = self.inner.lock().expect("vote state poisoned");
        if state.sender.is_none() {
            return;
        }
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            if let Some(sender) = state.sender.take() {
                let _ = sender.send(Ok(()));
            }
        }
    }

    pub fn vote_no(&self, cause: ProxyError) {
        let mut state = self.inner.lock().expect("vote state poisoned");
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(Err(cause));
        }
    }
}
