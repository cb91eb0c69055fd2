//! Connection-thread successor protocol.
//!
//! These entry points run when the backend link is being rebuilt:
//! `start_reconnect` forces application fast paths into the successor slow
//! path, `replay_messages` re-targets recorded and still-queued requests at
//! the successor, and `finish_reconnect` releases blocked application
//! threads. Lock order: `replay_messages`/`finish_reconnect` run with the
//! connection queue locked and must not take the proxy monitor;
//! `start_reconnect` takes the monitor and is called with the queue
//! unlocked.

use std::collections::VecDeque;
use std::sync::Arc;

use arbor_access::TransactionRequest;
use tracing::debug;

use super::adapter::Backend;
use super::state::{LogEntry, Phase, SuccessorCell};
use super::transaction::ProxyTransaction;
use super::types::{ConnectionEntry, ResponseCallback};

impl ProxyTransaction {
    /// Install the successor cell, closing every fast path through the
    /// phase slot. Subsequent `seal`/`can_commit`/`direct_commit` calls
    /// block on the cell's latch until `finish_reconnect`.
    pub fn start_reconnect(&self) {
        let _monitor = self.lock_monitor();
        let (cell, prev) = self.phase.install_successor(Box::new(SuccessorCell::new()));
        let prev = prev.unwrap_or_else(|| panic!("{self:?} duplicate reconnect attempt"));

        debug!(id = %self.id(), prev = ?prev, "start reconnect");
        cell.set_prev(prev);
    }

    /// Bind `successor` into the cell and replay state onto it: first the
    /// successful-request log in original order, then every entry of the
    /// connection queue targeted at this proxy (with its original
    /// callback). A proxy that had already sealed propagates that to the
    /// successor as well.
    ///
    /// The transport must still hold unanswered in-flight requests in
    /// `enqueued`; entries released before a response cannot be replayed.
    pub fn replay_messages(
        &self,
        successor: &Arc<ProxyTransaction>,
        enqueued: &mut VecDeque<ConnectionEntry>,
    ) {
        let cell = self.phase.successor_cell();
        cell.set_successor(Arc::clone(successor));

        // Acknowledged requests first.
        let entries = self.drain_successful_requests();
        let replayed = entries.len();
        for entry in entries {
            match entry {
                LogEntry::Request(request) => {
                    debug!(
                        id = %self.id(),
                        request = ?request.payload,
                        successor = %successor.id(),
                        "forwarding acknowledged request"
                    );
                    successor.handle_forwarded_remote_request(request, Box::new(|_response| {}));
                }
                LogEntry::IncrementSequence { delta } => successor.increment_sequence(delta),
            }
        }
        debug!(id = %self.id(), replayed, "replayed acknowledged requests");

        // Then whatever is still sitting in the connection queue for us.
        let mut kept = VecDeque::with_capacity(enqueued.len());
        for entry in enqueued.drain(..) {
            if entry.request.target == self.id() {
                debug!(
                    id = %self.id(),
                    request = ?entry.request.payload,
                    successor = %successor.id(),
                    "forwarding queued request"
                );
                successor.handle_forwarded_remote_request(entry.request, entry.callback);
            } else {
                kept.push_back(entry);
            }
        }
        *enqueued = kept;

        // Transitions that raced the reconnect were forced into the slow
        // path and will resume once the latch opens. A proxy that had
        // reached the sealed phase must seal its successor here.
        if cell.prev() == Phase::Sealed {
            debug!(id = %self.id(), successor = %successor.id(), "sealed before reconnect, propagating state");
            self.backend().flush_state(self, successor);
            successor
                .ensure_sealed()
                .expect("freshly installed successor cannot be mid-reconnect");
        }
    }

    /// Open the latch, releasing the `seal`/`can_commit`/`direct_commit`
    /// slow paths onto the successor.
    pub fn finish_reconnect(&self) {
        debug!(id = %self.id(), "finishing reconnect");
        self.phase.successor_cell().finish();
    }

    /// Re-adjust an in-flight request from a retired connection and forward
    /// it to the successor. Only local and remote proxies can take over a
    /// transaction; anything else is an invariant violation.
    pub fn replay_request(&self, request: TransactionRequest, callback: ResponseCallback) {
        let successor = self.phase.successor_cell().successor();
        match successor.backend() {
            Backend::Local(_) => self
                .backend()
                .forward_to_local(self, &successor, request, callback),
            Backend::Remote(_) => self
                .backend()
                .forward_to_remote(self, &successor, request, callback),
            Backend::Snapshot(_) => panic!("unhandled successor {successor:?}"),
        }
    }
}
