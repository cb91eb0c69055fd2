//! Atomic dual state, successor hand-off cell, and the replay log.
//!
//! Two orthogonal atomics keep the proxy coherent without locks on the
//! common path: a `sealed` flag owned by `transaction.rs` flips once at the
//! user-visible point of no return, while the [`PhaseSlot`] here tracks the
//! commit/reconnect phase. The slot holds one of three sentinel words
//! (open, sealed, flushed) or a pointer to a per-reconnect
//! [`SuccessorCell`], so fast paths need a single atomic read.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use arbor_access::TransactionRequest;

use super::transaction::ProxyTransaction;

/// Non-successor phases. Transitions are monotone along this lattice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum Phase {
    Open,
    Sealed,
    Flushed,
}

/// One-shot gate opened when a reconnect finishes.
pub(super) struct Latch {
    opened: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn new() -> Self {
        Self {
            opened: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn open(&self) {
        let mut opened = self.opened.lock().expect("latch poisoned");
        *opened = true;
        self.cond.notify_all();
    }

    /// Block until the latch opens. Fails only if the opening side panicked.
    fn wait(&self) -> Result<(), ()> {
        let mut opened = self.opened.lock().map_err(|_| ())?;
        while !*opened {
            opened = self.cond.wait(opened).map_err(|_| ())?;
        }
        Ok(())
    }
}

/// Hand-off cell installed by `start_reconnect`.
///
/// `prev` and `successor` are each written exactly once: `prev` before any
/// application thread can reach the latch, `successor` by `replay_messages`
/// before the latch opens. The latch is the only blocking primitive in the
/// core.
pub(super) struct SuccessorCell {
    latch: Latch,
    prev: OnceLock<Phase>,
    successor: OnceLock<Arc<ProxyTransaction>>,
}

impl SuccessorCell {
    pub(super) fn new() -> Self {
        Self {
            latch: Latch::new(),
            prev: OnceLock::new(),
            successor: OnceLock::new(),
        }
    }

    pub(super) fn set_prev(&self, phase: Phase) {
        self.prev
            .set(phase)
            .expect("previous phase recorded twice");
    }

    pub(super) fn prev(&self) -> Phase {
        *self.prev.get().expect("previous phase not recorded")
    }

    pub(super) fn set_successor(&self, successor: Arc<ProxyTransaction>) {
        self.successor
            .set(successor)
            .expect("successor installed twice");
    }

    /// To be called from contexts where the hand-off is known to be complete.
    pub(super) fn successor(&self) -> Arc<ProxyTransaction> {
        Arc::clone(self.successor.get().expect("successor not installed"))
    }

    pub(super) fn finish(&self) {
        self.latch.open();
    }

    /// Synchronize with the succession process and return the successor.
    pub(super) fn await_successor(&self) -> Result<Arc<ProxyTransaction>, ()> {
        self.latch.wait()?;
        Ok(self.successor())
    }
}

// Sentinel words for the settled phases. Box<SuccessorCell> pointers are
// aligned, so a live cell address can never equal one of these.
const OPEN: usize = 1;
const SEALED: usize = 2;
const FLUSHED: usize = 3;

/// Lock-free slot holding either a settled [`Phase`] or a successor cell.
///
/// A cell is installed at most once per proxy (a duplicate reconnect is a
/// fatal invariant violation) and stays in the slot until the proxy drops,
/// so borrows handed out by [`PhaseSlot::view`] remain valid for the life
/// of the slot.
pub(super) struct PhaseSlot {
    word: AtomicUsize,
}

pub(super) enum PhaseView<'a> {
    Settled(Phase),
    Successor(&'a SuccessorCell),
}

impl PhaseSlot {
    pub(super) fn new() -> Self {
        Self {
            word: AtomicUsize::new(OPEN),
        }
    }

    fn encode(phase: Phase) -> usize {
        match phase {
            Phase::Open => OPEN,
            Phase::Sealed => SEALED,
            Phase::Flushed => FLUSHED,
        }
    }

    fn decode(word: usize) -> Option<Phase> {
        match word {
            OPEN => Some(Phase::Open),
            SEALED => Some(Phase::Sealed),
            FLUSHED => Some(Phase::Flushed),
            _ => None,
        }
    }

    pub(super) fn view(&self) -> PhaseView<'_> {
        let word = self.word.load(Ordering::Acquire);
        match Self::decode(word) {
            Some(phase) => PhaseView::Settled(phase),
            // SAFETY: non-sentinel words are cell pointers installed by
            // `install_successor` and freed only by Drop, which has &mut.
            None => PhaseView::Successor(unsafe { &*(word as *const SuccessorCell) }),
        }
    }

    /// Human-readable phase for logs and Debug output.
    pub(super) fn describe(&self) -> &'static str {
        match self.view() {
            PhaseView::Settled(Phase::Open) => "open",
            PhaseView::Settled(Phase::Sealed) => "sealed",
            PhaseView::Settled(Phase::Flushed) => "flushed",
            PhaseView::Successor(_) => "successor",
        }
    }

    /// CAS along the settled lattice. Fails when the phase has moved on or a
    /// successor has interposed.
    pub(super) fn try_advance(&self, from: Phase, to: Phase) -> bool {
        self.word
            .compare_exchange(
                Self::encode(from),
                Self::encode(to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Swap a successor cell into the slot, returning the cell and the
    /// settled phase it displaced. `None` means a cell was already present;
    /// the caller must treat that as fatal.
    pub(super) fn install_successor(
        &self,
        cell: Box<SuccessorCell>,
    ) -> (&SuccessorCell, Option<Phase>) {
        let raw = Box::into_raw(cell);
        let prev = self.word.swap(raw as usize, Ordering::AcqRel);
        // SAFETY: we just installed `raw`; it stays valid until Drop.
        let cell = unsafe { &*raw };
        let prev_phase = Self::decode(prev);
        if prev_phase.is_none() {
            // The displaced word is the previously installed cell. Drop on
            // PhaseSlot only frees the current word, so reclaim it here
            // before the caller surfaces the duplicate install.
            // SAFETY: non-sentinel words are pointers produced by this
            // function, and the slot no longer references this one.
            drop(unsafe { Box::from_raw(prev as *mut SuccessorCell) });
        }
        (cell, prev_phase)
    }

    /// The successor cell, for paths that require one to be present.
    pub(super) fn successor_cell(&self) -> &SuccessorCell {
        match self.view() {
            PhaseView::Successor(cell) => cell,
            PhaseView::Settled(phase) => panic!("phase {phase:?} has no successor"),
        }
    }
}

impl Drop for PhaseSlot {
    fn drop(&mut self) {
        let word = *self.word.get_mut();
        if Self::decode(word).is_none() {
            // SAFETY: sole owner at drop time; the word is the pointer
            // produced by `install_successor`.
            drop(unsafe { Box::from_raw(word as *mut SuccessorCell) });
        }
    }
}

/// Entry in the successful-request history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum LogEntry {
    /// Re-sent verbatim (modulo re-sequencing) on replay.
    Request(TransactionRequest),
    /// Folded run of `delta` consecutive read-type acknowledgements.
    IncrementSequence { delta: u64 },
}

/// Append-only history of requests the backend has acknowledged.
///
/// Written only by the application thread; read by the connection thread
/// during replay, which happens-after application writes because
/// `start_reconnect` has already closed the fast paths through the phase
/// slot.
#[derive(Default)]
pub(super) struct RequestLog {
    entries: Mutex<VecDeque<LogEntry>>,
}

impl RequestLog {
    pub(super) fn record_request(&self, request: TransactionRequest) {
        self.entries
            .lock()
            .expect("request log poisoned")
            .push_back(LogEntry::Request(request));
    }

    /// Account for a read-type acknowledgement, folding runs into the
    /// trailing `IncrementSequence` entry.
    pub(super) fn record_finished(&self) {
        let mut entries = self.entries.lock().expect("request log poisoned");
        match entries.back_mut() {
            Some(LogEntry::IncrementSequence { delta }) => *delta += 1,
            _ => entries.push_back(LogEntry::IncrementSequence { delta: 1 }),
        }
    }

    pub(super) fn drain(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .expect("request log poisoned")
            .drain(..)
            .collect()
    }

    pub(super) fn clear(&self) {
        self.entries.lock().expect("request log poisoned").clear();
    }
}
