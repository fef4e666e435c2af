//! Batch retrieval queue
//!
//! FIFO of pending staging requests shared by every handle attached to one
//! coordinator. A drain freezes its batch by appending a [`QueueItem::BatchBoundary`]
//! and popping up to it, so requests enqueued while the drain runs land behind
//! the boundary and wait for the next drain.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};

use tracing::trace;

/// Monotonic position of a request in the queue (first request is 1)
pub type Ticket = u64;

/// A file waiting to be staged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalRequest {
    /// Absolute archive path
    pub remote_path: String,
    /// Local directory the file is staged into
    pub destination_dir: PathBuf,
    /// Permission bits applied to the staged file
    pub permissions: u32,
}

impl RetrievalRequest {
    /// Local path the request stages to
    pub fn local_path(&self) -> PathBuf {
        let name = self
            .remote_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.remote_path);
        self.destination_dir.join(name)
    }
}

#[derive(Debug)]
enum QueueItem {
    Request(Ticket, RetrievalRequest),
    BatchBoundary,
}

/// Tickets sharing the error of one failed drain
#[derive(Debug)]
struct FailedRange {
    last: Ticket,
    message: String,
    /// Tickets in the range whose handle has not yet taken the error
    unacknowledged: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    /// Last ticket handed out
    issued: Ticket,
    /// Every ticket up to this one has left the queue and been processed
    consumed: Ticket,
    /// Failed drains keyed by first ticket; removed once fully acknowledged
    failures: BTreeMap<Ticket, FailedRange>,
    /// Unconsumed tickets whose handle went away
    abandoned: BTreeSet<Ticket>,
}

impl QueueState {
    fn failed_range(&self, ticket: Ticket) -> Option<(Ticket, &FailedRange)> {
        self.failures
            .range(..=ticket)
            .next_back()
            .filter(|(_, range)| range.last >= ticket)
            .map(|(first, range)| (*first, range))
    }

    /// Count one ticket of a failed range as seen, dropping the range after its last
    fn acknowledge(&mut self, ticket: Ticket) -> Option<String> {
        let (first, _) = self.failed_range(ticket)?;
        let range = self.failures.get_mut(&first)?;
        range.unacknowledged = range.unacknowledged.saturating_sub(1);
        let message = range.message.clone();
        if range.unacknowledged == 0 {
            self.failures.remove(&first);
        }
        Some(message)
    }
}

/// Unbounded FIFO of retrieval requests with consumption tracking
#[derive(Debug, Default)]
pub struct BatchRetrievalQueue {
    state: Mutex<QueueState>,
    consumed_changed: Condvar,
}

impl BatchRetrievalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request to the tail and return its ticket
    ///
    /// Never waits on a running drain.
    pub fn enqueue(&self, request: RetrievalRequest) -> Ticket {
        let mut state = self.state.lock().unwrap();
        state.issued += 1;
        let ticket = state.issued;
        trace!(ticket = ticket, remote = %request.remote_path, "Enqueued retrieval request");
        state.items.push_back(QueueItem::Request(ticket, request));
        ticket
    }

    /// Number of requests waiting (boundaries excluded)
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .items
            .iter()
            .filter(|item| matches!(item, QueueItem::Request(..)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the end of the current batch
    pub(crate) fn push_boundary(&self) {
        let mut state = self.state.lock().unwrap();
        state.items.push_back(QueueItem::BatchBoundary);
    }

    /// Pop requests up to and including the first boundary
    ///
    /// Each pop takes the queue lock separately; concurrent enqueues land
    /// behind the boundary and are left in place.
    pub(crate) fn take_batch(&self) -> Vec<(Ticket, RetrievalRequest)> {
        let mut batch = Vec::new();
        loop {
            let item = self.state.lock().unwrap().items.pop_front();
            match item {
                Some(QueueItem::Request(ticket, request)) => batch.push((ticket, request)),
                Some(QueueItem::BatchBoundary) | None => break,
            }
        }
        batch
    }

    /// Fail a batch whose first ticket is `first`
    ///
    /// Drops every queued item, records the failure for the batch and the
    /// discarded tickets, and releases their waiters. Returns how many queued
    /// requests were discarded.
    ///
    /// The tickets from `first` up to the highest discarded one are
    /// contiguous: earlier tickets were consumed by previous drains and
    /// later ones were never issued.
    pub(crate) fn fail_batch(&self, first: Ticket, last: Ticket, message: String) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut discarded = 0;
        let mut highest = state.consumed.max(last);
        for item in state.items.drain(..) {
            if let QueueItem::Request(ticket, _) = item {
                discarded += 1;
                highest = highest.max(ticket);
            }
        }

        let mut unacknowledged = highest - first + 1;
        let later = state.abandoned.split_off(&(highest + 1));
        let gone = std::mem::replace(&mut state.abandoned, later);
        unacknowledged -= gone.range(first..).count() as u64;
        if unacknowledged > 0 {
            state.failures.insert(
                first,
                FailedRange {
                    last: highest,
                    message,
                    unacknowledged,
                },
            );
        }

        state.consumed = highest;
        self.consumed_changed.notify_all();
        discarded
    }

    /// Error message of the failed drain that consumed `ticket`, if any
    ///
    /// Does not acknowledge the error; see [`Self::take_failure`].
    pub fn failure_for(&self, ticket: Ticket) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .failed_range(ticket)
            .map(|(_, range)| range.message.clone())
    }

    /// Error of the failed drain that consumed `ticket`, acknowledging it
    ///
    /// Each ticket's handle takes its error once; the record is dropped when
    /// every ticket of the failed drain has taken it or been abandoned.
    pub fn take_failure(&self, ticket: Ticket) -> Option<String> {
        self.state.lock().unwrap().acknowledge(ticket)
    }

    /// Give up on `ticket` without reading its outcome
    ///
    /// A consumed ticket acknowledges any failure it belongs to. An
    /// unconsumed one is still staged by a later drain, but is left out of
    /// that drain's failure record.
    pub fn abandon(&self, ticket: Ticket) {
        let mut state = self.state.lock().unwrap();
        if ticket <= state.consumed {
            state.acknowledge(ticket);
        } else {
            state.abandoned.insert(ticket);
        }
    }

    /// Failed drains whose errors have not been taken by every handle
    pub fn pending_failures(&self) -> usize {
        self.state.lock().unwrap().failures.len()
    }

    /// Record that every ticket up to `ticket` has been processed
    pub(crate) fn mark_consumed(&self, ticket: Ticket) {
        let mut state = self.state.lock().unwrap();
        if ticket > state.consumed {
            state.consumed = ticket;
            let later = state.abandoned.split_off(&(ticket + 1));
            state.abandoned = later;
            self.consumed_changed.notify_all();
        }
    }

    /// Block until `ticket` has been processed by some drain
    pub fn wait_consumed(&self, ticket: Ticket) {
        let mut state = self.state.lock().unwrap();
        while state.consumed < ticket {
            state = self.consumed_changed.wait(state).unwrap();
        }
    }

    /// Highest processed ticket
    pub fn consumed(&self) -> Ticket {
        self.state.lock().unwrap().consumed
    }
}
