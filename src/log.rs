//! Shared instance log
//!
//! Owns every consensus instance this peer knows about, keyed by sequence
//! number, together with the per-peer done watermarks that drive forgetting.
//! All access goes through lock-guarded methods; the lock is only ever held
//! across a single check-and-set, never across I/O.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::core::{AcceptOutcome, DecidedMismatch, Instance, PrepareOutcome, ProposalNumber};

/// Local view of one instance, as reported by [`InstanceLog::status`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status<V> {
    /// A value was decided for this instance.
    Decided(V),
    /// No decision is known locally (yet).
    Pending,
    /// The instance fell below the global min and its state was discarded.
    Forgotten,
}

impl<V> Status<V> {
    /// Whether a decided value is known.
    #[must_use]
    pub fn is_decided(&self) -> bool {
        matches!(self, Self::Decided(_))
    }

    /// The decided value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&V> {
        match self {
            Self::Decided(v) => Some(v),
            Self::Pending | Self::Forgotten => None,
        }
    }
}

struct Inner<V> {
    instances: BTreeMap<u64, Instance<V>>,
    /// Highest sequence each peer has declared forgettable. `None` means that
    /// peer has not reported yet; the global min cannot advance past zero
    /// until every slot is filled.
    peer_done: Vec<Option<u64>>,
    /// First sequence number this peer still retains state for. Monotone.
    global_min: u64,
    /// Highest sequence a local `start` has touched.
    max_started: Option<u64>,
}

/// Concurrency-safe mapping from sequence number to instance state.
///
/// Cloning shares the underlying log; all connections of one peer must use
/// the same log.
pub struct InstanceLog<V> {
    me: u32,
    inner: Arc<Mutex<Inner<V>>>,
}

impl<V> Clone for InstanceLog<V> {
    fn clone(&self) -> Self {
        Self {
            me: self.me,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone> InstanceLog<V> {
    /// Create an empty log for a group of `group_size` peers, of which this
    /// peer is index `me`.
    #[must_use]
    pub fn new(group_size: usize, me: u32) -> Self {
        Self {
            me,
            inner: Arc::new(Mutex::new(Inner {
                instances: BTreeMap::new(),
                peer_done: vec![None; group_size],
                global_min: 0,
                max_started: None,
            })),
        }
    }

    /// Index of the owning peer.
    #[must_use]
    pub fn me(&self) -> u32 {
        self.me
    }

    /// Handle a Prepare for `seq`. Returns `None` if the instance is already
    /// forgotten.
    pub(crate) fn prepare(&self, seq: u64, n: ProposalNumber) -> Option<PrepareOutcome<V>> {
        let mut inner = self.inner.lock().unwrap();
        if seq < inner.global_min {
            return None;
        }
        Some(inner.instances.entry(seq).or_default().prepare(n))
    }

    /// Handle an Accept for `seq`. Returns `None` if the instance is already
    /// forgotten.
    pub(crate) fn accept(&self, seq: u64, n: ProposalNumber, value: V) -> Option<AcceptOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if seq < inner.global_min {
            return None;
        }
        Some(inner.instances.entry(seq).or_default().accept(n, value))
    }

    /// Local status of `seq`; a pure read, never fails.
    #[must_use]
    pub fn status(&self, seq: u64) -> Status<V> {
        let inner = self.inner.lock().unwrap();
        if seq < inner.global_min {
            return Status::Forgotten;
        }
        match inner.instances.get(&seq).and_then(|i| i.decided.clone()) {
            Some(v) => Status::Decided(v),
            None => Status::Pending,
        }
    }

    /// Highest promise round known for `seq`, used to seed fresh proposal
    /// numbers above anything this peer has already observed.
    pub(crate) fn promised_floor(&self, seq: u64) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .instances
            .get(&seq)
            .and_then(|i| i.promised)
            .map_or(0, |n| n.round)
    }

    /// Raise this peer's own done watermark. Never regresses.
    pub fn set_done(&self, seq: u64) {
        self.observe_done(self.me, Some(seq));
    }

    /// This peer's own done watermark, piggybacked on outgoing traffic.
    #[must_use]
    pub fn done_watermark(&self) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner.peer_done[self.me as usize]
    }

    /// Merge a peer's gossiped done watermark into the table, advancing the
    /// global min and purging forgotten instances when possible.
    pub(crate) fn observe_done(&self, peer: u32, done: Option<u64>) {
        let Some(done) = done else { return };
        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.peer_done[peer as usize];
        if slot.is_some_and(|existing| existing >= done) {
            return;
        }
        *slot = Some(done);

        // The min is conservative: it stays put until every peer has
        // reported, and only ever advances.
        let Some(lowest) = inner.peer_done.iter().copied().min().flatten() else {
            return;
        };
        let new_min = lowest + 1;
        if new_min > inner.global_min {
            inner.global_min = new_min;
            let retained = inner.instances.split_off(&new_min);
            inner.instances = retained;
            debug!(min = new_min, "forgot instances below min");
        }
    }

    /// First sequence number still retained. Monotone, process-wide.
    #[must_use]
    pub fn global_min(&self) -> u64 {
        self.inner.lock().unwrap().global_min
    }

    /// Note that a local `start` touched `seq`.
    pub(crate) fn record_start(&self, seq: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.max_started.is_none_or(|max| seq > max) {
            inner.max_started = Some(seq);
        }
    }

    /// Highest sequence a local `start` has touched, if any.
    #[must_use]
    pub fn max_started(&self) -> Option<u64> {
        self.inner.lock().unwrap().max_started
    }

    /// Number of retained instances. Exposed for tests that check forgetting
    /// actually frees state.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.inner.lock().unwrap().instances.len()
    }
}

impl<V: Clone + PartialEq> InstanceLog<V> {
    /// Record a decided value for `seq`. Returns `None` if the instance is
    /// already forgotten.
    ///
    /// # Errors
    ///
    /// `Some(Err(DecidedMismatch))` if a conflicting value was already
    /// decided; the caller escalates this as a fatal invariant violation.
    pub(crate) fn decide(&self, seq: u64, value: V) -> Option<Result<(), DecidedMismatch>> {
        let mut inner = self.inner.lock().unwrap();
        if seq < inner.global_min {
            return None;
        }
        Some(inner.instances.entry(seq).or_default().decide(value))
    }
}
