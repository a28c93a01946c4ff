//! Paxos peer façade
//!
//! Composition root for one member of the group: owns the instance log, the
//! acceptor handler, the transport, and the cancellation token, and spawns a
//! proposer task per `start` call.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::acceptor::AcceptorHandler;
use crate::config::{GroupConfig, ProposerConfig, Sleep, TokioSleep};
use crate::log::{InstanceLog, Status};
use crate::messages::Value;
use crate::proposer;
use crate::transport::Transport;

/// State shared between the façade, its proposer tasks, and its handler.
pub(crate) struct Shared<V, T> {
    pub(crate) config: GroupConfig,
    pub(crate) log: InstanceLog<V>,
    pub(crate) handler: AcceptorHandler<V>,
    pub(crate) transport: T,
    pub(crate) cancel: CancellationToken,
    pub(crate) rpc_count: AtomicU64,
}

/// One peer of a fixed-size Paxos group.
///
/// Any member may call [`start`](Self::start) for any sequence number; all
/// peers that decide that sequence number decide the same value, and
/// convergence is observed by polling [`status`](Self::status). Memory is
/// reclaimed through the [`done`](Self::done)/[`min`](Self::min) forgetting
/// protocol.
///
/// After [`kill`](Self::kill), mutators (`start`, `done`) become no-ops and
/// inbound requests are refused; `status`, `min` and `max` keep answering
/// from the last-known local snapshot, since they are pure local reads.
pub struct Paxos<V: Value, T: Transport<V>, S: Sleep = TokioSleep> {
    shared: Arc<Shared<V, T>>,
    proposer: ProposerConfig<S>,
}

impl<V: Value, T: Transport<V>, S: Sleep> Clone for Paxos<V, T, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            proposer: self.proposer.clone(),
        }
    }
}

impl<V: Value, T: Transport<V>> Paxos<V, T> {
    /// Create a peer with default proposer tuning.
    #[must_use]
    pub fn new(config: GroupConfig, transport: T) -> Self {
        Self::with_config(config, transport, ProposerConfig::default())
    }
}

impl<V: Value, T: Transport<V>, S: Sleep> Paxos<V, T, S> {
    /// Create a peer with explicit proposer tuning (timeouts, backoff,
    /// sleep implementation, jitter seed).
    #[must_use]
    pub fn with_config(config: GroupConfig, transport: T, proposer: ProposerConfig<S>) -> Self {
        let me = u32::try_from(config.me()).expect("peer index fits in u32");
        let log = InstanceLog::new(config.group_size(), me);
        let cancel = CancellationToken::new();
        let handler = AcceptorHandler::new(log.clone(), cancel.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                log,
                handler,
                transport,
                cancel,
                rpc_count: AtomicU64::new(0),
            }),
            proposer,
        }
    }

    /// This peer's index in the group.
    #[must_use]
    pub fn me(&self) -> usize {
        self.shared.config.me()
    }

    /// Handler for this peer's inbound traffic; hand it to
    /// [`transport::serve`](crate::transport::serve) or a custom serve loop.
    #[must_use]
    pub fn handler(&self) -> AcceptorHandler<V> {
        self.shared.handler.clone()
    }

    /// Token that fires on [`kill`](Self::kill); serve loops should stop on
    /// it.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// The underlying transport, e.g. to flip a [`Lossy`](crate::Lossy)
    /// wrapper between reliable and unreliable at runtime.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    /// Propose `value` for instance `seq` and return immediately.
    ///
    /// Spawns a proposer task that retries until the instance decides, the
    /// instance is forgotten, or the peer is killed; the outcome is observed
    /// by polling [`status`](Self::status). Calling `start` repeatedly for
    /// one instance is safe: competing proposers arbitrate through proposal
    /// numbers. Starting a forgotten instance, or starting after `kill`, is
    /// a no-op; starting a locally decided instance skips the proposer since
    /// the value can no longer change.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&self, seq: u64, value: V) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        match self.shared.log.status(seq) {
            Status::Forgotten => return,
            Status::Decided(_) => {
                self.shared.log.record_start(seq);
                return;
            }
            Status::Pending => {}
        }
        self.shared.log.record_start(seq);
        debug!(peer = self.me(), seq, "starting proposer");
        tokio::spawn(proposer::drive(
            Arc::clone(&self.shared),
            self.proposer.clone(),
            seq,
            value,
        ));
    }

    /// Local view of instance `seq`. Pure local read; never fails and never
    /// touches the network.
    #[must_use]
    pub fn status(&self, seq: u64) -> Status<V> {
        self.shared.log.status(seq)
    }

    /// Declare that this peer no longer needs instances up to and including
    /// `seq`. The watermark only ever advances, and is gossiped to peers on
    /// every subsequent request and reply.
    pub fn done(&self, seq: u64) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.log.set_done(seq);
    }

    /// Highest sequence a local `start` has touched, or `None` before the
    /// first one. Monotone, local-only.
    #[must_use]
    pub fn max(&self) -> Option<u64> {
        self.shared.log.max_started()
    }

    /// First sequence number this peer still retains state for. Monotone; it
    /// only advances past `k` once every peer's done watermark covering `k`
    /// has been gossiped here.
    #[must_use]
    pub fn min(&self) -> u64 {
        self.shared.log.global_min()
    }

    /// Remote calls issued by this peer's proposers so far.
    #[must_use]
    pub fn rpc_count(&self) -> u64 {
        self.shared.rpc_count.load(Ordering::Relaxed)
    }

    /// Number of instances still held in the log. Forgetting tests use this
    /// to check that purged state is actually gone.
    #[must_use]
    pub fn retained_instances(&self) -> usize {
        self.shared.log.retained()
    }

    /// Shut this peer down. Idempotent and terminal: all proposer tasks
    /// observe the signal within one retry iteration, inbound requests are
    /// refused, and `start`/`done` become no-ops.
    pub fn kill(&self) {
        debug!(peer = self.me(), "killed");
        self.shared.cancel.cancel();
    }
}
