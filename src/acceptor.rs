//! Acceptor request handling
//!
//! Turns inbound [`Request`]s into [`Reply`]s against the shared instance
//! log. Handlers are synchronous: each one takes the log lock once, applies a
//! single check-and-set, and releases it before the reply is sent anywhere.

use std::fmt;

use tracing::{error, trace};

use tokio_util::sync::CancellationToken;

use crate::core::{AcceptOutcome, PrepareOutcome};
use crate::log::InstanceLog;
use crate::messages::{Reply, ReplyBody, Request, RequestBody, Value};

/// The peer was killed; inbound requests are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerKilled;

impl fmt::Display for PeerKilled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("peer killed")
    }
}

impl std::error::Error for PeerKilled {}

/// Handler for one peer's inbound Paxos traffic.
///
/// Cloning shares the underlying log. All connections to the same peer must
/// share one handler so promises and accepts coordinate.
pub struct AcceptorHandler<V> {
    log: InstanceLog<V>,
    cancel: CancellationToken,
}

impl<V> Clone for AcceptorHandler<V> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<V: Value> AcceptorHandler<V> {
    pub(crate) fn new(log: InstanceLog<V>, cancel: CancellationToken) -> Self {
        Self { log, cancel }
    }

    /// Handle one request and produce the reply.
    ///
    /// Ingests the sender's piggybacked done watermark before dispatching, so
    /// forgetting progresses on any traffic at all.
    ///
    /// # Errors
    ///
    /// Returns [`PeerKilled`] after `kill()`; serve loops drop the connection
    /// in response.
    ///
    /// # Panics
    ///
    /// Panics if the request reveals two differing decided values for the
    /// same instance. That cannot happen in a correct run, so it is treated
    /// as a fatal protocol invariant violation rather than an error.
    pub fn handle(&self, request: Request<V>) -> Result<Reply<V>, PeerKilled> {
        if self.cancel.is_cancelled() {
            return Err(PeerKilled);
        }

        self.log.observe_done(request.from, request.done);

        let body = match request.body {
            RequestBody::Prepare { seq, n } => match self.log.prepare(seq, n) {
                None => ReplyBody::Obsolete,
                Some(PrepareOutcome::Promised { accepted }) => {
                    trace!(seq, ?n, "promised");
                    ReplyBody::PrepareOk { accepted }
                }
                Some(PrepareOutcome::Rejected { promised }) => {
                    trace!(seq, ?n, ?promised, "prepare rejected");
                    ReplyBody::Reject { promised }
                }
            },
            RequestBody::Accept { seq, n, value } => match self.log.accept(seq, n, value) {
                None => ReplyBody::Obsolete,
                Some(AcceptOutcome::Accepted) => {
                    trace!(seq, ?n, "accepted");
                    ReplyBody::AcceptOk { n }
                }
                Some(AcceptOutcome::Rejected { promised }) => {
                    trace!(seq, ?n, ?promised, "accept rejected");
                    ReplyBody::Reject { promised }
                }
            },
            RequestBody::Decided { seq, value } => {
                match self.log.decide(seq, value) {
                    None | Some(Ok(())) => {}
                    Some(Err(mismatch)) => {
                        error!(seq, from = request.from, "conflicting decided values");
                        panic!("protocol invariant violated for seq {seq}: {mismatch:?}");
                    }
                }
                trace!(seq, "decided recorded");
                ReplyBody::Ack
            }
        };

        Ok(Reply {
            from: self.log.me(),
            done: self.log.done_watermark(),
            body,
        })
    }
}
