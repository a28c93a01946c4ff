//! Proposer task: drives one instance toward decision
//!
//! One task runs per `start` call. Each iteration picks a proposal number
//! strictly above everything observed so far, runs the prepare and accept
//! phases against all peers concurrently, and broadcasts the decision on
//! success. Transient failures are absorbed: a missing or failed reply is an
//! implicit reject, and the loop retries with jittered backoff until the
//! instance decides, is forgotten, or the peer is killed.

use std::io;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use rand::rngs::StdRng;
use tokio::select;
use tracing::{debug, instrument, trace};

use crate::config::{ProposerConfig, Sleep};
use crate::core::ProposalNumber;
use crate::log::Status;
use crate::messages::{Reply, ReplyBody, Request, RequestBody, Value};
use crate::peer::Shared;
use crate::transport::Transport;

/// Which reply counts toward the quorum in the running phase.
#[derive(Clone, Copy)]
enum Expect {
    /// Prepare phase: count `PrepareOk`, adopting accepted values.
    PrepareOk,
    /// Accept phase: count `AcceptOk` acknowledging exactly this number.
    AcceptOk(ProposalNumber),
}

/// What one prepare or accept phase produced.
enum PhaseOutcome<V> {
    /// A majority replied OK. `adopted` carries the highest previously
    /// accepted proposal seen during prepare.
    Quorum {
        adopted: Option<(ProposalNumber, V)>,
        observed: u64,
    },
    /// No majority this round; retry above `observed`.
    Retry { observed: u64 },
    /// The peer was killed mid-phase.
    Cancelled,
}

/// Drive `seq` toward a decision, proposing `value` unless a previously
/// accepted value must be adopted.
#[instrument(skip_all, name = "proposer", fields(peer = shared.config.me(), seq = seq))]
pub(crate) async fn drive<V, T, S>(
    shared: Arc<Shared<V, T>>,
    config: ProposerConfig<S>,
    seq: u64,
    value: V,
) where
    V: Value,
    T: Transport<V>,
    S: Sleep,
{
    let me = u32::try_from(shared.config.me()).expect("peer index fits in u32");
    let mut rng = config.rng_for(seq, me);

    // Floor the first number at whatever promise our own acceptor already
    // holds; reject replies raise it further.
    let mut round = shared.log.promised_floor(seq);

    for attempt in 0u32.. {
        if shared.cancel.is_cancelled() {
            debug!("cancelled");
            return;
        }
        match shared.log.status(seq) {
            Status::Decided(_) => {
                debug!("instance already decided");
                return;
            }
            Status::Forgotten => {
                debug!("instance forgotten");
                return;
            }
            Status::Pending => {}
        }

        round += 1;
        let n = ProposalNumber::new(round, me);
        trace!(?n, attempt, "prepare phase");

        let prepare = RequestBody::Prepare { seq, n };
        let adopted = match run_phase(&shared, &config, prepare, Expect::PrepareOk).await {
            PhaseOutcome::Cancelled => return,
            PhaseOutcome::Retry { observed } => {
                round = round.max(observed);
                if backoff(&shared, &config, attempt, &mut rng).await.is_err() {
                    return;
                }
                continue;
            }
            PhaseOutcome::Quorum { adopted, observed } => {
                round = round.max(observed);
                adopted
            }
        };

        // Adopt the highest previously accepted value, else push our own.
        let chosen = adopted.map_or_else(|| value.clone(), |(_, v)| v);
        trace!(?n, "accept phase");

        let accept = RequestBody::Accept {
            seq,
            n,
            value: chosen.clone(),
        };
        match run_phase(&shared, &config, accept, Expect::AcceptOk(n)).await {
            PhaseOutcome::Cancelled => return,
            PhaseOutcome::Retry { observed } => {
                round = round.max(observed);
                if backoff(&shared, &config, attempt, &mut rng).await.is_err() {
                    return;
                }
                continue;
            }
            PhaseOutcome::Quorum { observed, .. } => {
                round = round.max(observed);
            }
        }

        broadcast_decided(&shared, &config, seq, chosen).await;
        debug!(?n, "decided");
        return;
    }
}

/// Send `body` to every peer and collect replies until a majority is OK, the
/// phase timeout fires, or every call resolved.
async fn run_phase<V, T, S>(
    shared: &Shared<V, T>,
    config: &ProposerConfig<S>,
    body: RequestBody<V>,
    expect: Expect,
) -> PhaseOutcome<V>
where
    V: Value,
    T: Transport<V>,
    S: Sleep,
{
    let majority = shared.config.majority();
    let request = Request {
        from: u32::try_from(shared.config.me()).expect("peer index fits in u32"),
        done: shared.log.done_watermark(),
        body,
    };

    let mut calls: FuturesUnordered<_> = (0..shared.config.group_size())
        .map(|peer| send_one(shared, peer, request.clone()))
        .collect();
    let mut timeout = pin!(config.sleep.sleep(config.phase_timeout));

    let mut oks = 0usize;
    let mut adopted: Option<(ProposalNumber, V)> = None;
    // Highest promise round reported by rejecting acceptors.
    let mut observed = 0u64;

    loop {
        let next = select! {
            biased;
            () = shared.cancel.cancelled() => return PhaseOutcome::Cancelled,
            () = &mut timeout => {
                trace!("phase timed out");
                break;
            }
            next = calls.next() => next,
        };
        let Some(result) = next else {
            // Every peer replied or failed.
            break;
        };
        let Ok(reply) = result else {
            // Transport failure: an implicit reject.
            continue;
        };
        shared.log.observe_done(reply.from, reply.done);

        let counted = match (expect, reply.body) {
            (Expect::PrepareOk, ReplyBody::PrepareOk { accepted }) => {
                if let Some((n, v)) = accepted
                    && adopted.as_ref().is_none_or(|(best, _)| n > *best)
                {
                    adopted = Some((n, v));
                }
                true
            }
            (Expect::AcceptOk(n), ReplyBody::AcceptOk { n: acked }) => acked == n,
            (_, ReplyBody::Reject { promised }) => {
                observed = observed.max(promised.round);
                false
            }
            // Obsolete, stale, or mismatched replies count for nothing.
            _ => false,
        };
        if counted {
            oks += 1;
            if oks >= majority {
                return PhaseOutcome::Quorum { adopted, observed };
            }
        }
    }

    PhaseOutcome::Retry { observed }
}

/// Tell everyone the chosen value. Fire-and-forget: failures are ignored and
/// the whole broadcast is bounded by one phase timeout. Self is served first,
/// in-process, so the local log flips to decided before this returns.
async fn broadcast_decided<V, T, S>(
    shared: &Shared<V, T>,
    config: &ProposerConfig<S>,
    seq: u64,
    value: V,
) where
    V: Value,
    T: Transport<V>,
    S: Sleep,
{
    let request = Request {
        from: u32::try_from(shared.config.me()).expect("peer index fits in u32"),
        done: shared.log.done_watermark(),
        body: RequestBody::Decided { seq, value },
    };

    let me = shared.config.me();
    let _ = send_one(shared, me, request.clone()).await;

    let mut calls: FuturesUnordered<_> = (0..shared.config.group_size())
        .filter(|&peer| peer != me)
        .map(|peer| send_one(shared, peer, request.clone()))
        .collect();
    let mut timeout = pin!(config.sleep.sleep(config.phase_timeout));

    loop {
        let next = select! {
            biased;
            () = shared.cancel.cancelled() => return,
            () = &mut timeout => return,
            next = calls.next() => next,
        };
        match next {
            Some(Ok(reply)) => shared.log.observe_done(reply.from, reply.done),
            Some(Err(_)) => {}
            None => return,
        }
    }
}

/// One request to one peer. Requests to self are dispatched in-process,
/// bypassing the transport (and any fault injection it carries).
async fn send_one<V, T>(
    shared: &Shared<V, T>,
    to: usize,
    request: Request<V>,
) -> io::Result<Reply<V>>
where
    V: Value,
    T: Transport<V>,
{
    if to == shared.config.me() {
        return shared.handler.handle(request).map_err(io::Error::other);
    }
    shared.rpc_count.fetch_add(1, Ordering::Relaxed);
    shared.transport.call(to, request).await
}

/// Sleep out the jittered backoff for `attempt`; `Err(())` if cancelled.
async fn backoff<V, T, S>(
    shared: &Shared<V, T>,
    config: &ProposerConfig<S>,
    attempt: u32,
    rng: &mut StdRng,
) -> Result<(), ()>
where
    V: Value,
    T: Transport<V>,
    S: Sleep,
{
    let duration = config.backoff.duration(attempt, rng);
    trace!(?duration, "backing off before retry");
    select! {
        () = shared.cancel.cancelled() => Err(()),
        () = config.sleep.sleep(duration) => Ok(()),
    }
}
