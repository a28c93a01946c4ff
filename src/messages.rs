//! Peer-to-peer protocol messages
//!
//! Every request and reply carries the sender's peer index and its current
//! done watermark, so the forgetting protocol gossips passively on traffic
//! that is flowing anyway.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::fmt;

use crate::core::ProposalNumber;

/// Values driven through consensus.
///
/// Blanket-implemented for anything cloneable, comparable and serializable;
/// equality is required so conflicting decisions can be detected.
pub trait Value:
    Clone + Eq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Value for T where
    T: Clone + Eq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// A request from one peer's proposer to another peer's acceptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request<V> {
    /// Index of the sending peer
    pub from: u32,
    /// Sender's done watermark (`None` until its first `done` call)
    pub done: Option<u64>,
    /// The operation itself
    pub body: RequestBody<V>,
}

/// The closed set of operations an acceptor handles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestBody<V> {
    /// Phase 1: claim the instance with proposal number `n`.
    Prepare { seq: u64, n: ProposalNumber },
    /// Phase 2: ask the acceptor to accept `value` under `n`.
    Accept {
        seq: u64,
        n: ProposalNumber,
        value: V,
    },
    /// A value was chosen; record it. Fire-and-forget from the proposer.
    Decided { seq: u64, value: V },
}

impl<V> RequestBody<V> {
    /// The sequence number this request addresses.
    #[must_use]
    pub fn seq(&self) -> u64 {
        match self {
            Self::Prepare { seq, .. } | Self::Accept { seq, .. } | Self::Decided { seq, .. } => {
                *seq
            }
        }
    }
}

/// A reply from an acceptor back to the requesting proposer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply<V> {
    /// Index of the replying peer
    pub from: u32,
    /// Replier's done watermark
    pub done: Option<u64>,
    /// The verdict
    pub body: ReplyBody<V>,
}

/// Acceptor verdicts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyBody<V> {
    /// Prepare succeeded; carries the acceptor's highest accepted proposal so
    /// the proposer can adopt its value.
    PrepareOk {
        accepted: Option<(ProposalNumber, V)>,
    },
    /// Accept succeeded under proposal number `n`.
    AcceptOk { n: ProposalNumber },
    /// The request's proposal number lost to `promised`. The proposer should
    /// fast-forward past it before retrying.
    Reject { promised: ProposalNumber },
    /// The instance was already forgotten (below the acceptor's min).
    Obsolete,
    /// Decided notification acknowledged.
    Ack,
}
