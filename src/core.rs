//! Pure state machine core for a single consensus instance - no I/O, no async
//!
//! This module contains the acceptor state transitions that are shared between:
//! - The runtime implementation (`log.rs`, `acceptor.rs`)
//! - The Stateright model checker tests
//!
//! By extracting this logic, we ensure the model checker verifies the exact
//! same state transitions as the production code.

use serde::{Deserialize, Serialize};

/// Ordering key for competing proposals within one instance.
///
/// Compares by `(round, peer)` lexicographically. Two proposers can never
/// issue the same number because the peer index breaks every tie.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct ProposalNumber {
    /// Retry round, strictly increasing per proposer
    pub round: u64,
    /// Index of the issuing peer within the group
    pub peer: u32,
}

impl ProposalNumber {
    /// Create a proposal number for the given round and peer.
    #[must_use]
    pub fn new(round: u64, peer: u32) -> Self {
        Self { round, peer }
    }

    /// The smallest number `peer` can issue that dominates `self`.
    ///
    /// Used to fast-forward past a rejecting acceptor's promise instead of
    /// re-colliding one round at a time.
    #[must_use]
    pub fn advance(self, peer: u32) -> Self {
        Self {
            round: self.round + 1,
            peer,
        }
    }
}

/// Acceptor record for one consensus instance.
///
/// Tracks the highest prepare promised (`n_p`), the highest accepted proposal
/// with its value (`n_a`, `v_a`), and the decided value once known. The
/// decided value is terminal: later Prepare/Accept traffic may still bump the
/// other fields but can never change it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Instance<V> {
    /// Highest proposal number promised (`n_p`)
    pub promised: Option<ProposalNumber>,
    /// Highest accepted proposal and its value (`n_a`, `v_a`)
    pub accepted: Option<(ProposalNumber, V)>,
    /// Decided value, if any
    pub decided: Option<V>,
}

#[expect(
    clippy::derivable_impls,
    reason = "derive(Default) doesn't work with generic bounds"
)]
impl<V> Default for Instance<V> {
    fn default() -> Self {
        Self {
            promised: None,
            accepted: None,
            decided: None,
        }
    }
}

/// Result of handling a Prepare request against one instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrepareOutcome<V> {
    /// Promised - returns the currently accepted proposal (if any) so the
    /// proposer can adopt its value.
    Promised {
        /// Currently accepted (number, value) pair for this instance
        accepted: Option<(ProposalNumber, V)>,
    },
    /// Rejected - a higher or equal proposal was already promised.
    Rejected {
        /// The promise the proposer must get past
        promised: ProposalNumber,
    },
}

/// Result of handling an Accept request against one instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Accepted - `n_p`, `n_a` and `v_a` were all updated.
    Accepted,
    /// Rejected - a strictly higher proposal was already promised.
    Rejected {
        /// The promise the proposer must get past
        promised: ProposalNumber,
    },
}

/// Two differing decided values were observed for the same instance.
///
/// This can never happen in a correct run; callers treat it as a fatal
/// protocol invariant violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecidedMismatch;

impl<V: Clone> Instance<V> {
    /// Handle a Prepare with number `n` - pure state transition.
    ///
    /// Succeeds iff `n` is strictly greater than the highest promise seen,
    /// in which case the promise is raised to `n`.
    pub fn prepare(&mut self, n: ProposalNumber) -> PrepareOutcome<V> {
        match self.promised {
            Some(promised) if n <= promised => PrepareOutcome::Rejected { promised },
            _ => {
                self.promised = Some(n);
                PrepareOutcome::Promised {
                    accepted: self.accepted.clone(),
                }
            }
        }
    }

    /// Handle an Accept with number `n` and value `value` - pure state
    /// transition.
    ///
    /// Succeeds iff `n` is at least the highest promise seen (`n >= n_p`),
    /// in which case `n_p`, `n_a` and `v_a` all move to the new proposal.
    pub fn accept(&mut self, n: ProposalNumber, value: V) -> AcceptOutcome {
        match self.promised {
            Some(promised) if n < promised => AcceptOutcome::Rejected { promised },
            _ => {
                self.promised = Some(n);
                self.accepted = Some((n, value));
                AcceptOutcome::Accepted
            }
        }
    }
}

impl<V: Clone + PartialEq> Instance<V> {
    /// Record the decided value - idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`DecidedMismatch`] if a different value was already decided
    /// for this instance.
    pub fn decide(&mut self, value: V) -> Result<(), DecidedMismatch> {
        match &self.decided {
            Some(existing) if *existing != value => Err(DecidedMismatch),
            Some(_) => Ok(()),
            None => {
                self.decided = Some(value);
                Ok(())
            }
        }
    }
}
