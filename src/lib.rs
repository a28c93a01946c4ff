//! Multi-instance Paxos consensus library
//!
//! This library implements a peer in a fixed-size Paxos group. Each sequence
//! number is an independent consensus instance; the peer keeps an open-ended,
//! sparsely populated log of instances and forgets them once every member has
//! declared them disposable.
//!
//! # Architecture
//!
//! - **Proposers**: one task per [`Paxos::start`] call, retrying the
//!   two-phase protocol until the instance decides
//! - **Acceptors**: [`AcceptorHandler`] applies Prepare/Accept/Decided
//!   requests against the shared [`InstanceLog`]
//! - **Forgetting**: done watermarks are piggybacked on every message and
//!   advance a conservative global min that purges dead instances
//!
//! # Quick Start
//!
//! ```ignore
//! use paxos_log::{GroupConfig, Paxos, Status, transport::{TcpTransport, serve}};
//!
//! let config = GroupConfig::new(peers.clone(), me)?;
//! let px: Paxos<String, _> = Paxos::new(config, TcpTransport::new(peers));
//!
//! tokio::spawn(serve(listener, px.handler(), px.cancel_token()));
//!
//! px.start(0, "hello".to_owned());
//! while !px.status(0).is_decided() { /* poll */ }
//! ```

#![warn(clippy::pedantic)]

// Submodules
pub mod acceptor;
pub mod config;
pub mod core;
mod log;
mod messages;
mod peer;
mod proposer;
pub mod transport;

pub use acceptor::{AcceptorHandler, PeerKilled};
pub use config::{BackoffConfig, GroupConfig, ProposerConfig, Sleep, TokioSleep};
pub use crate::core::ProposalNumber;
pub use log::{InstanceLog, Status};
pub use messages::{Reply, ReplyBody, Request, RequestBody, Value};
pub use peer::Paxos;
pub use transport::{Lossy, TcpTransport, Transport};
