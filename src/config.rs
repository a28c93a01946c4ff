//! Peer group and proposer configuration

use std::net::SocketAddr;
use std::{fmt, future::Future, time::Duration};

use rand::{Rng, SeedableRng, rngs::StdRng};

/// The peer group this node belongs to: the ordered list of peer addresses
/// and this peer's own index within it.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    peers: Vec<SocketAddr>,
    me: usize,
}

/// `me` was not a valid index into the peer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidPeerIndex {
    /// The offending index
    pub me: usize,
    /// Size of the peer list
    pub group_size: usize,
}

impl fmt::Display for InvalidPeerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "peer index {} out of range for group of {}",
            self.me, self.group_size
        )
    }
}

impl std::error::Error for InvalidPeerIndex {}

impl GroupConfig {
    /// Create a group config.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPeerIndex`] if `me` is not an index into `peers`.
    pub fn new(peers: Vec<SocketAddr>, me: usize) -> Result<Self, InvalidPeerIndex> {
        if me >= peers.len() {
            return Err(InvalidPeerIndex {
                me,
                group_size: peers.len(),
            });
        }
        Ok(Self { peers, me })
    }

    /// This peer's index in the group.
    #[must_use]
    pub fn me(&self) -> usize {
        self.me
    }

    /// Address of the peer at `index`.
    #[must_use]
    pub fn addr(&self, index: usize) -> SocketAddr {
        self.peers[index]
    }

    /// Number of peers in the group.
    #[must_use]
    pub fn group_size(&self) -> usize {
        self.peers.len()
    }

    /// Smallest quorum: `floor(n/2) + 1`.
    #[must_use]
    pub fn majority(&self) -> usize {
        self.peers.len() / 2 + 1
    }
}

/// Configuration for exponential backoff with jitter between proposer rounds
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff duration
    pub initial: Duration,
    /// Maximum backoff duration
    pub max: Duration,
    /// Multiplier for each retry (typically 2.0)
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate backoff duration for a given retry count with jitter
    #[must_use]
    pub fn duration(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(retries.cast_signed());
        let capped = base.min(self.max.as_secs_f64());
        // Add jitter: 50% to 150% of the base duration
        let jitter_factor = rng.random_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter_factor)
    }
}

/// Sleep function trait for testing with different runtimes (tokio vs turmoil)
pub trait Sleep: Clone + Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Tokio-based sleep implementation
#[derive(Clone, Copy, Default)]
pub struct TokioSleep;

impl Sleep for TokioSleep {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Proposer tuning: phase timeout, retry backoff, and the RNG seeding the
/// jitter.
#[derive(Debug, Clone)]
pub struct ProposerConfig<S: Sleep = TokioSleep> {
    /// How long one prepare or accept phase waits for replies before missing
    /// peers count as rejects.
    pub phase_timeout: Duration,
    /// Backoff configuration for retries
    pub backoff: BackoffConfig,
    /// Sleep implementation
    pub sleep: S,
    /// Seed for per-task jitter RNGs (deterministic tests)
    pub seed: u64,
}

impl Default for ProposerConfig<TokioSleep> {
    fn default() -> Self {
        Self {
            phase_timeout: Duration::from_millis(250),
            backoff: BackoffConfig::default(),
            sleep: TokioSleep,
            seed: StdRng::from_os_rng().random(),
        }
    }
}

impl<S: Sleep> ProposerConfig<S> {
    /// Create a proposer config with a seeded RNG for deterministic behavior
    #[must_use]
    pub fn with_seed(phase_timeout: Duration, backoff: BackoffConfig, sleep: S, seed: u64) -> Self {
        Self {
            phase_timeout,
            backoff,
            sleep,
            seed,
        }
    }

    /// Derive the jitter RNG for the proposer task driving `seq` on peer
    /// `me`.
    ///
    /// Mixing both in keeps concurrent tasks and competing peers
    /// decorrelated while staying reproducible for a fixed seed.
    pub(crate) fn rng_for(&self, seq: u64, me: u32) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ seq.rotate_left(17) ^ u64::from(me).rotate_left(41))
    }
}
