//! Turmoil-based simulation tests
//!
//! These run the full TCP stack (framed postcard codec, serve loop, dial-per
//! call transport) under turmoil's network simulation, with partitions and
//! message latency, so the retry loop is exercised against a hostile network
//! rather than a loopback.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use paxos_log::transport::{ClientCodec, ServerCodec, serve_conn};
use paxos_log::{
    BackoffConfig, GroupConfig, Lossy, Paxos, ProposerConfig, Reply, Request, Sleep, Status,
    Transport,
};
use tokio_util::codec::Framed;
use turmoil::Builder;

/// Initialize tracing for tests. Call at the start of each test.
/// Uses RUST_LOG env var for filtering (defaults to "debug" for this crate).
fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("paxos_log=debug")),
        )
        .with_span_events(FmtSpan::CLOSE)
        .with_test_writer()
        .finish();

    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

const PEER_PORT: u16 = 9999;
const PEER_NAMES: &[&str] = &["peer-0", "peer-1", "peer-2"];

// --- Turmoil Sleep Implementation ---

#[derive(Clone, Copy, Default)]
struct TurmoilSleep;

impl Sleep for TurmoilSleep {
    async fn sleep(&self, duration: Duration) {
        // Turmoil intercepts tokio::time, so we use tokio's sleep
        tokio::time::sleep(duration).await;
    }
}

fn turmoil_config(seed: u64) -> ProposerConfig<TurmoilSleep> {
    ProposerConfig::with_seed(
        Duration::from_millis(500),
        BackoffConfig {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        },
        TurmoilSleep,
        seed,
    )
}

// --- Turmoil TCP transport ---

/// Dial-per-call transport over turmoil's simulated TCP.
#[derive(Clone)]
struct TurmoilTransport {
    peers: Vec<SocketAddr>,
}

impl Transport<String> for TurmoilTransport {
    fn call(
        &self,
        to: usize,
        request: Request<String>,
    ) -> impl Future<Output = io::Result<Reply<String>>> + Send {
        let addr = self.peers[to];
        async move {
            let stream = turmoil::net::TcpStream::connect(addr).await?;
            let mut framed = Framed::new(stream, ClientCodec::<String>::default());
            framed.send(request).await?;
            match framed.next().await {
                Some(reply) => reply,
                None => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before reply",
                )),
            }
        }
    }
}

fn resolve_peers() -> Vec<SocketAddr> {
    PEER_NAMES
        .iter()
        .map(|name| SocketAddr::new(turmoil::lookup(*name), PEER_PORT))
        .collect()
}

// --- Peer hosts ---

type Handle = Paxos<String, Lossy<TurmoilTransport>, TurmoilSleep>;
type Registry = Arc<Mutex<Vec<Option<Handle>>>>;

fn registry() -> Registry {
    Arc::new(Mutex::new(vec![None; PEER_NAMES.len()]))
}

/// Build the peer for host `me`, publish its handle, and serve inbound
/// connections until killed.
async fn run_peer(
    me: usize,
    registry: Registry,
    drop_probability: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    let peers = resolve_peers();
    let config = GroupConfig::new(peers.clone(), me)?;
    let transport = Lossy::new(TurmoilTransport { peers }, drop_probability, 0xfeed + me as u64);
    let px: Handle = Paxos::with_config(config, transport, turmoil_config(me as u64));

    let listener = turmoil::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, PEER_PORT)).await?;
    let handler = px.handler();
    let cancel = px.cancel_token();
    registry.lock().unwrap()[me] = Some(px);

    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, _) = accepted?;
        let conn = Framed::new(stream, ServerCodec::<String>::default());
        let handler = handler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = serve_conn(handler, conn, cancel).await;
        });
    }
}

fn start_peers(sim: &mut turmoil::Sim<'_>, registry: &Registry, drop_probability: f64) {
    for (me, name) in PEER_NAMES.iter().enumerate() {
        let registry = Arc::clone(registry);
        sim.host(*name, move || {
            let registry = registry.clone();
            run_peer(me, registry, drop_probability)
        });
    }
}

fn handle(registry: &Registry, me: usize) -> Handle {
    registry.lock().unwrap()[me]
        .clone()
        .expect("peer not started yet")
}

/// Wait until every peer reports the same decided value for `seq`.
async fn await_all_decided(registry: &Registry, seq: u64) -> String {
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let handles = registry.lock().unwrap().clone();
        let statuses: Vec<_> = handles
            .into_iter()
            .flatten()
            .map(|px| px.status(seq))
            .collect();
        if statuses.len() < PEER_NAMES.len() {
            continue;
        }
        let mut values = statuses.iter().filter_map(Status::value);
        let Some(first) = values.next() else { continue };
        assert!(
            statuses.iter().filter_map(Status::value).all(|v| v == first),
            "peers decided different values for seq {seq}"
        );
        if statuses.iter().all(Status::is_decided) {
            return first.clone();
        }
    }
}

// --- Tests ---

#[test]
fn turmoil_basic_consensus() {
    let _guard = init_tracing();
    let mut sim = Builder::new()
        .simulation_duration(Duration::from_secs(60))
        .build();

    let reg = registry();
    start_peers(&mut sim, &reg, 0.0);

    let reg_client = Arc::clone(&reg);
    sim.client("driver", async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle(&reg_client, 0).start(0, "hello turmoil".to_owned());
        let value = await_all_decided(&reg_client, 0).await;
        assert_eq!(value, "hello turmoil");
        Ok(())
    });

    sim.run().unwrap();
}

#[test]
fn turmoil_with_latency() {
    let _guard = init_tracing();
    let mut sim = Builder::new()
        .simulation_duration(Duration::from_secs(60))
        .min_message_latency(Duration::from_millis(10))
        .max_message_latency(Duration::from_millis(100))
        .build();

    let reg = registry();
    start_peers(&mut sim, &reg, 0.0);

    let reg_client = Arc::clone(&reg);
    sim.client("driver", async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle(&reg_client, 1).start(0, "with latency".to_owned());
        let value = await_all_decided(&reg_client, 0).await;
        assert_eq!(value, "with latency");
        Ok(())
    });

    sim.run().unwrap();
}

#[test]
fn turmoil_competing_proposers() {
    let _guard = init_tracing();
    let mut sim = Builder::new()
        .simulation_duration(Duration::from_secs(60))
        .min_message_latency(Duration::from_millis(1))
        .max_message_latency(Duration::from_millis(10))
        .build();

    let reg = registry();
    start_peers(&mut sim, &reg, 0.0);

    let reg_client = Arc::clone(&reg);
    sim.client("driver", async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        for me in 0..PEER_NAMES.len() {
            handle(&reg_client, me).start(0, format!("value-from-{me}"));
        }
        let value = await_all_decided(&reg_client, 0).await;
        assert!(value.starts_with("value-from-"));
        Ok(())
    });

    sim.run().unwrap();
}

#[test]
fn turmoil_minority_partition_stalls_until_heal() {
    let _guard = init_tracing();
    let mut sim = Builder::new()
        .simulation_duration(Duration::from_secs(120))
        .build();

    let reg = registry();
    start_peers(&mut sim, &reg, 0.0);

    let reg_client = Arc::clone(&reg);
    sim.client("driver", async move {
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Cut peer-1 off from the {0, 2} majority.
        turmoil::partition("peer-1", "peer-0");
        turmoil::partition("peer-1", "peer-2");

        // The minority proposer must not decide while cut off. The start is
        // issued from peer-1's handle, but its prepare traffic originates
        // here; partition the driver from the majority as well so the task
        // really is minority-bound.
        turmoil::partition("driver", "peer-0");
        turmoil::partition("driver", "peer-2");
        handle(&reg_client, 1).start(0, "from minority".to_owned());

        tokio::time::sleep(Duration::from_secs(5)).await;
        for me in 0..PEER_NAMES.len() {
            assert_eq!(
                handle(&reg_client, me).status(0),
                Status::Pending,
                "peer {me} decided during partition"
            );
        }

        // Heal: the still-running proposer converges everyone.
        turmoil::repair("peer-1", "peer-0");
        turmoil::repair("peer-1", "peer-2");
        turmoil::repair("driver", "peer-0");
        turmoil::repair("driver", "peer-2");

        let value = await_all_decided(&reg_client, 0).await;
        assert_eq!(value, "from minority");
        Ok(())
    });

    sim.run().unwrap();
}

#[test]
fn turmoil_unreliable_links() {
    let _guard = init_tracing();
    let mut sim = Builder::new()
        .simulation_duration(Duration::from_secs(120))
        .min_message_latency(Duration::from_millis(1))
        .max_message_latency(Duration::from_millis(20))
        .build();

    let reg = registry();
    start_peers(&mut sim, &reg, 0.2);

    let reg_client = Arc::clone(&reg);
    sim.client("driver", async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        for me in 0..PEER_NAMES.len() {
            handle(&reg_client, me).transport().set_unreliable(true);
        }

        for seq in 0..3u64 {
            handle(&reg_client, (seq as usize) % PEER_NAMES.len())
                .start(seq, format!("lossy-{seq}"));
        }
        for seq in 0..3u64 {
            let value = await_all_decided(&reg_client, seq).await;
            assert_eq!(value, format!("lossy-{seq}"));
        }
        Ok(())
    });

    sim.run().unwrap();
}

#[test]
fn turmoil_forgetting_gossip() {
    let _guard = init_tracing();
    let mut sim = Builder::new()
        .simulation_duration(Duration::from_secs(120))
        .build();

    let reg = registry();
    start_peers(&mut sim, &reg, 0.0);

    let reg_client = Arc::clone(&reg);
    sim.client("driver", async move {
        tokio::time::sleep(Duration::from_millis(200)).await;

        for seq in 0..3u64 {
            handle(&reg_client, 0).start(seq, format!("v{seq}"));
            await_all_decided(&reg_client, seq).await;
        }

        for me in 0..PEER_NAMES.len() {
            handle(&reg_client, me).done(2);
        }
        // Piggybacked watermarks only move with traffic: start one more
        // instance from every peer.
        for me in 0..PEER_NAMES.len() {
            handle(&reg_client, me).start(3 + me as u64, "gossip".to_owned());
        }

        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let min_converged =
                (0..PEER_NAMES.len()).all(|me| handle(&reg_client, me).min() == 3);
            if min_converged {
                break;
            }
        }
        for me in 0..PEER_NAMES.len() {
            let px = handle(&reg_client, me);
            for seq in 0..3u64 {
                assert_eq!(px.status(seq), Status::Forgotten);
            }
        }
        Ok(())
    });

    sim.run().unwrap();
}
