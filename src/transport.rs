//! Wire transport for peer-to-peer requests
//!
//! The consensus core only needs the logical contract in [`Transport`]: issue
//! one request to one peer and await its reply. A TCP implementation with
//! length-prefixed postcard frames is provided, along with the matching serve
//! loop, but tests freely substitute loopback or simulated transports.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, Stream, StreamExt};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::acceptor::{AcceptorHandler, PeerKilled};
use crate::messages::{Reply, Request, Value};

/// One logical RPC to a peer, identified by its index in the group.
///
/// Implementations must eventually resolve every call: the proposer bounds
/// each call with its phase timeout, but a transport should fail fast on its
/// own when it can tell the peer is unreachable.
pub trait Transport<V: Value>: Send + Sync + 'static {
    /// Send `request` to the peer at `to` and await its reply.
    fn call(
        &self,
        to: usize,
        request: Request<V>,
    ) -> impl Future<Output = io::Result<Reply<V>>> + Send;
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Generic length-prefixed postcard codec
pub struct PostcardCodec<Enc, Dec>(std::marker::PhantomData<(Enc, Dec)>);

impl<Enc, Dec> Default for PostcardCodec<Enc, Dec> {
    fn default() -> Self {
        Self(std::marker::PhantomData)
    }
}

impl<Enc: serde::Serialize, Dec> Encoder<Enc> for PostcardCodec<Enc, Dec> {
    type Error = io::Error;

    fn encode(&mut self, item: Enc, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded =
            postcard::to_allocvec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        dst.put_u32_le(u32::try_from(encoded.len()).expect("frame fits in u32"));
        dst.extend_from_slice(&encoded);
        Ok(())
    }
}

impl<Enc, Dec: serde::de::DeserializeOwned> Decoder for PostcardCodec<Enc, Dec> {
    type Item = Dec;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes(src[..4].try_into().unwrap()) as usize;
        if src.len() < 4 + len {
            return Ok(None);
        }
        src.advance(4);
        let data = src.split_to(len);
        let item = postcard::from_bytes(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(item))
    }
}

/// Codec for the requesting side: encodes requests, decodes replies.
pub type ClientCodec<V> = PostcardCodec<Request<V>, Reply<V>>;

/// Codec for the serving side: encodes replies, decodes requests.
pub type ServerCodec<V> = PostcardCodec<Reply<V>, Request<V>>;

// ---------------------------------------------------------------------------
// TCP transport
// ---------------------------------------------------------------------------

/// TCP transport dialing one connection per call.
///
/// A refused or reset connection surfaces as an error immediately; the
/// proposer treats it as an implicit reject.
pub struct TcpTransport {
    peers: Vec<SocketAddr>,
}

impl TcpTransport {
    /// Create a transport for the given ordered peer addresses.
    #[must_use]
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { peers }
    }
}

impl<V: Value> Transport<V> for TcpTransport {
    fn call(
        &self,
        to: usize,
        request: Request<V>,
    ) -> impl Future<Output = io::Result<Reply<V>>> + Send {
        let addr = self.peers[to];
        async move {
            let stream = TcpStream::connect(addr).await?;
            let mut framed = Framed::new(stream, ClientCodec::<V>::default());
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

// ---------------------------------------------------------------------------
// Serve loops
// ---------------------------------------------------------------------------

/// Serve one framed connection until it closes, the peer is killed, or the
/// token fires.
///
/// Generic over the connection so simulated networks plug in the same loop.
///
/// # Errors
///
/// Returns an error if reading or writing the connection fails.
pub async fn serve_conn<V, C>(
    handler: AcceptorHandler<V>,
    mut conn: C,
    cancel: CancellationToken,
) -> io::Result<()>
where
    V: Value,
    C: Stream<Item = io::Result<Request<V>>> + futures::Sink<Reply<V>, Error = io::Error> + Unpin,
{
    loop {
        let request = select! {
            () = cancel.cancelled() => return Ok(()),
            request = conn.next() => request,
        };
        let Some(request) = request else {
            return Ok(());
        };
        match handler.handle(request?) {
            Ok(reply) => conn.send(reply).await?,
            Err(PeerKilled) => return Ok(()),
        }
    }
}

/// Accept framed TCP connections and dispatch their requests to `handler`
/// until the token fires.
///
/// # Errors
///
/// Returns an error if accepting a connection fails.
pub async fn serve<V: Value>(
    listener: TcpListener,
    handler: AcceptorHandler<V>,
    cancel: CancellationToken,
) -> io::Result<()> {
    debug!("acceptor listening");
    loop {
        let accepted = select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = accepted?;
        trace!(%remote, "connection accepted");
        let conn = Framed::new(stream, ServerCodec::default());
        let handler = handler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = serve_conn(handler, conn, cancel).await {
                debug!(%error, "connection closed with error");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

/// Transport wrapper that drops requests and replies with a configured
/// probability while the unreliable toggle is on.
///
/// Dropping a request loses it before the peer sees it; dropping a reply
/// loses it after the peer already acted. Both surface as timeouts to the
/// caller, exercising the proposer's retry path without changing any
/// correctness obligation.
pub struct Lossy<T> {
    inner: T,
    drop_probability: f64,
    unreliable: AtomicBool,
    rng: Mutex<StdRng>,
}

impl<T> Lossy<T> {
    /// Wrap `inner`, dropping each direction with `drop_probability` when
    /// unreliable mode is on. Starts reliable.
    #[must_use]
    pub fn new(inner: T, drop_probability: f64, seed: u64) -> Self {
        Self {
            inner,
            drop_probability,
            unreliable: AtomicBool::new(false),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Toggle unreliable mode at runtime.
    pub fn set_unreliable(&self, unreliable: bool) {
        self.unreliable.store(unreliable, Ordering::Relaxed);
    }

    fn dropped(&self) -> bool {
        self.unreliable.load(Ordering::Relaxed)
            && self.rng.lock().unwrap().random_bool(self.drop_probability)
    }
}

impl<V: Value, T: Transport<V>> Transport<V> for Lossy<T> {
    fn call(
        &self,
        to: usize,
        request: Request<V>,
    ) -> impl Future<Output = io::Result<Reply<V>>> + Send {
        async move {
            if self.dropped() {
                trace!(to, "dropped outbound request");
                return Err(io::Error::new(io::ErrorKind::TimedOut, "request lost"));
            }
            let reply = self.inner.call(to, request).await?;
            if self.dropped() {
                trace!(to, "dropped inbound reply");
                return Err(io::Error::new(io::ErrorKind::TimedOut, "reply lost"));
            }
            Ok(reply)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ProposalNumber;
    use crate::messages::RequestBody;

    #[test]
    fn codec_round_trips_requests() {
        let mut codec = ServerCodec::<String>::default();
        let mut encoder = ClientCodec::<String>::default();
        let request = Request {
            from: 2,
            done: Some(7),
            body: RequestBody::Accept {
                seq: 4,
                n: ProposalNumber::new(3, 2),
                value: "value".to_owned(),
            },
        };

        let mut buf = BytesMut::new();
        encoder.encode(request.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, request);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_waits_for_full_frame() {
        let mut encoder = ClientCodec::<String>::default();
        let mut codec = ServerCodec::<String>::default();
        let request = Request {
            from: 0,
            done: None,
            body: RequestBody::Decided {
                seq: 1,
                value: "v".to_owned(),
            },
        };

        let mut buf = BytesMut::new();
        encoder.encode(request, &mut buf).unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }
}
