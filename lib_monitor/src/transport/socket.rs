//! # Socket Backend
//!
//! One rank per process, connected over TCP:
//!
//! - **data** (worker → collector): every worker pushes length-delimited JSON frames
//!   into the collector's pull listener. Each push is acknowledged once the frame has
//!   been written to the socket, which is what resolves its `PendingSend`.
//! - **feedback** (collector → workers): the collector publishes frames tagged with a
//!   topic string (`all#` or `<rank>#`). Every connected worker receives every frame
//!   and keeps only those matching one of its subscribed prefixes.
//!
//! The backend owns a small tokio runtime; the engine stays synchronous and only
//! sees non-blocking receives. Because of that, a `SocketTransport` must be created,
//! used and dropped outside of any async context.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::{topic_matches, Mailbox, PendingSend, Received, Source, TcpEndpoint, Topic, Transport};
use crate::core::topology::{Rank, COLLECTOR_RANK};
use crate::errors::TransportError;
use crate::model::{Message, Tag};

/// Frames a slow subscriber may fall behind before it starts losing them.
const PUB_QUEUE_DEPTH: usize = 1024;
/// Connection attempts a worker makes before giving up on the collector.
const CONNECT_ATTEMPTS: u32 = 40;
const INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

type Outgoing = (Bytes, oneshot::Sender<Result<(), TransportError>>);

/// The two addresses a socket node pool is wired through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEndpoints {
    /// Collector's pull listener, receiving worker data.
    pub data: TcpEndpoint,
    /// Collector's publisher, sending feedback and control messages.
    pub feedback: TcpEndpoint,
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    topic: String,
    source: Rank,
    message: Message,
}

fn encode(frame: &Frame) -> Result<Bytes, TransportError> {
    Ok(Bytes::from(serde_json::to_vec(frame)?))
}

fn decode(bytes: &[u8]) -> Result<Frame, TransportError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[derive(Debug)]
enum Side {
    Collector {
        publisher: broadcast::Sender<Bytes>,
        data_addr: SocketAddr,
        feedback_addr: SocketAddr,
    },
    Worker {
        push: UnboundedSender<Outgoing>,
        prefixes: Arc<Mutex<Vec<String>>>,
    },
}

/// # Socket Transport
///
/// A rank's endpoint in a TCP-connected node pool.
#[derive(Debug)]
pub struct SocketTransport {
    rank: Rank,
    pool_size: usize,
    inbox: UnboundedReceiver<Received>,
    mailbox: Mailbox,
    side: Side,
    // Dropped last so the I/O tasks outlive the channels above.
    _runtime: Runtime,
}

pub(crate) fn build_runtime() -> Result<Runtime, TransportError> {
    Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("om-transport")
        .enable_all()
        .build()
        .map_err(|e| TransportError::Runtime(e.to_string()))
}

pub(crate) async fn bind(endpoint: &TcpEndpoint) -> Result<TcpListener, TransportError> {
    TcpListener::bind(endpoint.socket_addr())
        .await
        .map_err(|e| TransportError::Bind {
            address: endpoint.to_string(),
            reason: e.to_string(),
        })
}

impl SocketTransport {
    /// Binds the collector side: the data pull listener and the feedback publisher.
    ///
    /// Port `0` binds an ephemeral port; see [`SocketTransport::data_addr`].
    pub fn collector(pool_size: usize, endpoints: &SocketEndpoints) -> Result<Self, TransportError> {
        let runtime = build_runtime()?;
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (publisher, _) = broadcast::channel(PUB_QUEUE_DEPTH);

        let (data_listener, feedback_listener) = runtime.block_on(async {
            Ok::<_, TransportError>((bind(&endpoints.data).await?, bind(&endpoints.feedback).await?))
        })?;
        let data_addr = data_listener.local_addr()?;
        let feedback_addr = feedback_listener.local_addr()?;

        runtime.spawn(accept_pushers(data_listener, inbox_tx));
        runtime.spawn(accept_subscribers(feedback_listener, publisher.clone()));
        info!(
            "Collector listening for data on {} and publishing feedback on {}",
            data_addr, feedback_addr
        );

        Ok(Self {
            rank: COLLECTOR_RANK,
            pool_size,
            inbox,
            mailbox: Mailbox::default(),
            side: Side::Collector {
                publisher,
                data_addr,
                feedback_addr,
            },
            _runtime: runtime,
        })
    }

    /// Connects a worker to the collector, retrying while the collector comes up.
    pub fn worker(rank: Rank, pool_size: usize, endpoints: &SocketEndpoints) -> Result<Self, TransportError> {
        if rank == COLLECTOR_RANK || rank >= pool_size {
            return Err(TransportError::UnknownRank(rank));
        }
        let runtime = build_runtime()?;
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (push, push_rx) = mpsc::unbounded_channel();
        let prefixes = Arc::new(Mutex::new(Vec::new()));

        let (push_stream, sub_stream) = runtime.block_on(async {
            Ok::<_, TransportError>((
                connect_with_retry(&endpoints.data).await?,
                connect_with_retry(&endpoints.feedback).await?,
            ))
        })?;

        runtime.spawn(write_pushed(push_stream, push_rx));
        runtime.spawn(read_published(sub_stream, Arc::clone(&prefixes), inbox_tx));
        info!("Worker {} connected to collector at {}", rank, endpoints.data);

        Ok(Self {
            rank,
            pool_size,
            inbox,
            mailbox: Mailbox::default(),
            side: Side::Worker { push, prefixes },
            _runtime: runtime,
        })
    }

    /// Bound address of the data listener (collector only).
    pub fn data_addr(&self) -> Option<SocketAddr> {
        match &self.side {
            Side::Collector { data_addr, .. } => Some(*data_addr),
            Side::Worker { .. } => None,
        }
    }

    /// Bound address of the feedback publisher (collector only).
    pub fn feedback_addr(&self) -> Option<SocketAddr> {
        match &self.side {
            Side::Collector { feedback_addr, .. } => Some(*feedback_addr),
            Side::Worker { .. } => None,
        }
    }

    fn drain_inbox(&mut self) {
        while let Ok(received) = self.inbox.try_recv() {
            self.mailbox.push(received);
        }
    }
}

impl Transport for SocketTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn pool_size(&self) -> usize {
        self.pool_size
    }

    fn send(&mut self, dest: Rank, message: Message) -> Result<PendingSend, TransportError> {
        if let Side::Worker { push, .. } = &self.side {
            if dest != COLLECTOR_RANK {
                return Err(TransportError::UnknownRank(dest));
            }
            let bytes = encode(&Frame {
                topic: String::new(),
                source: self.rank,
                message,
            })?;
            let (ack_tx, ack_rx) = oneshot::channel();
            push.send((bytes, ack_tx))
                .map_err(|_| TransportError::Disconnected(dest))?;
            return Ok(PendingSend::pending(ack_rx));
        }

        // Collector to worker traffic rides on the per-rank topic.
        if dest == COLLECTOR_RANK || dest >= self.pool_size {
            return Err(TransportError::UnknownRank(dest));
        }
        self.publish(Topic::Rank(dest), message)
    }

    fn try_receive(&mut self, source: Source, tag: Tag) -> Result<Option<Received>, TransportError> {
        self.drain_inbox();
        Ok(self.mailbox.take(source, tag))
    }

    fn publish(&mut self, topic: Topic, message: Message) -> Result<PendingSend, TransportError> {
        match &self.side {
            Side::Collector { publisher, .. } => {
                let bytes = encode(&Frame {
                    topic: topic.as_prefix(),
                    source: self.rank,
                    message,
                })?;
                if publisher.send(bytes).is_err() {
                    debug!("No subscriber connected, dropping message on '{}'", topic);
                }
                Ok(PendingSend::complete())
            }
            Side::Worker { .. } => Err(TransportError::Runtime(
                "only the collecting node publishes".into(),
            )),
        }
    }

    fn subscribe(&mut self, prefix: &str) -> Result<(), TransportError> {
        match &self.side {
            Side::Worker { prefixes, .. } => {
                let mut prefixes = prefixes
                    .lock()
                    .map_err(|_| TransportError::Runtime("subscription list poisoned".into()))?;
                if !prefixes.iter().any(|p| p == prefix) {
                    prefixes.push(prefix.to_string());
                }
                Ok(())
            }
            Side::Collector { .. } => Err(TransportError::Runtime(
                "the collecting node does not subscribe".into(),
            )),
        }
    }
}

async fn connect_with_retry(endpoint: &TcpEndpoint) -> Result<TcpStream, TransportError> {
    let address = endpoint.socket_addr();
    let mut backoff = INITIAL_BACKOFF;
    let mut last_error = String::new();

    for attempt in 1..=CONNECT_ATTEMPTS {
        match TcpStream::connect(&address).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                debug!("Connect attempt {} to {} failed: {}", attempt, endpoint, e);
                last_error = e.to_string();
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    Err(TransportError::Connect {
        address: endpoint.to_string(),
        reason: last_error,
    })
}

async fn accept_pushers(listener: TcpListener, inbox: UnboundedSender<Received>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Data connection from {}", peer);
                tokio::spawn(read_pushed(stream, peer, inbox.clone()));
            }
            Err(e) => warn!("Failed to accept data connection: {}", e),
        }
    }
}

async fn read_pushed(stream: TcpStream, peer: SocketAddr, inbox: UnboundedSender<Received>) {
    let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
    while let Some(next) = frames.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Data connection from {} failed: {}", peer, e);
                break;
            }
        };
        match decode(&bytes) {
            Ok(frame) => {
                let received = Received {
                    source: frame.source,
                    message: frame.message,
                };
                if inbox.send(received).is_err() {
                    break;
                }
            }
            Err(e) => warn!("Dropping malformed frame from {}: {}", peer, e),
        }
    }
    debug!("Data connection from {} closed", peer);
}

pub(crate) async fn accept_subscribers(listener: TcpListener, publisher: broadcast::Sender<Bytes>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Subscriber connected from {}", peer);
                tokio::spawn(forward_published(stream, peer, publisher.subscribe()));
            }
            Err(e) => warn!("Failed to accept subscriber: {}", e),
        }
    }
}

async fn forward_published(stream: TcpStream, peer: SocketAddr, mut published: broadcast::Receiver<Bytes>) {
    let mut sink = FramedWrite::new(stream, LengthDelimitedCodec::new());
    loop {
        match published.recv().await {
            Ok(bytes) => {
                if let Err(e) = sink.send(bytes).await {
                    debug!("Subscriber {} went away: {}", peer, e);
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Subscriber {} lagged, {} messages dropped", peer, skipped)
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn write_pushed(stream: TcpStream, mut queue: UnboundedReceiver<Outgoing>) {
    let mut sink = FramedWrite::new(stream, LengthDelimitedCodec::new());
    while let Some((bytes, ack)) = queue.recv().await {
        let result = sink.send(bytes).await.map_err(TransportError::from);
        let failed = result.is_err();
        // The sender may have stopped waiting; nothing to do then.
        let _ = ack.send(result);
        if failed {
            break;
        }
    }
}

async fn read_published(stream: TcpStream, prefixes: Arc<Mutex<Vec<String>>>, inbox: UnboundedSender<Received>) {
    let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
    while let Some(next) = frames.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Feedback connection failed: {}", e);
                break;
            }
        };
        let frame = match decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed feedback frame: {}", e);
                continue;
            }
        };
        let wanted = match prefixes.lock() {
            Ok(prefixes) => topic_matches(&prefixes, &frame.topic),
            Err(_) => break,
        };
        if wanted {
            let received = Received {
                source: frame.source,
                message: frame.message,
            };
            if inbox.send(received).is_err() {
                break;
            }
        }
    }
    debug!("Feedback connection closed");
}
