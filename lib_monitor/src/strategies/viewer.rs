//! # Viewer Endpoints
//!
//! The collector's two outward sockets, used by external viewers:
//!
//! - **`DataBroadcaster`**: publishes tagged aggregate snapshots to every connected
//!   viewer. Viewers that are too slow lose frames rather than slow the collector.
//! - **`Responder`**: request/reply. Requests are queued as they arrive and handed out
//!   one at a time by the non-blocking [`Responder::get_request`]; replies go back to
//!   the connection that asked.
//!
//! Both own a small runtime of their own, so they work next to either transport
//! backend. Frames are length-delimited JSON.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::errors::TransportError;
use crate::model::Payload;
use crate::transport::socket::{accept_subscribers, bind, build_runtime};
use crate::transport::TcpEndpoint;

const VIEWER_QUEUE_DEPTH: usize = 64;

type Clients = Arc<Mutex<HashMap<u64, UnboundedSender<Bytes>>>>;

/// One frame sent to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerFrame {
    /// Kind of data, e.g. `omdata`.
    pub tag: String,
    /// The data itself.
    pub data: Payload,
}

/// # Data Broadcaster
pub struct DataBroadcaster {
    publisher: broadcast::Sender<Bytes>,
    local_addr: SocketAddr,
    _runtime: Runtime,
}

impl DataBroadcaster {
    /// Starts listening for viewers on `endpoint`.
    pub fn bind(endpoint: &TcpEndpoint) -> Result<Self, TransportError> {
        let runtime = build_runtime()?;
        let (publisher, _) = broadcast::channel(VIEWER_QUEUE_DEPTH);
        let listener = runtime.block_on(bind(endpoint))?;
        let local_addr = listener.local_addr()?;
        runtime.spawn(accept_subscribers(listener, publisher.clone()));
        info!("Broadcasting data to viewers on {}", local_addr);
        Ok(Self {
            publisher,
            local_addr,
            _runtime: runtime,
        })
    }

    /// Address viewers connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Publishes one tagged frame. Dropped silently when no viewer is connected.
    pub fn send_data(&self, tag: &str, data: Payload) -> Result<(), TransportError> {
        let frame = ViewerFrame {
            tag: tag.to_string(),
            data,
        };
        let bytes = Bytes::from(serde_json::to_vec(&frame)?);
        if self.publisher.send(bytes).is_err() {
            debug!("No viewer connected, '{}' frame dropped", tag);
        }
        Ok(())
    }
}

/// A viewer request waiting for an answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerRequest {
    /// Connection the request came from.
    pub client: u64,
    /// Request body.
    pub body: Value,
}

/// # Responder
pub struct Responder {
    requests: UnboundedReceiver<ViewerRequest>,
    clients: Clients,
    local_addr: SocketAddr,
    _runtime: Runtime,
}

impl Responder {
    /// Starts accepting viewer requests on `endpoint`.
    pub fn bind(endpoint: &TcpEndpoint) -> Result<Self, TransportError> {
        let runtime = build_runtime()?;
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let clients: Clients = Arc::new(Mutex::new(HashMap::new()));
        let listener = runtime.block_on(bind(endpoint))?;
        let local_addr = listener.local_addr()?;
        runtime.spawn(accept_requesters(listener, requests_tx, Arc::clone(&clients)));
        info!("Answering viewer requests on {}", local_addr);
        Ok(Self {
            requests,
            clients,
            local_addr,
            _runtime: runtime,
        })
    }

    /// Address viewers send requests to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Oldest pending request, without waiting.
    pub fn get_request(&mut self) -> Option<ViewerRequest> {
        self.requests.try_recv().ok()
    }

    /// Answers `client`. A client that already disconnected is skipped.
    pub fn send_data(&self, client: u64, data: &Payload) -> Result<(), TransportError> {
        let bytes = Bytes::from(serde_json::to_vec(data)?);
        let clients = self
            .clients
            .lock()
            .map_err(|_| TransportError::Runtime("viewer client table poisoned".into()))?;
        match clients.get(&client) {
            Some(reply) if reply.send(bytes).is_ok() => {}
            _ => debug!("Viewer {} left before its reply was ready", client),
        }
        Ok(())
    }
}

async fn accept_requesters(listener: TcpListener, requests: UnboundedSender<ViewerRequest>, clients: Clients) {
    let mut next_id: u64 = 0;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                next_id += 1;
                let client = next_id;
                debug!("Viewer {} connected from {}", client, peer);
                tokio::spawn(serve_requester(stream, client, requests.clone(), Arc::clone(&clients)));
            }
            Err(e) => warn!("Failed to accept viewer connection: {}", e),
        }
    }
}

async fn serve_requester(stream: TcpStream, client: u64, requests: UnboundedSender<ViewerRequest>, clients: Clients) {
    let (read_half, write_half) = stream.into_split();
    let (reply_tx, mut replies) = mpsc::unbounded_channel::<Bytes>();
    match clients.lock() {
        Ok(mut table) => {
            table.insert(client, reply_tx);
        }
        Err(_) => return,
    }

    let writer = tokio::spawn(async move {
        let mut sink = FramedWrite::new(write_half, LengthDelimitedCodec::new());
        while let Some(bytes) = replies.recv().await {
            if sink.send(bytes).await.is_err() {
                break;
            }
        }
    });

    let mut frames = FramedRead::new(read_half, LengthDelimitedCodec::new());
    while let Some(Ok(bytes)) = frames.next().await {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(body) => {
                if requests.send(ViewerRequest { client, body }).is_err() {
                    break;
                }
            }
            Err(e) => warn!("Viewer {} sent a malformed request: {}", client, e),
        }
    }

    if let Ok(mut table) = clients.lock() {
        table.remove(&client);
    }
    writer.abort();
    debug!("Viewer {} disconnected", client);
}
