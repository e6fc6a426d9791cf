//! # Transport Layer
//!
//! Point-to-point and publish/subscribe messaging between the ranks of one node
//! pool. The engine only ever talks to the [`Transport`] trait; which backend sits
//! behind it is decided once at startup.
//!
//! ## Core Components:
//!
//! - **`Transport`**: the capability set every backend provides. `try_receive` never
//!   blocks; `send` and `publish` hand back a [`PendingSend`].
//! - **`PendingSend` / `SendSlot`**: the single-outstanding-send discipline. A slot
//!   resolves its previous send before it issues the next one.
//! - **`Mailbox`**: per-tag FIFO buffers shared by the backends, so polling one
//!   tag never consumes a message of another. Feedback is capped at
//!   [`FEEDBACK_HIGH_WATER_MARK`] and loses its oldest entries first.
//! - **`local`**: in-memory process-group backend (one rank per thread).
//! - **`socket`**: TCP push/pull plus pub/sub backend (one rank per process).

use std::collections::{HashMap, VecDeque};
use std::fmt;

use log::debug;
use tokio::sync::oneshot;

use crate::core::topology::Rank;
use crate::errors::TransportError;
use crate::model::{Message, Tag};

pub mod endpoint;
pub mod local;
#[cfg(feature = "socket")]
pub mod socket;

pub use endpoint::TcpEndpoint;
pub use local::{LocalGroup, LocalTransport};
#[cfg(feature = "socket")]
pub use socket::{SocketEndpoints, SocketTransport};

/// Which sender a receive accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Any rank.
    Any,
    /// Only the given rank.
    Rank(Rank),
}

impl Source {
    /// True if a message from `rank` passes this filter.
    pub fn accepts(self, rank: Rank) -> bool {
        match self {
            Source::Any => true,
            Source::Rank(expected) => expected == rank,
        }
    }
}

/// Publish/subscribe topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// Every processing node.
    All,
    /// One processing node.
    Rank(Rank),
}

impl Topic {
    /// Wire string of the topic. Subscribers match it by prefix.
    pub fn as_prefix(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::All => write!(f, "all#"),
            Topic::Rank(rank) => write!(f, "{}#", rank),
        }
    }
}

/// A message taken out of the transport, with the rank that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    /// Sending rank.
    pub source: Rank,
    /// The message itself.
    pub message: Message,
}

/// # Transport
///
/// The contract the engine is written against. Messages on one
/// (source, destination, tag) channel arrive in the order they were sent.
pub trait Transport: Send {
    /// Rank of the node owning this endpoint.
    fn rank(&self) -> Rank;

    /// Number of ranks in the pool, collector included.
    fn pool_size(&self) -> usize;

    /// Starts an asynchronous point-to-point send.
    fn send(&mut self, dest: Rank, message: Message) -> Result<PendingSend, TransportError>;

    /// Returns the oldest pending message on `tag` accepted by `source`, or `None`
    /// without waiting.
    fn try_receive(&mut self, source: Source, tag: Tag) -> Result<Option<Received>, TransportError>;

    /// Broadcasts to every subscriber whose registered prefix matches `topic`.
    fn publish(&mut self, topic: Topic, message: Message) -> Result<PendingSend, TransportError>;

    /// Registers interest in every topic starting with `prefix`.
    fn subscribe(&mut self, prefix: &str) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn rank(&self) -> Rank {
        (**self).rank()
    }

    fn pool_size(&self) -> usize {
        (**self).pool_size()
    }

    fn send(&mut self, dest: Rank, message: Message) -> Result<PendingSend, TransportError> {
        (**self).send(dest, message)
    }

    fn try_receive(&mut self, source: Source, tag: Tag) -> Result<Option<Received>, TransportError> {
        (**self).try_receive(source, tag)
    }

    fn publish(&mut self, topic: Topic, message: Message) -> Result<PendingSend, TransportError> {
        (**self).publish(topic, message)
    }

    fn subscribe(&mut self, prefix: &str) -> Result<(), TransportError> {
        (**self).subscribe(prefix)
    }
}

/// # Pending Send
///
/// Handle to an in-flight asynchronous send. Resolve it with [`PendingSend::wait`]
/// before reusing the channel.
#[derive(Debug)]
#[must_use = "an unresolved send may still be in flight"]
pub struct PendingSend {
    ack: Option<oneshot::Receiver<Result<(), TransportError>>>,
}

impl PendingSend {
    /// A send that completed synchronously.
    pub fn complete() -> Self {
        Self { ack: None }
    }

    /// A send that completes when the backend fires `ack`.
    pub fn pending(ack: oneshot::Receiver<Result<(), TransportError>>) -> Self {
        Self { ack: Some(ack) }
    }

    /// True if nothing is left to wait for.
    pub fn is_complete(&self) -> bool {
        self.ack.is_none()
    }

    /// Blocks until the send has been flushed.
    ///
    /// Must not be called from inside an async context.
    pub fn wait(self) -> Result<(), TransportError> {
        match self.ack {
            None => Ok(()),
            Some(ack) => ack
                .blocking_recv()
                .map_err(|_| TransportError::Runtime("send task dropped before completion".into()))?,
        }
    }
}

/// # Send Slot
///
/// Holds at most one outstanding send. Every new send first resolves the previous one.
#[derive(Debug, Default)]
pub struct SendSlot {
    pending: Option<PendingSend>,
}

impl SendSlot {
    /// An empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the outstanding send, if any.
    pub fn wait_send_complete(&mut self) -> Result<(), TransportError> {
        match self.pending.take() {
            Some(pending) => pending.wait(),
            None => Ok(()),
        }
    }

    /// Resolves the previous send, then issues `start` and keeps its handle.
    pub fn issue<F>(&mut self, start: F) -> Result<(), TransportError>
    where
        F: FnOnce() -> Result<PendingSend, TransportError>,
    {
        self.wait_send_complete()?;
        let pending = start()?;
        if !pending.is_complete() {
            self.pending = Some(pending);
        }
        Ok(())
    }

    /// True while a send is still outstanding.
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }
}

/// Feedback messages a mailbox keeps before it drops the oldest.
///
/// A worker merges at most one feedback per record, while the collector may
/// publish one for every envelope it collects.
pub const FEEDBACK_HIGH_WATER_MARK: usize = 16;

/// Per-tag FIFO buffers of received messages.
#[derive(Debug, Default)]
pub struct Mailbox {
    queues: HashMap<Tag, VecDeque<Received>>,
    dropped: u64,
}

impl Mailbox {
    /// Files a message under its own tag, dropping the oldest feedback past the
    /// high-water mark.
    pub fn push(&mut self, received: Received) {
        let tag = received.message.tag();
        self.queues.entry(tag).or_default().push_back(received);
        if tag == Tag::Feedback && self.len(tag) > FEEDBACK_HIGH_WATER_MARK {
            if let Some(queue) = self.queues.get_mut(&tag) {
                queue.pop_front();
            }
            self.dropped += 1;
            if self.dropped.is_power_of_two() {
                debug!(
                    "Feedback backlog above {} on tag {}, {} dropped so far",
                    FEEDBACK_HIGH_WATER_MARK, tag, self.dropped
                );
            }
        }
    }

    /// Removes the oldest message on `tag` that `source` accepts.
    pub fn take(&mut self, source: Source, tag: Tag) -> Option<Received> {
        let queue = self.queues.get_mut(&tag)?;
        let index = queue.iter().position(|r| source.accepts(r.source))?;
        queue.remove(index)
    }

    /// Number of buffered messages on `tag`.
    pub fn len(&self, tag: Tag) -> usize {
        self.queues.get(&tag).map_or(0, VecDeque::len)
    }
}

/// True if any registered prefix matches `topic`.
pub fn topic_matches(prefixes: &[String], topic: &str) -> bool {
    prefixes.iter().any(|p| topic.starts_with(p.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessedEnvelope;

    fn data(rank: Rank) -> Received {
        Received {
            source: rank,
            message: Message::Data(ProcessedEnvelope::terminal(rank)),
        }
    }

    #[test]
    fn test_mailbox_filters_by_tag_and_source() {
        let mut mailbox = Mailbox::default();
        mailbox.push(data(1));
        mailbox.push(Received { source: 0, message: Message::Die });
        mailbox.push(data(2));

        assert!(mailbox.take(Source::Any, Tag::Feedback).is_none());
        assert_eq!(mailbox.take(Source::Rank(2), Tag::Data).map(|r| r.source), Some(2));
        assert_eq!(mailbox.take(Source::Any, Tag::Data).map(|r| r.source), Some(1));
        assert_eq!(mailbox.len(Tag::Die), 1);
        assert!(mailbox.take(Source::Rank(0), Tag::Die).is_some());
        assert_eq!(mailbox.len(Tag::Data), 0);
        assert_eq!(mailbox.len(Tag::Die), 0);
    }

    #[test]
    fn test_feedback_backlog_keeps_the_newest() {
        let mut mailbox = Mailbox::default();
        let total = FEEDBACK_HIGH_WATER_MARK + 10;
        for n in 0..total {
            let mut payload = crate::model::Payload::new();
            payload.insert("n".to_string(), n.into());
            mailbox.push(Received { source: 0, message: Message::Feedback(payload) });
        }
        for rank in 1..=total {
            mailbox.push(data(rank));
        }

        assert_eq!(mailbox.len(Tag::Feedback), FEEDBACK_HIGH_WATER_MARK);
        assert_eq!(mailbox.len(Tag::Data), total);
        match mailbox.take(Source::Rank(0), Tag::Feedback).map(|r| r.message) {
            Some(Message::Feedback(payload)) => assert_eq!(payload["n"], serde_json::json!(10)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_topic_prefixes() {
        let prefixes = vec![Topic::All.as_prefix(), Topic::Rank(2).as_prefix()];
        assert!(topic_matches(&prefixes, "all#"));
        assert!(topic_matches(&prefixes, "2#"));
        assert!(!topic_matches(&prefixes, "12#"));
        assert!(!topic_matches(&prefixes, "3#"));
    }

    #[test]
    fn test_slot_waits_for_previous_send() {
        let mut slot = SendSlot::new();
        let (tx, rx) = oneshot::channel();
        slot.issue(|| Ok(PendingSend::pending(rx))).unwrap();
        assert!(slot.is_busy());

        tx.send(Ok(())).unwrap();
        slot.issue(|| Ok(PendingSend::complete())).unwrap();
        assert!(!slot.is_busy());
    }

    #[test]
    fn test_dropped_send_task_is_an_error() {
        let (tx, rx) = oneshot::channel::<Result<(), TransportError>>();
        drop(tx);
        assert!(matches!(
            PendingSend::pending(rx).wait(),
            Err(TransportError::Runtime(_))
        ));
    }
}
