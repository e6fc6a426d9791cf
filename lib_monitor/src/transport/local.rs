//! # Process-Group Backend
//!
//! All ranks of the pool live in one process (one thread each, or interleaved on a
//! single thread in tests). Every rank owns an unbounded channel receiver; sends
//! complete as soon as the message is queued, so `PendingSend` is always resolved.
//!
//! Subscriptions are kept in a registry shared by the group. A publish fans out to
//! every other rank that registered a matching prefix; ranks that already left the
//! group are skipped, the same way a publisher never notices a gone subscriber.

use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{topic_matches, Mailbox, PendingSend, Received, Source, Topic, Transport};
use crate::core::topology::Rank;
use crate::errors::{ConfigurationError, TransportError};
use crate::model::{Message, Tag};

type Subscriptions = Arc<Mutex<Vec<Vec<String>>>>;

/// Factory for the endpoints of one in-memory node pool.
#[derive(Debug)]
pub struct LocalGroup;

impl LocalGroup {
    /// Creates one connected endpoint per rank, indexed by rank.
    ///
    /// # Errors
    /// `InvalidPoolSize` when `pool_size < 2`.
    pub fn create(pool_size: usize) -> Result<Vec<LocalTransport>, ConfigurationError> {
        if pool_size < 2 {
            return Err(ConfigurationError::InvalidPoolSize(pool_size));
        }

        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..pool_size).map(|_| mpsc::unbounded_channel()).unzip();
        let senders = Arc::new(senders);
        let subscriptions: Subscriptions = Arc::new(Mutex::new(vec![Vec::new(); pool_size]));

        Ok(receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalTransport {
                rank,
                pool_size,
                peers: Arc::clone(&senders),
                inbox,
                mailbox: Mailbox::default(),
                subscriptions: Arc::clone(&subscriptions),
            })
            .collect())
    }
}

/// One rank's endpoint in an in-memory node pool.
#[derive(Debug)]
pub struct LocalTransport {
    rank: Rank,
    pool_size: usize,
    peers: Arc<Vec<UnboundedSender<Received>>>,
    inbox: UnboundedReceiver<Received>,
    mailbox: Mailbox,
    subscriptions: Subscriptions,
}

impl LocalTransport {
    fn deliver(&self, dest: Rank, message: Message) -> Result<(), TransportError> {
        let peer = self.peers.get(dest).ok_or(TransportError::UnknownRank(dest))?;
        peer.send(Received {
            source: self.rank,
            message,
        })
        .map_err(|_| TransportError::Disconnected(dest))
    }

    fn drain_inbox(&mut self) {
        while let Ok(received) = self.inbox.try_recv() {
            self.mailbox.push(received);
        }
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn pool_size(&self) -> usize {
        self.pool_size
    }

    fn send(&mut self, dest: Rank, message: Message) -> Result<PendingSend, TransportError> {
        self.deliver(dest, message)?;
        Ok(PendingSend::complete())
    }

    fn try_receive(&mut self, source: Source, tag: Tag) -> Result<Option<Received>, TransportError> {
        self.drain_inbox();
        Ok(self.mailbox.take(source, tag))
    }

    fn publish(&mut self, topic: Topic, message: Message) -> Result<PendingSend, TransportError> {
        let topic = topic.as_prefix();
        let targets: Vec<Rank> = {
            let subscriptions = self
                .subscriptions
                .lock()
                .map_err(|_| TransportError::Runtime("subscription registry poisoned".into()))?;
            subscriptions
                .iter()
                .enumerate()
                .filter(|(rank, prefixes)| *rank != self.rank && topic_matches(prefixes, &topic))
                .map(|(rank, _)| rank)
                .collect()
        };

        for dest in targets {
            if self.deliver(dest, message.clone()).is_err() {
                debug!("Subscriber rank {} left the group, dropping '{}' message", dest, topic);
            }
        }
        Ok(PendingSend::complete())
    }

    fn subscribe(&mut self, prefix: &str) -> Result<(), TransportError> {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .map_err(|_| TransportError::Runtime("subscription registry poisoned".into()))?;
        let own = subscriptions
            .get_mut(self.rank)
            .ok_or(TransportError::UnknownRank(self.rank))?;
        if !own.iter().any(|p| p == prefix) {
            own.push(prefix.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Payload, ProcessedEnvelope};

    fn feedback(key: &str) -> Message {
        let mut payload = Payload::new();
        payload.insert(key.to_string(), 1.into());
        Message::Feedback(payload)
    }

    #[test]
    fn test_point_to_point_is_fifo_per_tag() {
        let mut group = LocalGroup::create(3).unwrap();
        let mut collector = group.remove(0);
        let worker = &mut group[0];

        for _ in 0..3 {
            worker
                .send(0, Message::Data(ProcessedEnvelope::terminal(1)))
                .unwrap()
                .wait()
                .unwrap();
        }
        worker.send(0, Message::Dead(1)).unwrap().wait().unwrap();

        assert!(matches!(
            collector.try_receive(Source::Any, Tag::Dead).unwrap(),
            Some(Received { source: 1, message: Message::Dead(1) })
        ));
        for _ in 0..3 {
            assert!(collector.try_receive(Source::Rank(1), Tag::Data).unwrap().is_some());
        }
        assert!(collector.try_receive(Source::Any, Tag::Data).unwrap().is_none());
    }

    #[test]
    fn test_publish_reaches_matching_subscribers_only() {
        let mut group = LocalGroup::create(3).unwrap();
        group[1].subscribe(&Topic::All.as_prefix()).unwrap();
        group[1].subscribe(&Topic::Rank(1).as_prefix()).unwrap();
        group[2].subscribe(&Topic::All.as_prefix()).unwrap();
        group[2].subscribe(&Topic::Rank(2).as_prefix()).unwrap();

        let _ = group[0].publish(Topic::All, feedback("a")).unwrap();
        let _ = group[0].publish(Topic::Rank(2), feedback("b")).unwrap();

        assert!(group[1].try_receive(Source::Rank(0), Tag::Feedback).unwrap().is_some());
        assert!(group[1].try_receive(Source::Rank(0), Tag::Feedback).unwrap().is_none());
        assert!(group[2].try_receive(Source::Rank(0), Tag::Feedback).unwrap().is_some());
        assert!(group[2].try_receive(Source::Rank(0), Tag::Feedback).unwrap().is_some());
    }

    #[test]
    fn test_send_to_departed_rank_fails() {
        let mut group = LocalGroup::create(2).unwrap();
        let worker = group.pop().unwrap();
        drop(worker);
        assert!(matches!(
            group[0].send(1, Message::Die),
            Err(TransportError::Disconnected(1))
        ));
        assert!(matches!(
            group[0].send(7, Message::Die),
            Err(TransportError::UnknownRank(7))
        ));
        // Publishing to a departed subscriber is silently dropped.
        assert!(group[0].publish(Topic::All, Message::Die).is_ok());
    }
}
