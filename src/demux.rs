//! src/demux.rs
//!
//! Single-producer, many-subscriber fan-out. One received envelope is
//! routed to every subscriber whose predicate matches; delivery is
//! non-blocking so one slow subscriber can never stall another
//! (spec.md §4.2, §9).

use crate::envelope::GossipMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Default bound on a subscriber's delivery queue (spec.md §3).
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 10;

type Predicate = dyn Fn(&GossipMessage) -> bool + Send + Sync;

struct Subscription {
    predicate: Arc<Predicate>,
    sender: mpsc::Sender<Arc<GossipMessage>>,
}

/// Routes inbound messages to registered subscribers.
#[derive(Default)]
pub struct Demultiplexer {
    subscriptions: Mutex<Vec<Subscription>>,
    closed: AtomicBool,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber matching `predicate`, returning the
    /// receiving half of its bounded delivery queue. Fails (returns `None`)
    /// once the demultiplexer has been closed.
    pub fn add_channel(
        &self,
        predicate: impl Fn(&GossipMessage) -> bool + Send + Sync + 'static,
    ) -> Option<mpsc::Receiver<Arc<GossipMessage>>> {
        self.add_channel_with_capacity(predicate, DEFAULT_SUBSCRIPTION_BUFFER)
    }

    pub fn add_channel_with_capacity(
        &self,
        predicate: impl Fn(&GossipMessage) -> bool + Send + Sync + 'static,
        capacity: usize,
    ) -> Option<mpsc::Receiver<Arc<GossipMessage>>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let (tx, rx) = mpsc::channel(capacity);
        let mut subs = self.subscriptions.lock().unwrap();
        // Re-check under the lock: a close() may have landed between the
        // flag check above and taking the lock.
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        subs.push(Subscription {
            predicate: Arc::new(predicate),
            sender: tx,
        });
        Some(rx)
    }

    /// Evaluates every subscriber's predicate against `message` and attempts
    /// a non-blocking delivery to each match. A full subscriber queue drops
    /// the message for that subscriber only (spec.md §9 Open Question:
    /// drop-on-full rather than growing the buffer or blocking).
    pub fn demultiplex(&self, message: GossipMessage) {
        let shared = Arc::new(message);
        let subs = self.subscriptions.lock().unwrap();
        for sub in subs.iter() {
            if (sub.predicate)(&shared) {
                if sub.sender.try_send(Arc::clone(&shared)).is_err() {
                    tracing::trace!("subscriber queue full or closed; message dropped for it");
                }
            }
        }
    }

    /// Closes the demultiplexer: every subscriber's channel is dropped
    /// (closing it from the sender side) and further `add_channel` calls
    /// are rejected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscriptions.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: u8) -> GossipMessage {
        GossipMessage::Payload(vec![n])
    }

    #[tokio::test]
    async fn matching_predicate_receives_message() {
        let demux = Demultiplexer::new();
        let mut rx = demux.add_channel(|_| true).unwrap();
        demux.demultiplex(msg(1));
        let received = rx.recv().await.unwrap();
        assert_eq!(*received, msg(1));
    }

    #[tokio::test]
    async fn non_matching_predicate_is_skipped() {
        let demux = Demultiplexer::new();
        let mut rx = demux.add_channel(|_| false).unwrap();
        demux.demultiplex(msg(1));
        // Give any erroneous delivery a chance to land before asserting
        // emptiness.
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_subscriber_queue_drops_without_blocking_others() {
        let demux = Demultiplexer::new();
        let mut slow = demux.add_channel_with_capacity(|_| true, 1).unwrap();
        let mut fast = demux.add_channel_with_capacity(|_| true, 4).unwrap();

        demux.demultiplex(msg(1));
        demux.demultiplex(msg(2)); // slow's queue (capacity 1) is now full

        assert_eq!(*fast.recv().await.unwrap(), msg(1));
        assert_eq!(*fast.recv().await.unwrap(), msg(2));
        assert_eq!(*slow.recv().await.unwrap(), msg(1));
        assert!(slow.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_drops_subscribers_and_rejects_new_ones() {
        let demux = Demultiplexer::new();
        let mut rx = demux.add_channel(|_| true).unwrap();
        demux.close();
        assert!(rx.recv().await.is_none());
        assert!(demux.add_channel(|_| true).is_none());
    }
}
