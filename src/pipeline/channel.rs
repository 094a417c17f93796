//! Bounded frame channel
//!
//! Fixed-capacity FIFO between the producer and the sink. Sending never
//! blocks: when the channel is full the item is dropped and counted.
//! Receiving blocks with a timeout so consumers can notice shutdown.
//!
//! Every delivered item is wrapped in an [`InFlight`] guard. The channel
//! counts an item as pending from the moment it is accepted until its guard
//! is dropped, which lets the controller wait for queued *and* in-flight
//! work to finish before tearing down the sink.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, warn};

/// Message carried by the channel
#[derive(Debug)]
pub enum Message<T> {
    /// A unit of work
    Item(T),
    /// Poison item: no further work will arrive for this consumer
    Shutdown,
}

/// Why an item was not accepted
#[derive(Debug)]
pub enum Rejected<T> {
    /// The channel was at capacity
    Full(T),
    /// Every receiver is gone
    Disconnected(T),
}

/// Result of a blocking receive
#[derive(Debug)]
pub enum Received<T> {
    Item(InFlight<T>),
    Shutdown,
    Timeout,
    Disconnected,
}

/// Channel counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub capacity: usize,
    /// Items waiting in the queue
    pub queued: usize,
    /// Items queued or being processed
    pub pending: usize,
    /// Items handed to a consumer
    pub delivered: u64,
    /// Items rejected by `try_send`
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Shared {
    pending: Mutex<usize>,
    drained: Condvar,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn complete_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }
}

/// Creates a bounded channel with the given capacity
pub fn bounded<T>(capacity: usize) -> (ChannelSender<T>, ChannelReceiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let shared = Arc::new(Shared::default());
    (
        ChannelSender {
            tx,
            shared: Arc::clone(&shared),
            capacity,
        },
        ChannelReceiver { rx, shared },
    )
}

/// Producer side of the channel
#[derive(Debug)]
pub struct ChannelSender<T> {
    tx: Sender<Message<T>>,
    shared: Arc<Shared>,
    capacity: usize,
}

impl<T> Clone for ChannelSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
            capacity: self.capacity,
        }
    }
}

impl<T> ChannelSender<T> {
    /// Enqueues an item without blocking
    ///
    /// A rejected item is counted as dropped and handed back to the caller.
    pub fn try_send(&self, item: T) -> Result<(), Rejected<T>> {
        *self.shared.pending.lock() += 1;

        match self.tx.try_send(Message::Item(item)) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.shared.complete_one();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                match err {
                    TrySendError::Full(Message::Item(item)) => {
                        warn!(
                            "Frame channel full ({} items), dropping item",
                            self.capacity
                        );
                        Err(Rejected::Full(item))
                    }
                    TrySendError::Disconnected(Message::Item(item)) => {
                        Err(Rejected::Disconnected(item))
                    }
                    TrySendError::Full(Message::Shutdown)
                    | TrySendError::Disconnected(Message::Shutdown) => {
                        unreachable!("try_send only sends items")
                    }
                }
            }
        }
    }

    /// Sends `count` poison items, waiting up to `timeout` for each slot
    ///
    /// Returns the number actually delivered to the queue.
    pub fn send_shutdown(&self, count: usize, timeout: Duration) -> usize {
        let mut sent = 0;
        for _ in 0..count {
            match self.tx.send_timeout(Message::Shutdown, timeout) {
                Ok(()) => sent += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!("Timed out queueing shutdown signal");
                    break;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    debug!("All consumers already gone");
                    break;
                }
            }
        }
        sent
    }

    /// Waits until every accepted item has been processed
    ///
    /// Returns false if items were still pending when `timeout` elapsed.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            if self
                .shared
                .drained
                .wait_until(&mut pending, deadline)
                .timed_out()
            {
                return *pending == 0;
            }
        }
        true
    }

    /// Returns the channel counters
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            capacity: self.capacity,
            queued: self.tx.len(),
            pending: *self.shared.pending.lock(),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }

    /// Number of items rejected so far
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer side of the channel; clone it to share work among workers
#[derive(Debug)]
pub struct ChannelReceiver<T> {
    rx: Receiver<Message<T>>,
    shared: Arc<Shared>,
}

impl<T> Clone for ChannelReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> ChannelReceiver<T> {
    /// Waits up to `timeout` for the next message
    pub fn recv_timeout(&self, timeout: Duration) -> Received<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(Message::Item(item)) => {
                self.shared.delivered.fetch_add(1, Ordering::Relaxed);
                Received::Item(InFlight {
                    item,
                    shared: Arc::clone(&self.shared),
                })
            }
            Ok(Message::Shutdown) => Received::Shutdown,
            Err(RecvTimeoutError::Timeout) => Received::Timeout,
            Err(RecvTimeoutError::Disconnected) => Received::Disconnected,
        }
    }

    /// Returns true if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// An item being processed; marks the item complete when dropped
#[derive(Debug)]
pub struct InFlight<T> {
    item: T,
    shared: Arc<Shared>,
}

impl<T> Deref for InFlight<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T> DerefMut for InFlight<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T> Drop for InFlight<T> {
    fn drop(&mut self) {
        self.shared.complete_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(10);

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let (tx, rx) = bounded::<u32>(1);

        let started = Instant::now();
        assert!(tx.try_send(1).is_ok());
        assert!(matches!(tx.try_send(2), Err(Rejected::Full(2))));
        assert!(matches!(tx.try_send(3), Err(Rejected::Full(3))));
        assert!(started.elapsed() < Duration::from_millis(100));

        assert_eq!(tx.dropped(), 2);
        match rx.recv_timeout(SHORT) {
            Received::Item(item) => assert_eq!(*item, 1),
            other => panic!("expected item, got {:?}", other),
        }
        assert!(matches!(rx.recv_timeout(SHORT), Received::Timeout));

        let stats = tx.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_fifo_order() {
        let (tx, rx) = bounded::<u32>(8);
        for i in 0..5 {
            tx.try_send(i).unwrap();
        }
        let received: Vec<u32> = (0..5)
            .map(|_| match rx.recv_timeout(SHORT) {
                Received::Item(item) => *item,
                other => panic!("expected item, got {:?}", other),
            })
            .collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_wait_drained_covers_in_flight_items() {
        let (tx, rx) = bounded::<u32>(4);
        tx.try_send(7).unwrap();

        let item = match rx.recv_timeout(SHORT) {
            Received::Item(item) => item,
            other => panic!("expected item, got {:?}", other),
        };
        // Queue is empty but the item is still being processed
        assert!(rx.is_empty());
        assert!(!tx.wait_drained(Duration::from_millis(20)));

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            drop(item);
        });
        assert!(tx.wait_drained(Duration::from_secs(2)));
        worker.join().unwrap();
    }

    #[test]
    fn test_shutdown_messages() {
        let (tx, rx) = bounded::<u32>(2);
        assert_eq!(tx.send_shutdown(2, SHORT), 2);
        assert!(matches!(rx.recv_timeout(SHORT), Received::Shutdown));
        assert!(matches!(rx.recv_timeout(SHORT), Received::Shutdown));
        // Shutdown messages never count as pending work
        assert!(tx.wait_drained(SHORT));
    }

    #[test]
    fn test_disconnected_receiver() {
        let (tx, rx) = bounded::<u32>(2);
        drop(rx);
        assert!(matches!(tx.try_send(1), Err(Rejected::Disconnected(1))));
        assert_eq!(tx.send_shutdown(1, SHORT), 0);
        assert!(tx.wait_drained(SHORT));
    }
}
