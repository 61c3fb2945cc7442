// SPDX-License-Identifier: Apache-2.0

//! Bounded MPMC channel used between tailers, the fan-in and the dispatch
//! loop. A capacity of zero creates a rendezvous channel: a send completes
//! only once a receiver takes the item, which is how the fan-in propagates
//! backpressure from a slow consumer to every log source.

use flume::{Receiver, Sender};
use std::fmt;

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
        }
    }
}

impl std::error::Error for SendError {}

impl<T> BoundedSender<T> {
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        match self.tx.send_async(item).await {
            Ok(()) => Ok(()),
            Err(_e) => Err(SendError::Disconnected), // receiver closed
        }
    }

    /// Blocking send - blocks until there is capacity in the channel.
    /// Use this from non-async contexts (e.g., tailer reader threads).
    pub fn send_blocking(&self, item: T) -> Result<(), SendError> {
        match self.tx.send(item) {
            Ok(()) => Ok(()),
            Err(_e) => Err(SendError::Disconnected), // receiver closed
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    /// Returns the next item, or None once all senders are dropped.
    pub async fn next(&mut self) -> Option<T> {
        match self.rx.recv_async().await {
            Ok(item) => Some(item),
            Err(_e) => None, // disconnected
        }
    }

    /// Non-blocking receive - returns immediately.
    /// Returns None if no item is available or channel is disconnected.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);

    (BoundedSender { tx }, BoundedReceiver { rx })
}

/// Zero-capacity channel: every send waits for a matching receive.
pub fn rendezvous<T>() -> (BoundedSender<T>, BoundedReceiver<T>) {
    bounded(0)
}

#[cfg(test)]
mod tests {
    use super::{SendError, bounded, rendezvous};
    use tokio_test::{assert_ok, assert_pending, assert_ready, task::spawn};

    #[tokio::test]
    async fn basics() {
        let (tx, mut rx) = bounded(3);

        let msg = 10;

        // wrap futures
        let mut send1 = spawn(async { tx.send(msg).await });
        let mut recv1 = spawn(async { rx.next().await });

        // both asleep
        assert!(!send1.is_woken());
        assert!(!recv1.is_woken());

        // receiver should be in pending state
        assert_pending!(recv1.poll());

        assert_ok!(assert_ready!(send1.poll()));

        assert!(recv1.is_woken());

        assert_eq!(Some(msg), assert_ready!(recv1.poll()));

        drop(send1);
        drop(recv1);

        let mut recv2 = spawn(async { rx.next().await });

        drop(tx);
        // receives None since send channel was closed
        assert_eq!(None, assert_ready!(recv2.poll()));
    }

    #[tokio::test]
    async fn sender_blocks_on_full() {
        let (tx, mut rx) = bounded(1);

        let msg = 10;

        // wrap futures
        let mut send1 = spawn(async { tx.send(msg).await });
        let mut recv1 = spawn(async { rx.next().await });

        // receiver should be in pending state
        assert!(!recv1.is_woken());

        assert_ok!(assert_ready!(send1.poll()));

        drop(send1);
        let mut send2 = spawn(async { tx.send(msg).await });

        // Now blocks
        assert_pending!(send2.poll());

        assert_eq!(Some(msg), assert_ready!(recv1.poll()));

        // now this is ok
        assert_ok!(assert_ready!(send2.poll()));
    }

    #[tokio::test]
    async fn rendezvous_blocks_until_received() {
        let (tx, mut rx) = rendezvous();

        let mut send1 = spawn(async { tx.send(1).await });

        // no receiver yet, the send cannot complete
        assert_pending!(send1.poll());

        let mut recv1 = spawn(async { rx.next().await });
        assert_eq!(Some(1), assert_ready!(recv1.poll()));

        assert_ok!(assert_ready!(send1.poll()));
    }

    #[tokio::test]
    async fn sender_fails_on_rx_close() {
        let (tx, rx) = bounded(1);

        let msg = 10;

        // wrap futures
        let mut send1 = spawn(async { tx.send(msg).await });

        drop(rx);
        assert_eq!(Err(SendError::Disconnected), assert_ready!(send1.poll()));
    }
}
