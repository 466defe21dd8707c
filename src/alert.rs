//! Typed events posted by the engine to the embedding application.
//!
//! Alerts go through a bounded queue: when the application does not keep up,
//! the oldest alerts are dropped (and counted) rather than growing the queue
//! without bound. This is the only piece of engine state shared across
//! threads behind a lock; everything else is single task owned.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use tokio::sync::Notify;

use crate::{
    error::{Error, Operation},
    PeerId, PieceIndex, TorrentId,
};

/// A typed event for the embedding application.
#[derive(Debug)]
pub enum Alert {
    /// A peer connection completed its handshake and became operational.
    PeerConnected {
        addr: SocketAddr,
        peer_id: PeerId,
    },
    /// A peer connection was closed, carrying the error kind and the
    /// operation during which it failed.
    PeerDisconnected {
        addr: SocketAddr,
        error: Error,
        op: Operation,
    },
    /// A piece was fully downloaded and passed its hash check.
    PieceFinished {
        torrent_id: TorrentId,
        piece_index: PieceIndex,
    },
    /// All pieces of a torrent have been downloaded.
    TorrentFinished {
        torrent_id: TorrentId,
    },
    /// The remote announced its DHT port; to be forwarded to the DHT.
    DhtPort {
        addr: SocketAddr,
        port: u16,
    },
    /// A tunable is limiting throughput or resources.
    PerformanceWarning(Warning),
    /// The disk collaborator reported a failure for a torrent.
    StorageError {
        torrent_id: TorrentId,
        error: std::io::Error,
    },
}

/// The performance warnings the engine can raise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Warning {
    TooFewFileDescriptors,
    SendBufferWatermarkTooLow,
    DownloadLimitTooLow,
    UploadLimitTooLow,
    TooManyOptimisticUnchokeSlots,
}

/// The bounded alert queue. Cheap to share; posting never blocks.
pub struct AlertQueue {
    alerts: Mutex<VecDeque<Alert>>,
    notify: Notify,
    capacity: usize,
    /// How many alerts have been dropped due to overflow.
    dropped: AtomicU64,
}

impl AlertQueue {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        Self {
            alerts: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Posts an alert, dropping the oldest queued alert if the queue is at
    /// capacity.
    pub fn post(&self, alert: Alert) {
        {
            let mut alerts = self.alerts.lock().unwrap();
            if alerts.len() == self.capacity {
                alerts.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            alerts.push_back(alert);
        }
        self.notify.notify_waiters();
    }

    /// Takes all queued alerts.
    pub fn drain(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().drain(..).collect()
    }

    /// Waits until at least one alert is queued, then takes them all.
    pub async fn wait(&self) -> Vec<Alert> {
        loop {
            // register for notification before checking, so a post between
            // the check and the await isn't lost
            let notified = self.notify.notified();
            let alerts = self.drain();
            if !alerts.is_empty() {
                return alerts;
            }
            notified.await;
        }
    }

    /// The number of alerts dropped on overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn piece_alert(piece_index: PieceIndex) -> Alert {
        Alert::PieceFinished {
            torrent_id: 0,
            piece_index,
        }
    }

    #[test]
    fn test_post_and_drain() {
        let queue = AlertQueue::new(4);
        queue.post(piece_alert(0));
        queue.post(piece_alert(1));
        let alerts = queue.drain();
        assert_eq!(alerts.len(), 2);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = AlertQueue::new(2);
        for i in 0..5 {
            queue.post(piece_alert(i));
        }
        let alerts = queue.drain();
        assert_eq!(alerts.len(), 2);
        match &alerts[0] {
            Alert::PieceFinished { piece_index, .. } => {
                assert_eq!(*piece_index, 3)
            }
            other => panic!("unexpected alert: {:?}", other),
        }
        assert_eq!(queue.dropped(), 3);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_post() {
        use std::sync::Arc;

        let queue = Arc::new(AlertQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait().await })
        };
        // give the waiter a chance to park first
        tokio::task::yield_now().await;
        queue.post(piece_alert(7));
        let alerts = waiter.await.unwrap();
        assert_eq!(alerts.len(), 1);
    }
}
