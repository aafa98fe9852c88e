//! Bounded queues toward the scheduler and proxy layer
//!
//! Offers never wait: when a queue is full the event is dropped, logged and
//! counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use backhaul_store::Task;
use backhaul_transport::RawConn;

/// Secret-mode visitor waiting to be paired with its task
#[derive(Debug)]
pub struct SecretConn {
    /// Hex MD5 of the task password
    pub password: String,
    pub conn: RawConn,
}

/// Receiving ends handed to the embedding server
pub struct BridgeEvents {
    pub open_task: mpsc::Receiver<Arc<Task>>,
    pub close_task: mpsc::Receiver<Arc<Task>>,
    pub close_client: mpsc::Receiver<i64>,
    pub secret: mpsc::Receiver<SecretConn>,
}

pub(crate) struct EventQueues {
    open_task: mpsc::Sender<Arc<Task>>,
    close_task: mpsc::Sender<Arc<Task>>,
    close_client: mpsc::Sender<i64>,
    secret: mpsc::Sender<SecretConn>,
    drops: AtomicU64,
}

impl EventQueues {
    pub(crate) fn new(capacity: usize) -> (Self, BridgeEvents) {
        let capacity = capacity.max(1);
        let (open_task, open_task_rx) = mpsc::channel(capacity);
        let (close_task, close_task_rx) = mpsc::channel(capacity);
        let (close_client, close_client_rx) = mpsc::channel(capacity);
        let (secret, secret_rx) = mpsc::channel(capacity);

        let queues = Self {
            open_task,
            close_task,
            close_client,
            secret,
            drops: AtomicU64::new(0),
        };
        let events = BridgeEvents {
            open_task: open_task_rx,
            close_task: close_task_rx,
            close_client: close_client_rx,
            secret: secret_rx,
        };
        (queues, events)
    }

    fn offer<T>(&self, queue: &mpsc::Sender<T>, item: T, name: &'static str) -> bool {
        match queue.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.drops.fetch_add(1, Ordering::Relaxed);
                warn!(queue = name, "Event queue is full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.drops.fetch_add(1, Ordering::Relaxed);
                warn!(queue = name, "Event queue has no consumer, dropping event");
                false
            }
        }
    }

    pub(crate) fn open_task(&self, task: Arc<Task>) -> bool {
        self.offer(&self.open_task, task, "open_task")
    }

    pub(crate) fn close_task(&self, task: Arc<Task>) -> bool {
        self.offer(&self.close_task, task, "close_task")
    }

    pub(crate) fn close_client(&self, client_id: i64) -> bool {
        self.offer(&self.close_client, client_id, "close_client")
    }

    pub(crate) fn secret(&self, conn: SecretConn) -> bool {
        self.offer(&self.secret, conn, "secret")
    }

    pub(crate) fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_drops_and_counts() {
        let (queues, mut events) = EventQueues::new(2);

        assert!(queues.close_client(1));
        assert!(queues.close_client(2));
        assert!(!queues.close_client(3));
        assert_eq!(queues.drops(), 1);

        assert_eq!(events.close_client.try_recv().unwrap(), 1);
        assert_eq!(events.close_client.try_recv().unwrap(), 2);
        assert!(events.close_client.try_recv().is_err());
    }

    #[test]
    fn test_closed_queue_counts_drop() {
        let (queues, events) = EventQueues::new(4);
        drop(events);
        assert!(!queues.close_client(7));
        assert_eq!(queues.drops(), 1);
    }
}
