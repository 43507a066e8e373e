//! Bounded subscriber mailboxes with drop-oldest overflow.
//!
//! Live subscriptions must never block the relay reader on a slow consumer:
//! when a mailbox is full the oldest queued message is displaced, and the
//! consumer reconciles through a follow-up query. Closing delivers `None`
//! to the receiver as the teardown sentinel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

pub struct MailboxSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

pub struct MailboxReceiver<T> {
    shared: Arc<Shared<T>>,
}

pub fn mailbox<T>(capacity: usize) -> (MailboxSender<T>, MailboxReceiver<T>) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        notify: Notify::new(),
        capacity: capacity.max(1),
        closed: AtomicBool::new(false),
    });
    (
        MailboxSender {
            shared: shared.clone(),
        },
        MailboxReceiver { shared },
    )
}

impl<T> MailboxSender<T> {
    /// Enqueue without blocking. Returns the displaced message when the
    /// mailbox was full.
    pub fn send(&self, item: T) -> Option<T> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Some(item);
        }
        let displaced = {
            let mut queue = self.shared.queue.lock().expect("mailbox mutex");
            let displaced = if queue.len() >= self.shared.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(item);
            displaced
        };
        self.shared.notify.notify_one();
        displaced
    }

    /// Close the mailbox; the receiver drains what is queued, then `None`.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl<T> MailboxReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            // Register for notification before the re-check so a send
            // between the check and the await cannot be lost.
            let notified = self.shared.notify.notified();
            {
                let mut queue = self.shared.queue.lock().expect("mailbox mutex");
                if let Some(item) = queue.pop_front() {
                    return Some(item);
                }
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.shared.queue.lock().expect("mailbox mutex").pop_front()
    }
}

impl<T> Drop for MailboxReceiver<T> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_in_order() {
        let (tx, mut rx) = mailbox(8);
        tx.send(1);
        tx.send(2);
        tx.send(3);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let (tx, mut rx) = mailbox(2);
        assert!(tx.send(1).is_none());
        assert!(tx.send(2).is_none());
        assert_eq!(tx.send(3), Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn close_is_a_sentinel_after_drain() {
        let (tx, mut rx) = mailbox(8);
        tx.send("a");
        tx.close();
        assert_eq!(rx.recv().await, Some("a"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn recv_wakes_on_send() {
        let (tx, mut rx) = mailbox(8);
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(42);
        assert_eq!(handle.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn send_after_close_returns_item() {
        let (tx, _rx) = mailbox(8);
        tx.close();
        assert_eq!(tx.send(7), Some(7));
    }
}
