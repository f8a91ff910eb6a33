//! Backpressured producer/consumer queues gating the pump loops.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Semaphore;

/// The queue was closed; the connection is going away.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QueueClosed;

/// An async producer/consumer queue with a read gate and a write gate.
///
/// [`AsyncQueue::bounded`] admits one in-flight item: `push` suspends until
/// the previous item was consumed, which is what keeps the send pump from
/// racing ahead of the socket. [`AsyncQueue::relaxed`] always admits writes
/// and only gates reads, which suits receive buffering.
///
/// Both gates are permit-counting semaphores rather than hand-rolled
/// promise pairs; closing the queue wakes every parked caller with
/// [`QueueClosed`].
pub struct AsyncQueue<T> {
    items: Semaphore,
    slots: Option<Semaphore>,
    queue: Mutex<VecDeque<T>>,
}

impl<T> AsyncQueue<T> {
    /// A single-slot queue: the producer waits until the consumer caught up.
    pub fn bounded() -> Self {
        Self {
            items: Semaphore::new(0),
            slots: Some(Semaphore::new(1)),
            queue: Mutex::new(VecDeque::with_capacity(1)),
        }
    }

    /// An unbounded queue: writes always proceed, reads still suspend until
    /// an item arrives.
    pub fn relaxed() -> Self {
        Self {
            items: Semaphore::new(0),
            slots: None,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Append `value`, suspending while the write gate is closed.
    pub async fn push(&self, value: T) -> Result<(), QueueClosed> {
        if let Some(slots) = &self.slots {
            slots.acquire().await.map_err(|_| QueueClosed)?.forget();
        } else if self.items.is_closed() {
            return Err(QueueClosed);
        }
        self.lock().push_back(value);
        self.items.add_permits(1);
        Ok(())
    }

    /// Remove the oldest item, suspending until one is available.
    pub async fn pop(&self) -> Result<T, QueueClosed> {
        self.items.acquire().await.map_err(|_| QueueClosed)?.forget();
        let value = self.lock().pop_front().expect("item permit without item");
        if let Some(slots) = &self.slots {
            slots.add_permits(1);
        }
        Ok(value)
    }

    /// Close both gates. Parked producers and consumers wake with
    /// [`QueueClosed`]; items still queued are dropped.
    pub fn close(&self) {
        self.items.close();
        if let Some(slots) = &self.slots {
            slots.close();
        }
        self.lock().clear();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.items.is_closed()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        // The queue is only touched between semaphore operations; a poisoned
        // lock means a panic mid-push, which nothing can recover from.
        self.queue.lock().expect("queue mutex poisoned")
    }
}
