//! The outbound packer: batches queued requests into containers.

use std::collections::VecDeque;

use ferrite_mtproto::Session;
use ferrite_wire::envelope::{Message, MessageContainer};
use tokio::sync::{Mutex, Notify};

use crate::errors::InvocationError;
use crate::request::PendingRequest;

/// Converts an unbounded queue of pending requests into size- and
/// count-bounded containers, preserving ordering dependencies.
///
/// Producers call [`append`](Self::append); the single consumer (the send
/// loop) alternates [`wait`](Self::wait) and [`get`](Self::get). Ids are
/// assigned lazily, at flush time, so queued requests re-ordered or re-sent
/// always carry fresh identifiers.
pub struct MessagePacker {
    queue: Mutex<VecDeque<PendingRequest>>,
    ready: Notify,
}

impl MessagePacker {
    /// Create an empty packer.
    pub fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), ready: Notify::new() }
    }

    /// Enqueue a request at the tail.
    ///
    /// An ordered request is linked to the most recently queued ordered
    /// request, so the server serializes their side effects.
    pub async fn append(&self, request: PendingRequest) {
        self.insert(request, false).await;
    }

    /// Enqueue a request at the head (used when re-sending).
    ///
    /// An ordered request inserted at the head becomes the dependency of
    /// the earliest ordered request already queued.
    pub async fn append_at_start(&self, request: PendingRequest) {
        self.insert(request, true).await;
    }

    /// Enqueue several requests at the tail, preserving their order.
    pub async fn extend(&self, requests: Vec<PendingRequest>) {
        for request in requests {
            self.insert(request, false).await;
        }
    }

    /// Enqueue several requests at the head, preserving their order.
    pub async fn prepend(&self, requests: Vec<PendingRequest>) {
        for request in requests.into_iter().rev() {
            self.insert(request, true).await;
        }
    }

    async fn insert(&self, mut request: PendingRequest, at_start: bool) {
        let mut queue = self.queue.lock().await;

        if request.kind.ordered() {
            if at_start {
                // The queue's earliest ordered request now depends on us.
                for existing in queue.iter_mut() {
                    if existing.kind.ordered() {
                        existing.after = Some(request.id_cell.clone());
                        break;
                    }
                }
            } else {
                for existing in queue.iter().rev() {
                    if existing.kind.ordered() {
                        request.after = Some(existing.id_cell.clone());
                        break;
                    }
                }
            }
        }

        if at_start {
            queue.push_front(request);
        } else {
            queue.push_back(request);
        }
        drop(queue);

        self.ready.notify_one();
    }

    /// Suspend until at least one request is queued.
    pub async fn wait(&self) {
        loop {
            let notified = self.ready.notified();
            if !self.queue.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Whether the queue is currently empty.
    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Drain the queue into one batch.
    ///
    /// Encodes requests until the next one would push the batch past the
    /// container size ceiling or the count ceiling. A request too large to
    /// ever fit fails with `PayloadTooBig` instead of blocking the queue;
    /// a request whose abort signal fired is skipped with `Aborted`.
    ///
    /// With more than one message the batch is wrapped in a container that
    /// receives its own message id, recorded on every member for later
    /// correlation. Returns `None` when nothing could be batched.
    pub async fn get(
        &self,
        session: &mut Session,
    ) -> Option<(Vec<PendingRequest>, Vec<u8>)> {
        let mut queue = self.queue.lock().await;

        let mut writer = Vec::new();
        let mut batch: Vec<PendingRequest> = Vec::new();
        let mut size = 0usize;

        loop {
            if batch.len() == MessageContainer::MAXIMUM_LENGTH {
                break;
            }
            let Some(mut request) = queue.pop_front() else { break };

            if request.aborted() {
                request.reject(InvocationError::Aborted);
                continue;
            }

            let projected = size + request.body.len() + Message::SIZE_OVERHEAD;
            if projected <= MessageContainer::MAXIMUM_SIZE {
                size = projected;
                let after = request.after_id();
                let msg_id = session.write_as_message(
                    &mut writer,
                    &request.body,
                    request.kind.content_related(),
                    after,
                );
                request.id_cell.set(msg_id);
                tracing::debug!("assigned msg_id {msg_id} to a {} byte request", request.body.len());
                batch.push(request);
                continue;
            }

            if !batch.is_empty() {
                // Doesn't fit alongside the current batch; leave it for the
                // next flush.
                queue.push_front(request);
                break;
            }

            tracing::warn!(
                "request payload of {} bytes exceeds the container ceiling and cannot be sent",
                request.body.len()
            );
            request.reject(InvocationError::PayloadTooBig);
        }

        if batch.is_empty() {
            return None;
        }

        if batch.len() > 1 {
            let container = MessageContainer::wrap(batch.len(), &writer);
            let mut outer = Vec::new();
            let container_id = session.write_as_message(&mut outer, &container, false, None);
            for request in &mut batch {
                request.container_id = Some(container_id);
            }
            writer = outer;
        }

        Some((batch, writer))
    }

    /// Fail everything still queued with `Disconnected` and empty the queue.
    pub async fn clear(&self) {
        let mut queue = self.queue.lock().await;
        for mut request in queue.drain(..) {
            request.reject(InvocationError::Disconnected);
        }
        drop(queue);
        self.ready.notify_one();
    }
}

impl Default for MessagePacker {
    fn default() -> Self {
        Self::new()
    }
}
