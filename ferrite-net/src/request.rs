//! Pending requests and their completion slots.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use ferrite_wire::MsgId;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::errors::InvocationError;

/// Classifies an outbound request for sequencing and tracking purposes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestKind {
    /// A content-related call expecting a correlated response.
    Content,
    /// Like [`RequestKind::Content`], but its server-side effects must apply
    /// in submission order relative to other ordered requests.
    ContentOrdered,
    /// A service message (acknowledgements and the like): even sequence
    /// slot, no tracked response.
    Service,
}

impl RequestKind {
    /// Whether messages of this kind advance the content sequence counter.
    pub fn content_related(self) -> bool {
        !matches!(self, Self::Service)
    }

    pub(crate) fn ordered(self) -> bool {
        matches!(self, Self::ContentOrdered)
    }
}

/// The receiving end of a request's completion slot.
pub type ResponseReceiver = oneshot::Receiver<Result<Vec<u8>, InvocationError>>;

type ResponseSlot = oneshot::Sender<Result<Vec<u8>, InvocationError>>;

/// Shared cell holding the message id assigned at flush time.
///
/// Requests linked through an ordering dependency hold the predecessor's
/// cell and read it when they are themselves encoded, which may happen in
/// the same flush or a later one. Re-sends overwrite the id.
#[derive(Debug, Default)]
pub(crate) struct IdCell(AtomicI64);

impl IdCell {
    pub(crate) fn set(&self, id: MsgId) {
        self.0.store(id.0, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> Option<MsgId> {
        match self.0.load(Ordering::Relaxed) {
            0 => None,
            id => Some(MsgId(id)),
        }
    }
}

/// An application request waiting to be packed, transmitted, and answered.
///
/// Completion is communicated through a one-shot channel: exactly one of
/// resolve/reject fires, and dropping the request unanswered surfaces as a
/// `Dropped` error on the receiver.
pub struct PendingRequest {
    pub(crate) body: Vec<u8>,
    pub(crate) kind: RequestKind,
    slot: Option<ResponseSlot>,
    abort: Option<CancellationToken>,
    pub(crate) id_cell: Arc<IdCell>,
    pub(crate) after: Option<Arc<IdCell>>,
    /// When batched, the id of the container that carried this request.
    pub(crate) container_id: Option<MsgId>,
}

impl PendingRequest {
    /// Create a request and the receiver its response will arrive on.
    pub fn new(body: Vec<u8>, kind: RequestKind) -> (Self, ResponseReceiver) {
        Self::build(body, kind, None)
    }

    /// Like [`PendingRequest::new`] with an abort handle: cancelling the
    /// token while the request is still queued skips transmission.
    pub fn with_abort(
        body: Vec<u8>,
        kind: RequestKind,
        abort: CancellationToken,
    ) -> (Self, ResponseReceiver) {
        Self::build(body, kind, Some(abort))
    }

    /// A fire-and-forget service message with no completion slot.
    pub fn service(body: Vec<u8>) -> Self {
        Self {
            body,
            kind: RequestKind::Service,
            slot: None,
            abort: None,
            id_cell: Arc::new(IdCell::default()),
            after: None,
            container_id: None,
        }
    }

    fn build(
        body: Vec<u8>,
        kind: RequestKind,
        abort: Option<CancellationToken>,
    ) -> (Self, ResponseReceiver) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            body,
            kind,
            slot: Some(tx),
            abort,
            id_cell: Arc::new(IdCell::default()),
            after: None,
            container_id: None,
        };
        (request, rx)
    }

    /// The message id assigned at the most recent flush, if any.
    pub fn msg_id(&self) -> Option<MsgId> {
        self.id_cell.get()
    }

    /// The id of the container that carried this request, when batched.
    pub fn container_id(&self) -> Option<MsgId> {
        self.container_id
    }

    pub(crate) fn aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(|t| t.is_cancelled())
    }

    pub(crate) fn after_id(&self) -> Option<MsgId> {
        self.after.as_ref().and_then(|cell| cell.get())
    }

    /// Whether this request should be remembered until a response arrives.
    pub(crate) fn tracked(&self) -> bool {
        self.kind.content_related() && self.slot.is_some()
    }

    pub(crate) fn resolve(&mut self, body: Vec<u8>) {
        if let Some(slot) = self.slot.take() {
            let _ = slot.send(Ok(body));
        }
    }

    pub(crate) fn reject(&mut self, err: InvocationError) {
        if let Some(slot) = self.slot.take() {
            let _ = slot.send(Err(err));
        }
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("kind", &self.kind)
            .field("len", &self.body.len())
            .field("msg_id", &self.msg_id())
            .field("container_id", &self.container_id)
            .finish_non_exhaustive()
    }
}
