//! The sender: request issuance, batching, transmission, and response
//! correlation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use ferrite_mtproto::Session;
use ferrite_wire::envelope::{Envelope, Message, MsgsAck, RpcResult};
use ferrite_wire::MsgId;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::errors::InvocationError;
use crate::packer::MessagePacker;
use crate::request::{PendingRequest, RequestKind, ResponseReceiver};

/// How many recently sent acknowledgements are kept around; the server may
/// ask for them again after a salt correction.
const LAST_ACK_RING: usize = 10;

/// Out-of-band notifications from the receive path.
#[derive(Debug)]
pub enum SenderEvent {
    /// An unsolicited server-initiated message.
    Update(Message),
    /// The clock offset changed after a server confirmation.
    TimeOffset(i32),
    /// An inbound frame failed a security check and was discarded.
    Security(ferrite_mtproto::DecryptError),
    /// The connection dropped; every in-flight request has been failed.
    Disconnected,
}

/// Drives one encrypted connection: packs outbound requests, encrypts and
/// transmits them, and matches inbound frames back to their callers.
///
/// Cheap to clone; all clones share the same pipeline. There is no
/// automatic reconnect: when the link breaks every pending request fails
/// with `Disconnected` and the caller decides what happens next.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

struct SenderInner {
    session: Mutex<Session>,
    packer: MessagePacker,
    connection: Connection,
    /// Sent, unanswered requests keyed by assigned message id.
    pending: Mutex<HashMap<i64, PendingRequest>>,
    /// Inbound ids awaiting acknowledgement on the next send pass.
    pending_acks: Mutex<Vec<MsgId>>,
    /// Ring of the last sent acknowledgement requests.
    last_acks: Mutex<VecDeque<PendingRequest>>,
    events: mpsc::UnboundedSender<SenderEvent>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Sender {
    /// Start the send and receive loops over an established connection.
    ///
    /// Returns the sender plus the event stream for updates and
    /// connection-level notifications.
    pub fn start(
        session: Session,
        connection: Connection,
    ) -> (Self, mpsc::UnboundedReceiver<SenderEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SenderInner {
            session: Mutex::new(session),
            packer: MessagePacker::new(),
            connection,
            pending: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(Vec::new()),
            last_acks: Mutex::new(VecDeque::with_capacity(LAST_ACK_RING)),
            events,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(send_loop(Arc::clone(&inner)));
        tokio::spawn(recv_loop(Arc::clone(&inner)));

        (Self { inner }, events_rx)
    }

    /// Enqueue a request body and wait for its correlated response.
    pub async fn invoke(&self, body: Vec<u8>, kind: RequestKind) -> Result<Vec<u8>, InvocationError> {
        let rx = self.enqueue(body, kind, None).await?;
        rx.await.map_err(|_| InvocationError::Dropped)?
    }

    /// Like [`invoke`](Self::invoke), aborting transmission if `abort`
    /// fires while the request is still queued. A request already on the
    /// wire cannot be recalled; only a disconnect fails it.
    pub async fn invoke_abortable(
        &self,
        body: Vec<u8>,
        kind: RequestKind,
        abort: CancellationToken,
    ) -> Result<Vec<u8>, InvocationError> {
        let rx = self.enqueue(body, kind, Some(abort)).await?;
        rx.await.map_err(|_| InvocationError::Dropped)?
    }

    /// Enqueue a request and return the completion slot without waiting
    /// for the response.
    pub async fn enqueue(
        &self,
        body: Vec<u8>,
        kind: RequestKind,
        abort: Option<CancellationToken>,
    ) -> Result<ResponseReceiver, InvocationError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(InvocationError::NotConnected);
        }
        let (request, rx) = match abort {
            Some(token) => PendingRequest::with_abort(body, kind, token),
            None => PendingRequest::new(body, kind),
        };
        self.inner.packer.append(request).await;
        Ok(rx)
    }

    /// Whether the underlying connection is still up.
    pub fn is_connected(&self) -> bool {
        self.connection().is_connected()
    }

    /// Tear everything down: stop the loops, close the connection, and
    /// fail queued and in-flight requests with `Disconnected`.
    pub async fn disconnect(&self) {
        self.inner.shut_down().await;
    }

    fn connection(&self) -> &Connection {
        &self.inner.connection
    }
}

impl SenderInner {
    /// One-shot teardown; safe to call from any path that notices the
    /// connection going away.
    async fn shut_down(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.connection.disconnect();
        self.packer.clear().await;

        let mut pending = self.pending.lock().await;
        for (_, request) in pending.iter_mut() {
            request.reject(InvocationError::Disconnected);
        }
        pending.clear();
        drop(pending);

        let _ = self.events.send(SenderEvent::Disconnected);
    }

    /// Turn accumulated inbound ids into one `msgs_ack` service request.
    async fn queue_acks(&self) {
        let msg_ids = {
            let mut acks = self.pending_acks.lock().await;
            if acks.is_empty() {
                return;
            }
            std::mem::take(&mut *acks)
        };
        let ack = PendingRequest::service(MsgsAck { msg_ids }.to_bytes());
        self.packer.append(ack).await;
    }

    /// Remember a freshly transmitted request until its response arrives.
    async fn track(&self, request: PendingRequest) {
        if request.tracked() {
            if let Some(msg_id) = request.msg_id() {
                self.pending.lock().await.insert(msg_id.0, request);
            }
        } else if request.kind == RequestKind::Service {
            let mut ring = self.last_acks.lock().await;
            if ring.len() == LAST_ACK_RING {
                ring.pop_front();
            }
            ring.push_back(request);
        }
    }

    /// Pop the requests a service notification refers to: a direct match
    /// by id, else every member of the named container, else a
    /// remembered acknowledgement.
    async fn pop_states(&self, msg_id: MsgId) -> Vec<PendingRequest> {
        let mut pending = self.pending.lock().await;
        if let Some(mut request) = pending.remove(&msg_id.0) {
            request.container_id = None;
            return vec![request];
        }

        let members: Vec<i64> = pending
            .iter()
            .filter(|(_, r)| r.container_id == Some(msg_id))
            .map(|(id, _)| *id)
            .collect();
        if !members.is_empty() {
            return members
                .into_iter()
                .filter_map(|id| pending.remove(&id))
                .map(|mut r| {
                    r.container_id = None;
                    r
                })
                .collect();
        }
        drop(pending);

        let mut ring = self.last_acks.lock().await;
        if let Some(pos) = ring.iter().position(|r| r.msg_id() == Some(msg_id)) {
            return ring.remove(pos).into_iter().collect();
        }
        Vec::new()
    }

    /// Decode one decrypted message and dispatch whatever it contains.
    ///
    /// Containers and gzip wrappers feed back into the worklist instead of
    /// recursing.
    async fn process_message(&self, message: Message) -> Result<(), InvocationError> {
        let mut work = VecDeque::from([message]);

        while let Some(msg) = work.pop_front() {
            let envelope = Envelope::decode(&msg.body)?;

            // Everything except an inbound ack is itself acknowledged.
            if !matches!(envelope, Envelope::MsgsAck(_)) {
                self.pending_acks.lock().await.push(msg.msg_id);
            }

            match envelope {
                Envelope::Container(messages) => {
                    tracing::debug!("handling container with {} message(s)", messages.len());
                    work.extend(messages);
                }
                Envelope::Gzip(inflated) => {
                    work.push_back(Message {
                        msg_id: msg.msg_id,
                        seq_no: msg.seq_no,
                        body: inflated,
                    });
                }
                Envelope::RpcResult(result) => self.handle_rpc_result(result).await,
                Envelope::Pong { msg_id, .. } => {
                    // A pong confirms our id generator against the server
                    // clock as a side effect.
                    let offset = self.session.lock().await.update_time_offset(msg.msg_id);
                    let _ = self.events.send(SenderEvent::TimeOffset(offset));
                    if let Some(mut request) = self.pending.lock().await.remove(&msg_id.0) {
                        request.resolve(msg.body.clone());
                    }
                }
                Envelope::BadServerSalt { bad_msg_id, new_salt, .. } => {
                    tracing::debug!("bad salt for {bad_msg_id}, adopting the new one");
                    self.session.lock().await.salt = new_salt;
                    let states = self.pop_states(bad_msg_id).await;
                    tracing::debug!("{} message(s) will be resent", states.len());
                    self.packer.extend(states).await;
                }
                Envelope::BadMsgNotification { bad_msg_id, error_code, .. } => {
                    self.handle_bad_msg(msg.msg_id, bad_msg_id, error_code).await;
                }
                Envelope::NewSessionCreated { server_salt, .. } => {
                    tracing::debug!("server created a new session");
                    self.session.lock().await.salt = server_salt;
                }
                Envelope::MsgsAck(_) => {}
                Envelope::Raw(body) => {
                    self.dispatch_update(&msg, body).await;
                }
            }
        }

        Ok(())
    }

    async fn handle_rpc_result(&self, result: RpcResult) {
        tracing::debug!("handling RPC result for {}", result.req_msg_id);
        match self.pending.lock().await.remove(&result.req_msg_id.0) {
            Some(mut request) => match result.result {
                Ok(body) => request.resolve(body),
                Err(rpc) => request.reject(InvocationError::Rpc(rpc)),
            },
            None => {
                tracing::info!("response for unknown request {}", result.req_msg_id);
            }
        }
    }

    async fn handle_bad_msg(&self, envelope_id: MsgId, bad_msg_id: MsgId, error_code: i32) {
        let states = self.pop_states(bad_msg_id).await;
        match error_code {
            16 | 17 => {
                // Our id was stamped too far from the server clock; re-sync
                // from the envelope's own id and re-send.
                let offset = self.session.lock().await.update_time_offset(envelope_id);
                let _ = self.events.send(SenderEvent::TimeOffset(offset));
                tracing::info!("clock skew corrected to {offset}s, resending {} message(s)", states.len());
                self.packer.extend(states).await;
            }
            32 => {
                self.session.lock().await.adjust_sequence(64);
                self.packer.extend(states).await;
            }
            33 => {
                self.session.lock().await.adjust_sequence(-16);
                self.packer.extend(states).await;
            }
            code => {
                tracing::warn!("bad_msg_notification {code} for {bad_msg_id}");
                for mut state in states {
                    state.reject(InvocationError::BadMessage { code });
                }
            }
        }
    }

    async fn dispatch_update(&self, msg: &Message, body: Vec<u8>) {
        if let Some(local) = self.session.lock().await.msg_id_time_local(msg.msg_id) {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
            if local - now > 30 || now - local > 300 {
                tracing::debug!("update stamped {}s away from the local clock", local - now);
            }
        }
        let _ = self.events.send(SenderEvent::Update(Message {
            msg_id: msg.msg_id,
            seq_no: msg.seq_no,
            body,
        }));
    }
}

/// Pops batches off the packer, encrypts them, and hands them to the
/// connection. Besides the handshake, nothing else ever transmits.
async fn send_loop(inner: Arc<SenderInner>) {
    loop {
        inner.queue_acks().await;

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.packer.wait() => {}
        }

        // Acks that arrived while parked ride along with this batch.
        inner.queue_acks().await;

        let flushed = {
            let mut session = inner.session.lock().await;
            inner.packer.get(&mut session).await
        };
        let Some((batch, payload)) = flushed else { continue };

        tracing::debug!("encrypting {} message(s) in {} bytes", batch.len(), payload.len());
        let wire = inner.session.lock().await.encrypt_frame(&payload);

        // Register before transmitting so a fast response finds its slot.
        for request in batch {
            inner.track(request).await;
        }

        if let Err(e) = inner.connection.send(wire).await {
            tracing::info!("connection closed while sending: {e}");
            inner.shut_down().await;
            break;
        }
    }
    tracing::debug!("send loop stopped");
}

/// Reads packets off the connection, decrypts them, and dispatches.
/// Security failures discard the offending frame and keep receiving;
/// transport failures end the connection.
async fn recv_loop(inner: Arc<SenderInner>) {
    loop {
        let mut frame = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            received = inner.connection.recv() => match received {
                Ok(frame) => frame,
                Err(_) => {
                    inner.shut_down().await;
                    break;
                }
            },
        };

        let decrypted = inner.session.lock().await.decrypt_frame(&mut frame);
        match decrypted {
            Ok(message) => {
                if let Err(e) = inner.process_message(message).await {
                    tracing::warn!("dropping undecodable frame: {e}");
                }
            }
            Err(e) => {
                tracing::warn!("security error while unpacking a received message: {e}");
                let _ = inner.events.send(SenderEvent::Security(e));
            }
        }
    }
    tracing::debug!("receive loop stopped");
}
