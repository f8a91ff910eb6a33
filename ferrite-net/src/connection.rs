//! The duplex connection: one byte stream, two independent pump loops.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use ferrite_crypto::ObfuscationCipher;

use crate::codec::{Codec, TransportKind};
use crate::errors::InvocationError;
use crate::obfuscated::Obfuscation;
use crate::queue::AsyncQueue;

/// Lifecycle of a [`Connection`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// No link; terminal until a new connection is made.
    Disconnected,
    /// The transport handshake is in progress.
    Connecting,
    /// Both pump loops are running.
    Connected,
}

/// A duplex link over a byte stream.
///
/// After the codec handshake, a send pump and a receive pump run as
/// independent tasks; the rest of the system only touches the two
/// backpressured queues between them. Either a transport failure or an
/// explicit [`disconnect`](Connection::disconnect) moves the state to
/// `Disconnected` and wakes everything parked on the queues.
pub struct Connection {
    send_queue: Arc<AsyncQueue<Vec<u8>>>,
    recv_queue: Arc<AsyncQueue<Vec<u8>>>,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Open a TCP stream to `addr` and start the pumps.
    pub async fn connect(addr: &str, kind: TransportKind) -> Result<Self, InvocationError> {
        tracing::info!("connecting to {addr}...");
        let stream = TcpStream::connect(addr).await?;
        Self::start(stream, kind).await
    }

    /// Start a connection over an already-established byte stream.
    ///
    /// Performs the codec handshake (init tag or obfuscation header), then
    /// spawns the send and receive pumps.
    pub async fn start<S>(mut stream: S, kind: TransportKind) -> Result<Self, InvocationError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state_tx);

        let codec = Codec::for_kind(&kind);
        let (enc, dec) = match &kind {
            TransportKind::Obfuscated { secret } => {
                let obfuscation = Obfuscation::new(codec.obfuscated_tag(), secret.as_ref());
                let (header, enc, dec) = obfuscation.into_parts();
                stream.write_all(&header).await?;
                (Some(enc), Some(dec))
            }
            _ => {
                if let Some(tag) = codec.tag() {
                    stream.write_all(&tag).await?;
                }
                (None, None)
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let send_queue = Arc::new(AsyncQueue::bounded());
        let recv_queue = Arc::new(AsyncQueue::relaxed());
        let shutdown = CancellationToken::new();

        state.send_replace(ConnectionState::Connected);
        tracing::debug!("transport handshake done, starting pump loops");

        tokio::spawn(send_pump(
            write_half,
            codec.clone(),
            enc,
            Arc::clone(&send_queue),
            Arc::clone(&recv_queue),
            Arc::clone(&state),
            shutdown.clone(),
        ));
        tokio::spawn(recv_pump(
            read_half,
            codec,
            dec,
            Arc::clone(&send_queue),
            Arc::clone(&recv_queue),
            Arc::clone(&state),
            shutdown.clone(),
        ));

        Ok(Self { send_queue, recv_queue, state, shutdown })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether both pumps are (still) running.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Queue one outbound packet.
    ///
    /// Suspends while the send pump is busy with the previous packet.
    /// Fails with `NotConnected` when the link is down.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), InvocationError> {
        if !self.is_connected() {
            return Err(InvocationError::NotConnected);
        }
        self.send_queue.push(data).await.map_err(|_| InvocationError::NotConnected)
    }

    /// Wait for the next inbound packet.
    ///
    /// Fails with `NotConnected` when the link drops while waiting.
    pub async fn recv(&self) -> Result<Vec<u8>, InvocationError> {
        self.recv_queue.pop().await.map_err(|_| InvocationError::NotConnected)
    }

    /// Tear the link down: stop both pumps and wake everything parked on
    /// the queues. Idempotent.
    pub fn disconnect(&self) {
        if self.state.send_replace(ConnectionState::Disconnected) != ConnectionState::Disconnected {
            tracing::info!("disconnecting");
        }
        self.shutdown.cancel();
        self.send_queue.close();
        self.recv_queue.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn teardown(
    state: &watch::Sender<ConnectionState>,
    send_queue: &AsyncQueue<Vec<u8>>,
    recv_queue: &AsyncQueue<Vec<u8>>,
    shutdown: &CancellationToken,
) {
    state.send_replace(ConnectionState::Disconnected);
    shutdown.cancel();
    send_queue.close();
    recv_queue.close();
}

async fn send_pump<S>(
    mut writer: WriteHalf<S>,
    mut codec: Codec,
    mut cipher: Option<ObfuscationCipher>,
    send_queue: Arc<AsyncQueue<Vec<u8>>>,
    recv_queue: Arc<AsyncQueue<Vec<u8>>>,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let data = tokio::select! {
            _ = shutdown.cancelled() => break,
            popped = send_queue.pop() => match popped {
                Ok(data) => data,
                Err(_) => break,
            },
        };

        if let Err(e) = codec.write_packet(&mut writer, &mut cipher, &data).await {
            tracing::info!("connection closed while sending: {e}");
            break;
        }
    }
    teardown(&state, &send_queue, &recv_queue, &shutdown);
    tracing::debug!("send pump stopped");
}

async fn recv_pump<S>(
    mut reader: ReadHalf<S>,
    mut codec: Codec,
    mut cipher: Option<ObfuscationCipher>,
    send_queue: Arc<AsyncQueue<Vec<u8>>>,
    recv_queue: Arc<AsyncQueue<Vec<u8>>>,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let packet = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = codec.read_packet(&mut reader, &mut cipher) => match read {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::info!("connection closed while receiving: {e}");
                    break;
                }
            },
        };

        if recv_queue.push(packet).await.is_err() {
            break;
        }
    }
    teardown(&state, &send_queue, &recv_queue, &shutdown);
    tracing::debug!("receive pump stopped");
}
