//! Client side of the transport.
//!
//! A [`NetworkClient`] is created immediately in `Connecting` state while a
//! background task dials, handshakes and then pumps the send queue. Messages
//! sent before the handshake completes are buffered and flushed in order on
//! accept; on failure they fail with a closed-channel error.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::debug;

use crate::codec::{Codec, CodecFactory, decode_from_bytes, encode_to_bytes};
use crate::metrics::MetricsRegistry;
use crate::network::NetworkError;
use crate::network::connection::{
    ConnEvent, ConnectionHandle, DisconnectReason, HeartbeatSettings, spawn_connection,
};
use crate::network::protocol::{TransportFrame, try_split_frame};

const SEND_QUEUE: usize = 1_024;

/// Why a client ended up disconnected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFailure {
    /// Dial did not complete within the connect timeout.
    ConnectTimeout,
    /// Server replied with a handshake rejection.
    Rejected(String),
    /// Connection failed or was closed after being established.
    Disconnect(DisconnectReason),
}

impl ClientFailure {
    /// Converts into the public error type.
    #[must_use]
    pub fn into_error(self, connect_timeout: Duration) -> NetworkError {
        match self {
            Self::ConnectTimeout => NetworkError::ConnectTimeout(connect_timeout),
            Self::Rejected(reason) => NetworkError::HandshakeRejected { reason },
            Self::Disconnect(DisconnectReason::ReadTimeout) => NetworkError::ReadTimeout,
            Self::Disconnect(_) => NetworkError::ClosedChannel,
        }
    }
}

/// Observable client states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Dial + handshake in progress; sends are buffered.
    Connecting,
    /// Handshake accepted; sends flow to the socket.
    Connected,
    /// Terminal state.
    Disconnected(ClientFailure),
}

/// Receive-side callbacks for a client connection.
#[async_trait]
pub trait ClientHandler<T>: Send + Sync {
    /// Called for every decoded inbound message, in arrival order.
    async fn on_message(&self, msg: T);

    /// Called once when the connection ends.
    async fn on_disconnect(&self, reason: DisconnectReason) {
        let _ = reason;
    }
}

struct QueuedSend {
    payload: Bytes,
    ack: Option<oneshot::Sender<Result<(), NetworkError>>>,
}

/// Outbound connection to a remote transport connector.
pub struct NetworkClient<T> {
    remote: SocketAddr,
    connect_timeout: Duration,
    codec: Arc<dyn Codec<T>>,
    queue: mpsc::Sender<QueuedSend>,
    state_rx: watch::Receiver<ClientState>,
    live: Arc<Mutex<Option<ConnectionHandle>>>,
    pending_pause: Arc<AtomicBool>,
}

impl<T> NetworkClient<T> {
    /// Peer address this client dials.
    #[must_use]
    pub const fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state_rx.borrow().clone()
    }

    /// Waits until the handshake finished; `Ok` once `Connected`.
    pub async fn ready(&self) -> Result<(), NetworkError> {
        let mut state_rx = self.state_rx.clone();
        loop {
            match &*state_rx.borrow_and_update() {
                ClientState::Connected => return Ok(()),
                ClientState::Disconnected(failure) => {
                    return Err(failure.clone().into_error(self.connect_timeout));
                }
                ClientState::Connecting => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(NetworkError::ClosedChannel);
            }
        }
    }

    /// Encodes and enqueues a message; resolves once written to the socket
    /// (buffered first when the handshake is still in flight).
    pub async fn send(&self, msg: &T) -> Result<(), NetworkError> {
        let payload = encode_to_bytes(self.codec.as_ref(), msg)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.queue
            .send(QueuedSend {
                payload,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| NetworkError::ClosedChannel)?;
        ack_rx.await.map_err(|_| NetworkError::ClosedChannel)?
    }

    /// Fire-and-forget variant of [`send`](Self::send); resolves once
    /// enqueued.
    pub async fn send_no_ack(&self, msg: &T) -> Result<(), NetworkError> {
        let payload = encode_to_bytes(self.codec.as_ref(), msg)?;
        self.queue
            .send(QueuedSend { payload, ack: None })
            .await
            .map_err(|_| NetworkError::ClosedChannel)
    }

    /// Suspends inbound reads (applies as soon as the connection is live).
    pub fn pause_receiving(&self) {
        self.pending_pause.store(true, Ordering::Release);
        if let Some(handle) = self.live.lock().as_ref() {
            handle.pause_receiving();
        }
    }

    /// Resumes inbound reads.
    pub fn resume_receiving(&self) {
        self.pending_pause.store(false, Ordering::Release);
        if let Some(handle) = self.live.lock().as_ref() {
            handle.resume_receiving();
        }
    }

    /// Closes the connection; buffered sends fail with a closed-channel
    /// error.
    pub fn disconnect(&self) {
        if let Some(handle) = self.live.lock().as_ref() {
            handle.close();
        }
    }

    /// Whether the client reached a terminal state.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        matches!(&*self.state_rx.borrow(), ClientState::Disconnected(_))
    }
}

/// Dial parameters forwarded from the service configuration.
#[derive(Debug, Clone)]
pub(crate) struct ConnectSettings {
    pub connect_timeout: Duration,
    pub tcp_no_delay: bool,
}

/// Creates a client and spawns its connect/handshake/pump task.
pub(crate) fn launch_client<T: Send + 'static>(
    remote: SocketAddr,
    protocol: String,
    login: Bytes,
    codec_factory: &Arc<dyn CodecFactory<T>>,
    handler: Arc<dyn ClientHandler<T>>,
    settings: ConnectSettings,
    metrics: Arc<MetricsRegistry>,
) -> NetworkClient<T> {
    let codec = codec_factory.create();
    let (queue_tx, queue_rx) = mpsc::channel(SEND_QUEUE);
    let (state_tx, state_rx) = watch::channel(ClientState::Connecting);
    let live = Arc::new(Mutex::new(None));
    let pending_pause = Arc::new(AtomicBool::new(false));

    let client = NetworkClient {
        remote,
        connect_timeout: settings.connect_timeout,
        codec: Arc::clone(&codec),
        queue: queue_tx,
        state_rx,
        live: Arc::clone(&live),
        pending_pause: Arc::clone(&pending_pause),
    };

    tokio::spawn(run_client(
        remote,
        protocol,
        login,
        codec,
        handler,
        settings,
        metrics,
        queue_rx,
        state_tx,
        live,
        pending_pause,
    ));

    client
}

#[allow(clippy::too_many_arguments)]
async fn run_client<T: Send + 'static>(
    remote: SocketAddr,
    protocol: String,
    login: Bytes,
    codec: Arc<dyn Codec<T>>,
    handler: Arc<dyn ClientHandler<T>>,
    settings: ConnectSettings,
    metrics: Arc<MetricsRegistry>,
    mut queue_rx: mpsc::Receiver<QueuedSend>,
    state_tx: watch::Sender<ClientState>,
    live: Arc<Mutex<Option<ConnectionHandle>>>,
    pending_pause: Arc<AtomicBool>,
) {
    let established = timeout(
        settings.connect_timeout,
        dial_and_handshake(remote, &protocol, login, &settings),
    )
    .await;

    let (stream, leftover, heartbeats) = match established {
        Ok(Ok(parts)) => parts,
        Ok(Err(failure)) => {
            fail_client(&state_tx, &mut queue_rx, failure).await;
            return;
        }
        Err(_) => {
            fail_client(&state_tx, &mut queue_rx, ClientFailure::ConnectTimeout).await;
            return;
        }
    };

    let (handle, mut events) = spawn_connection(stream, leftover, heartbeats, metrics);
    if pending_pause.load(Ordering::Acquire) {
        handle.pause_receiving();
    }
    *live.lock() = Some(handle.clone());
    let _ = state_tx.send(ClientState::Connected);
    debug!(%remote, protocol, "client connected");

    // Pump buffered and future sends into the connection, deliver inbound
    // messages to the handler, and watch for disconnect.
    let mut queue_closed = false;
    loop {
        tokio::select! {
            queued = queue_rx.recv(), if !queue_closed => match queued {
                Some(QueuedSend { payload, ack }) => {
                    let result = handle.send_flushed(payload).await;
                    let failed = result.is_err();
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    } else if failed {
                        debug!(%remote, "buffered send failed after disconnect");
                    }
                }
                None => {
                    queue_closed = true;
                    handle.close();
                }
            },
            event = events.recv() => match event {
                Some(ConnEvent::Message(payload)) => {
                    match decode_from_bytes(codec.as_ref(), payload) {
                        Ok(msg) => handler.on_message(msg).await,
                        Err(err) => {
                            debug!(%remote, "inbound decode failed: {err}");
                            handle.close();
                        }
                    }
                }
                Some(ConnEvent::Disconnected(reason)) => {
                    let failure = ClientFailure::Disconnect(reason.clone());
                    fail_client(&state_tx, &mut queue_rx, failure).await;
                    handler.on_disconnect(reason).await;
                    return;
                }
                None => {
                    let failure = ClientFailure::Disconnect(DisconnectReason::LocalClose);
                    fail_client(&state_tx, &mut queue_rx, failure).await;
                    return;
                }
            }
        }
    }
}

async fn fail_client(
    state_tx: &watch::Sender<ClientState>,
    queue_rx: &mut mpsc::Receiver<QueuedSend>,
    failure: ClientFailure,
) {
    let _ = state_tx.send(ClientState::Disconnected(failure));
    queue_rx.close();
    while let Ok(QueuedSend { ack, .. }) = queue_rx.try_recv() {
        if let Some(ack) = ack {
            let _ = ack.send(Err(NetworkError::ClosedChannel));
        }
    }
}

async fn dial_and_handshake(
    remote: SocketAddr,
    protocol: &str,
    login: Bytes,
    settings: &ConnectSettings,
) -> Result<(TcpStream, BytesMut, HeartbeatSettings), ClientFailure> {
    let mut stream = TcpStream::connect(remote)
        .await
        .map_err(|err| ClientFailure::Disconnect(DisconnectReason::Io(err.to_string())))?;
    let _ = stream.set_nodelay(settings.tcp_no_delay);

    let request = TransportFrame::HandshakeRequest {
        protocol: protocol.to_string(),
        login,
    };
    stream
        .write_all(&request.encode())
        .await
        .map_err(|err| ClientFailure::Disconnect(DisconnectReason::Io(err.to_string())))?;

    let mut buf = BytesMut::with_capacity(4 * 1024);
    let reply = loop {
        if let Some(body) = try_split_frame(&mut buf)
            .map_err(|err| ClientFailure::Disconnect(DisconnectReason::Codec(err.to_string())))?
        {
            break TransportFrame::decode(body).map_err(|err| {
                ClientFailure::Disconnect(DisconnectReason::Codec(err.to_string()))
            })?;
        }
        let read = stream
            .read_buf(&mut buf)
            .await
            .map_err(|err| ClientFailure::Disconnect(DisconnectReason::Io(err.to_string())))?;
        if read == 0 {
            return Err(ClientFailure::Disconnect(DisconnectReason::PeerClosed));
        }
    };

    match reply {
        TransportFrame::HandshakeAccept {
            hb_interval_ms,
            hb_loss_threshold,
            hb_disabled,
        } => Ok((
            stream,
            buf,
            HeartbeatSettings {
                interval: Duration::from_millis(u64::from(hb_interval_ms.max(1))),
                loss_threshold: hb_loss_threshold,
                disabled: hb_disabled,
            },
        )),
        TransportFrame::HandshakeReject { reason } => Err(ClientFailure::Rejected(reason)),
        other => {
            debug!(?other, "unexpected handshake reply");
            Err(ClientFailure::Disconnect(DisconnectReason::Codec(
                "unexpected handshake reply".to_string(),
            )))
        }
    }
}
