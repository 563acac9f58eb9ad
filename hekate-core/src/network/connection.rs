//! Post-handshake connection engine shared by client and server sides.
//!
//! One writer task owns the socket's write half and pushes heartbeats on
//! write-idle; one reader task owns the read half, enforces the read-idle
//! watchdog and honors pause/resume. Inbound payloads are delivered through
//! an mpsc channel whose backpressure naturally throttles reading.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace};

use crate::metrics::{
    self, MetricsRegistry, NETWORK_BYTES_IN, NETWORK_BYTES_OUT, NETWORK_MESSAGES_IN,
    NETWORK_MESSAGES_OUT,
};
use crate::network::NetworkError;
use crate::network::protocol::{TransportFrame, try_split_frame};

const OUTBOUND_QUEUE: usize = 1_024;
const EVENT_QUEUE: usize = 1_024;
const READ_CHUNK: usize = 16 * 1024;

/// Heartbeat parameters negotiated during the handshake.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeartbeatSettings {
    /// Write-idle interval after which a heartbeat is pushed.
    pub interval: Duration,
    /// Missed intervals tolerated before the read watchdog fires.
    pub loss_threshold: u32,
    /// Suppresses heartbeat emission (read watchdog stays active).
    pub disabled: bool,
}

impl HeartbeatSettings {
    pub(crate) fn read_timeout(&self) -> Duration {
        self.interval * self.loss_threshold.max(1)
    }
}

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed by the local side.
    LocalClose,
    /// Peer closed the socket.
    PeerClosed,
    /// Read-idle watchdog fired.
    ReadTimeout,
    /// Socket I/O failure.
    Io(String),
    /// Frame or payload could not be decoded.
    Codec(String),
}

/// Events emitted by the connection engine, in arrival order.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// One connector payload.
    Message(Bytes),
    /// Terminal event; nothing follows.
    Disconnected(DisconnectReason),
}

struct Outbound {
    payload: Bytes,
    ack: Option<oneshot::Sender<Result<(), NetworkError>>>,
}

/// Cheap handle for writing to and controlling a live connection.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    out_tx: mpsc::Sender<Outbound>,
    pause_tx: watch::Sender<bool>,
    close_tx: watch::Sender<bool>,
    reason: Arc<Mutex<Option<DisconnectReason>>>,
}

impl ConnectionHandle {
    /// Enqueues a payload; resolves once accepted by the writer queue.
    pub(crate) async fn send(&self, payload: Bytes) -> Result<(), NetworkError> {
        self.out_tx
            .send(Outbound { payload, ack: None })
            .await
            .map_err(|_| NetworkError::ClosedChannel)
    }

    /// Enqueues a payload and resolves once it has been written to the
    /// socket (or failed).
    pub(crate) async fn send_flushed(&self, payload: Bytes) -> Result<(), NetworkError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.out_tx
            .send(Outbound {
                payload,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| NetworkError::ClosedChannel)?;
        ack_rx.await.map_err(|_| NetworkError::ClosedChannel)?
    }

    /// Suspends socket reads and the read-idle watchdog.
    pub(crate) fn pause_receiving(&self) {
        let _ = self.pause_tx.send(true);
    }

    /// Resumes socket reads; the first read timeout after resume is ignored
    /// so an in-flight heartbeat is not misread as a failure.
    pub(crate) fn resume_receiving(&self) {
        let _ = self.pause_tx.send(false);
    }

    /// Whether reads are currently paused.
    pub(crate) fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Initiates a local close.
    pub(crate) fn close(&self) {
        self.set_reason(DisconnectReason::LocalClose);
        let _ = self.close_tx.send(true);
    }

    /// Whether the connection has been closed (either side).
    pub(crate) fn is_closed(&self) -> bool {
        self.reason.lock().is_some()
    }

    fn set_reason(&self, reason: DisconnectReason) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    fn take_reason_or(&self, fallback: DisconnectReason) -> DisconnectReason {
        let mut slot = self.reason.lock();
        match &*slot {
            Some(reason) => reason.clone(),
            None => {
                *slot = Some(fallback.clone());
                fallback
            }
        }
    }
}

/// Spawns reader/writer tasks over an established (post-handshake) socket.
///
/// Returns the control handle and the inbound event stream. `initial_buf`
/// carries bytes that were read together with the handshake frame.
pub(crate) fn spawn_connection(
    stream: TcpStream,
    initial_buf: BytesMut,
    heartbeats: HeartbeatSettings,
    metrics: Arc<MetricsRegistry>,
) -> (ConnectionHandle, mpsc::Receiver<ConnEvent>) {
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
    let (pause_tx, pause_rx) = watch::channel(false);
    let (close_tx, close_rx) = watch::channel(false);

    let handle = ConnectionHandle {
        out_tx,
        pause_tx,
        close_tx,
        reason: Arc::new(Mutex::new(None)),
    };

    let (read_half, write_half) = stream.into_split();

    metrics.increment(metrics::NETWORK_CONNECTIONS_ACTIVE);

    tokio::spawn(write_loop(
        write_half,
        out_rx,
        close_rx.clone(),
        heartbeats,
        handle.clone(),
        Arc::clone(&metrics),
    ));
    tokio::spawn(read_loop(
        read_half,
        initial_buf,
        event_tx,
        pause_rx,
        close_rx,
        heartbeats,
        handle.clone(),
        metrics,
    ));

    (handle, event_rx)
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<Outbound>,
    mut close_rx: watch::Receiver<bool>,
    heartbeats: HeartbeatSettings,
    handle: ConnectionHandle,
    metrics: Arc<MetricsRegistry>,
) {
    let mut last_write = Instant::now();
    loop {
        // Biased toward queued data so heartbeats are only pushed when the
        // writer is truly idle, and never pipelined behind pending frames.
        tokio::select! {
            biased;
            _ = close_rx.changed() => break,
            cmd = out_rx.recv() => {
                let Some(Outbound { payload, ack }) = cmd else { break };
                let frame = TransportFrame::Data(payload).encode();
                let result = writer.write_all(&frame).await;
                last_write = Instant::now();
                match result {
                    Ok(()) => {
                        metrics.increment(NETWORK_MESSAGES_OUT);
                        metrics.add(NETWORK_BYTES_OUT, frame.len() as u64);
                        if let Some(ack) = ack {
                            let _ = ack.send(Ok(()));
                        }
                    }
                    Err(err) => {
                        metrics.increment(metrics::NETWORK_SEND_ERRORS);
                        handle.set_reason(DisconnectReason::Io(err.to_string()));
                        let _ = handle.close_tx.send(true);
                        if let Some(ack) = ack {
                            let _ = ack.send(Err(NetworkError::Io(err)));
                        }
                        break;
                    }
                }
            }
            _ = sleep_until(last_write + heartbeats.interval), if !heartbeats.disabled => {
                let frame = TransportFrame::Heartbeat.encode();
                last_write = Instant::now();
                if let Err(err) = writer.write_all(&frame).await {
                    handle.set_reason(DisconnectReason::Io(err.to_string()));
                    let _ = handle.close_tx.send(true);
                    break;
                }
                trace!("heartbeat sent");
            }
        }
    }

    // Fail anything still queued.
    out_rx.close();
    while let Ok(Outbound { ack, .. }) = out_rx.try_recv() {
        if let Some(ack) = ack {
            let _ = ack.send(Err(NetworkError::ClosedChannel));
        }
    }
    let _ = writer.shutdown().await;
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    mut reader: OwnedReadHalf,
    mut buf: BytesMut,
    event_tx: mpsc::Sender<ConnEvent>,
    mut pause_rx: watch::Receiver<bool>,
    mut close_rx: watch::Receiver<bool>,
    heartbeats: HeartbeatSettings,
    handle: ConnectionHandle,
    metrics: Arc<MetricsRegistry>,
) {
    let read_timeout = heartbeats.read_timeout();
    let mut deadline = Instant::now() + read_timeout;
    let mut skip_one_timeout = false;

    let reason = 'conn: loop {
        // Drain complete frames before touching the socket again.
        loop {
            let body = match try_split_frame(&mut buf) {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(err) => break 'conn DisconnectReason::Codec(err.to_string()),
            };
            deadline = Instant::now() + read_timeout;
            match TransportFrame::decode(body) {
                Ok(TransportFrame::Heartbeat) => trace!("heartbeat received"),
                Ok(TransportFrame::Data(payload)) => {
                    metrics.increment(NETWORK_MESSAGES_IN);
                    metrics.add(NETWORK_BYTES_IN, payload.len() as u64);
                    if event_tx.send(ConnEvent::Message(payload)).await.is_err() {
                        break 'conn DisconnectReason::LocalClose;
                    }
                }
                Ok(other) => {
                    debug!(?other, "unexpected transport frame after handshake");
                    break 'conn DisconnectReason::Codec(
                        "handshake frame after handshake".to_string(),
                    );
                }
                Err(err) => break 'conn DisconnectReason::Codec(err.to_string()),
            }
        }

        if *pause_rx.borrow() {
            // Suspended: no reads, no watchdog.
            tokio::select! {
                _ = close_rx.changed() => break 'conn DisconnectReason::LocalClose,
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        break 'conn DisconnectReason::LocalClose;
                    }
                    if !*pause_rx.borrow() {
                        skip_one_timeout = true;
                        deadline = Instant::now() + read_timeout;
                    }
                }
            }
            continue;
        }

        buf.reserve(READ_CHUNK);
        tokio::select! {
            biased;
            _ = close_rx.changed() => break 'conn DisconnectReason::LocalClose,
            changed = pause_rx.changed() => {
                if changed.is_err() {
                    break 'conn DisconnectReason::LocalClose;
                }
            }
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break 'conn DisconnectReason::PeerClosed,
                Ok(_) => {}
                Err(err) => break 'conn DisconnectReason::Io(err.to_string()),
            },
            _ = sleep_until(deadline) => {
                if skip_one_timeout {
                    skip_one_timeout = false;
                    deadline = Instant::now() + read_timeout;
                } else {
                    break 'conn DisconnectReason::ReadTimeout;
                }
            }
        }
    };

    metrics.sub(metrics::NETWORK_CONNECTIONS_ACTIVE, 1);
    let reason = handle.take_reason_or(reason);
    let _ = handle.close_tx.send(true);
    let _ = event_tx.send(ConnEvent::Disconnected(reason)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn settings() -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_millis(50),
            loss_threshold: 3,
            disabled: false,
        }
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn data_flows_between_engines() {
        let metrics = Arc::new(MetricsRegistry::new());
        let (a, b) = connected_pair().await;
        let (handle_a, _events_a) =
            spawn_connection(a, BytesMut::new(), settings(), Arc::clone(&metrics));
        let (_handle_b, mut events_b) =
            spawn_connection(b, BytesMut::new(), settings(), Arc::clone(&metrics));

        handle_a.send(Bytes::from_static(b"ping")).await.unwrap();
        match events_b.recv().await.unwrap() {
            ConnEvent::Message(payload) => assert_eq!(payload.as_ref(), b"ping"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeats_keep_idle_connection_alive() {
        let metrics = Arc::new(MetricsRegistry::new());
        let (a, b) = connected_pair().await;
        let (_handle_a, _events_a) =
            spawn_connection(a, BytesMut::new(), settings(), Arc::clone(&metrics));
        let (_handle_b, mut events_b) =
            spawn_connection(b, BytesMut::new(), settings(), Arc::clone(&metrics));

        // Several read-timeout windows pass without traffic; heartbeats must
        // prevent a disconnect.
        let idle = tokio::time::timeout(Duration::from_millis(400), events_b.recv()).await;
        assert!(idle.is_err(), "connection should stay silent but alive");
    }

    #[tokio::test]
    async fn local_close_surfaces_once() {
        let metrics = Arc::new(MetricsRegistry::new());
        let (a, b) = connected_pair().await;
        let (handle_a, mut events_a) =
            spawn_connection(a, BytesMut::new(), settings(), Arc::clone(&metrics));
        let (_handle_b, _events_b) =
            spawn_connection(b, BytesMut::new(), settings(), Arc::clone(&metrics));

        handle_a.close();
        match events_a.recv().await.unwrap() {
            ConnEvent::Disconnected(DisconnectReason::LocalClose) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(handle_a.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn peer_close_is_reported() {
        let metrics = Arc::new(MetricsRegistry::new());
        let (a, b) = connected_pair().await;
        let (handle_a, _events_a) =
            spawn_connection(a, BytesMut::new(), settings(), Arc::clone(&metrics));
        let (_handle_b, mut events_b) =
            spawn_connection(b, BytesMut::new(), settings(), Arc::clone(&metrics));

        handle_a.close();
        loop {
            match events_b.recv().await.unwrap() {
                ConnEvent::Disconnected(DisconnectReason::PeerClosed) => break,
                ConnEvent::Disconnected(other) => panic!("unexpected reason: {other:?}"),
                ConnEvent::Message(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn pause_then_disconnect_reports_peer_close_not_timeout() {
        let metrics = Arc::new(MetricsRegistry::new());
        let (a, b) = connected_pair().await;
        let (handle_a, mut events_a) =
            spawn_connection(a, BytesMut::new(), settings(), Arc::clone(&metrics));
        let (handle_b, _events_b) =
            spawn_connection(b, BytesMut::new(), settings(), Arc::clone(&metrics));

        handle_a.pause_receiving();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle_b.close();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle_a.resume_receiving();

        match tokio::time::timeout(Duration::from_secs(1), events_a.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ConnEvent::Disconnected(DisconnectReason::PeerClosed) => {}
            other => panic!("expected peer close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pause_resume_tolerates_inflight_heartbeat() {
        let metrics = Arc::new(MetricsRegistry::new());
        let (a, b) = connected_pair().await;
        let (handle_a, mut events_a) =
            spawn_connection(a, BytesMut::new(), settings(), Arc::clone(&metrics));
        let (handle_b, _events_b) =
            spawn_connection(b, BytesMut::new(), settings(), Arc::clone(&metrics));

        handle_a.pause_receiving();
        assert!(handle_a.is_paused());
        // Paused across several would-be read timeouts.
        tokio::time::sleep(Duration::from_millis(400)).await;
        handle_a.resume_receiving();

        handle_b.send(Bytes::from_static(b"after-resume")).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(1), events_a.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ConnEvent::Message(payload) => assert_eq!(payload.as_ref(), b"after-resume"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
