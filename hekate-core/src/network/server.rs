//! Server side of the transport: listener, handshake dispatch, connectors.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{Codec, CodecFactory, decode_from_bytes, encode_to_bytes};
use crate::config::NetworkConfig;
use crate::metrics::MetricsRegistry;
use crate::network::NetworkError;
use crate::network::connection::{
    ConnEvent, ConnectionHandle, DisconnectReason, HeartbeatSettings, spawn_connection,
};
use crate::network::protocol::{TransportFrame, try_split_frame};

/// Declares one named connector on the transport.
pub struct NetworkConnectorConfig<T> {
    /// Protocol identifier carried in handshakes.
    pub protocol: String,
    /// Codec applied to every payload on this connector.
    pub codec: Arc<dyn CodecFactory<T>>,
    /// Disables heartbeat emission for connections accepted on this
    /// connector (the read watchdog stays armed).
    pub heartbeat_disabled: bool,
}

/// Inbound handler attached to a connector.
#[async_trait]
pub trait ServerHandler<T>: Send + Sync {
    /// Examines the handshake login payload; a returned string rejects the
    /// connection with that reason.
    async fn on_handshake(&self, login: Bytes, remote: SocketAddr) -> Result<(), String> {
        let _ = (login, remote);
        Ok(())
    }

    /// Called for every decoded message, in arrival order per connection.
    async fn on_message(&self, msg: T, from: &ServerConnection<T>);

    /// Called once when the connection ends.
    async fn on_disconnect(&self, remote: SocketAddr, reason: DisconnectReason) {
        let _ = (remote, reason);
    }
}

/// Write/control handle for one accepted connection.
pub struct ServerConnection<T> {
    remote: SocketAddr,
    handle: ConnectionHandle,
    codec: Arc<dyn Codec<T>>,
}

impl<T> Clone for ServerConnection<T> {
    fn clone(&self) -> Self {
        Self {
            remote: self.remote,
            handle: self.handle.clone(),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl<T> ServerConnection<T> {
    /// Peer address.
    #[must_use]
    pub const fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Encodes and sends a message to the peer.
    pub async fn send(&self, msg: &T) -> Result<(), NetworkError> {
        let payload = encode_to_bytes(self.codec.as_ref(), msg)?;
        self.handle.send(payload).await
    }

    /// Suspends reads from this peer (transport-level backpressure).
    pub fn pause_receiving(&self) {
        self.handle.pause_receiving();
    }

    /// Resumes reads from this peer.
    pub fn resume_receiving(&self) {
        self.handle.resume_receiving();
    }

    /// Closes the connection.
    pub fn disconnect(&self) {
        self.handle.close();
    }
}

/// Type-erased connector stored in the service registry.
#[async_trait]
pub(crate) trait ErasedConnector: Send + Sync {
    fn heartbeat_disabled(&self) -> bool;

    async fn try_accept(&self, login: Bytes, remote: SocketAddr) -> Result<(), String>;

    fn launch(
        &self,
        stream: TcpStream,
        leftover: BytesMut,
        remote: SocketAddr,
        heartbeats: HeartbeatSettings,
        metrics: Arc<MetricsRegistry>,
        shutdown: watch::Receiver<bool>,
    );
}

pub(crate) struct TypedConnector<T> {
    codec: Arc<dyn CodecFactory<T>>,
    handler: Arc<dyn ServerHandler<T>>,
    heartbeat_disabled: bool,
}

impl<T> TypedConnector<T> {
    pub(crate) fn new(config: &NetworkConnectorConfig<T>, handler: Arc<dyn ServerHandler<T>>) -> Self {
        Self {
            codec: Arc::clone(&config.codec),
            handler,
            heartbeat_disabled: config.heartbeat_disabled,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> ErasedConnector for TypedConnector<T> {
    fn heartbeat_disabled(&self) -> bool {
        self.heartbeat_disabled
    }

    async fn try_accept(&self, login: Bytes, remote: SocketAddr) -> Result<(), String> {
        self.handler.on_handshake(login, remote).await
    }

    fn launch(
        &self,
        stream: TcpStream,
        leftover: BytesMut,
        remote: SocketAddr,
        heartbeats: HeartbeatSettings,
        metrics: Arc<MetricsRegistry>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let codec = self.codec.create();
        let handler = Arc::clone(&self.handler);
        let (handle, mut events) = spawn_connection(stream, leftover, heartbeats, metrics);
        let connection = ServerConnection {
            remote,
            handle: handle.clone(),
            codec: Arc::clone(&codec),
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        handle.close();
                    }
                    event = events.recv() => match event {
                        Some(ConnEvent::Message(payload)) => {
                            match decode_from_bytes(codec.as_ref(), payload) {
                                Ok(msg) => handler.on_message(msg, &connection).await,
                                Err(err) => {
                                    warn!(%remote, "payload decode failed: {err}");
                                    handle.close();
                                    handler
                                        .on_disconnect(
                                            remote,
                                            DisconnectReason::Codec(err.to_string()),
                                        )
                                        .await;
                                    return;
                                }
                            }
                        }
                        Some(ConnEvent::Disconnected(reason)) => {
                            handler.on_disconnect(remote, reason).await;
                            return;
                        }
                        None => return,
                    }
                }
            }
        });
    }
}

/// Resolves the configured bind host to an IP address.
fn resolve_host(host: &str) -> Result<IpAddr, NetworkError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(NetworkError::Io)?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| NetworkError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("host '{host}' did not resolve"),
        )))
}

fn new_socket(addr: SocketAddr, config: &NetworkConfig) -> Result<TcpSocket, NetworkError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if config.so_reuse_address {
        socket.set_reuseaddr(true)?;
    }
    if let Some(size) = config.so_receive_buffer {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.so_send_buffer {
        socket.set_send_buffer_size(size)?;
    }
    Ok(socket)
}

/// Binds the listener, walking the configured port range on failure.
pub(crate) fn bind_listener(config: &NetworkConfig) -> Result<TcpListener, NetworkError> {
    let host = resolve_host(&config.host)?;
    let attempts = if config.port == 0 {
        1
    } else {
        config.port_range.max(1)
    };

    let mut last_error = None;
    for offset in 0..attempts {
        let Some(port) = (if config.port == 0 {
            Some(0)
        } else {
            config.port.checked_add(offset)
        }) else {
            break;
        };
        let addr = SocketAddr::new(host, port);
        let socket = new_socket(addr, config)?;
        match socket.bind(addr) {
            Ok(()) => match socket.listen(config.so_backlog) {
                Ok(listener) => {
                    if offset > 0 {
                        debug!(%addr, "bound after {offset} failed attempts");
                    }
                    return Ok(listener);
                }
                Err(err) => last_error = Some(err),
            },
            Err(err) => last_error = Some(err),
        }
    }

    Err(NetworkError::BindExhausted {
        start_port: config.port,
        attempts,
        source: last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "no ports attempted")
        }),
    })
}

/// Reads frames until the handshake request arrives, returning it together
/// with any bytes that followed it in the same read.
async fn read_handshake(
    stream: &mut TcpStream,
    budget: Duration,
) -> Result<(String, Bytes, BytesMut), NetworkError> {
    let mut buf = BytesMut::with_capacity(4 * 1024);
    let frame = timeout(budget, async {
        loop {
            if let Some(body) = try_split_frame(&mut buf)? {
                return TransportFrame::decode(body).map_err(NetworkError::Codec);
            }
            let read = stream.read_buf(&mut buf).await?;
            if read == 0 {
                return Err(NetworkError::ClosedChannel);
            }
        }
    })
    .await
    .map_err(|_| NetworkError::ReadTimeout)??;

    match frame {
        TransportFrame::HandshakeRequest { protocol, login } => Ok((protocol, login, buf)),
        other => {
            debug!(?other, "first frame was not a handshake request");
            Err(NetworkError::Codec(crate::codec::CodecError::UnknownType(0)))
        }
    }
}

/// Per-connection handshake and connector dispatch.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn serve_incoming(
    mut stream: TcpStream,
    remote: SocketAddr,
    config: Arc<NetworkConfig>,
    connectors: Arc<dashmap::DashMap<String, Arc<dyn ErasedConnector>>>,
    metrics: Arc<MetricsRegistry>,
    shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(config.tcp_no_delay);

    let (protocol, login, leftover) =
        match read_handshake(&mut stream, config.connect_timeout).await {
            Ok(parts) => parts,
            Err(err) => {
                debug!(%remote, "handshake read failed: {err}");
                return;
            }
        };

    let Some(connector) = connectors.get(&protocol).map(|entry| Arc::clone(&entry)) else {
        let reject = TransportFrame::HandshakeReject {
            reason: format!("unknown protocol: {protocol}"),
        };
        let _ = stream.write_all(&reject.encode()).await;
        debug!(%remote, protocol, "rejected handshake for unknown protocol");
        return;
    };

    if let Err(reason) = connector.try_accept(login, remote).await {
        let reject = TransportFrame::HandshakeReject {
            reason: reason.clone(),
        };
        let _ = stream.write_all(&reject.encode()).await;
        debug!(%remote, protocol, reason, "handshake rejected by handler");
        return;
    }

    let heartbeats = HeartbeatSettings {
        interval: config.heartbeat_interval,
        loss_threshold: config.heartbeat_loss_threshold,
        disabled: connector.heartbeat_disabled(),
    };
    let accept = TransportFrame::HandshakeAccept {
        hb_interval_ms: config.heartbeat_interval.as_millis() as u32,
        hb_loss_threshold: config.heartbeat_loss_threshold,
        hb_disabled: connector.heartbeat_disabled(),
    };
    if let Err(err) = stream.write_all(&accept.encode()).await {
        debug!(%remote, "failed to send handshake accept: {err}");
        return;
    }

    debug!(%remote, protocol, "connection accepted");
    connector.launch(stream, leftover, remote, heartbeats, metrics, shutdown);
}

/// Accept loop; sleeps and retries on accept failure, exits on shutdown.
pub(crate) async fn acceptor_loop(
    listener: TcpListener,
    config: Arc<NetworkConfig>,
    connectors: Arc<dashmap::DashMap<String, Arc<dyn ErasedConnector>>>,
    metrics: Arc<MetricsRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "transport listening");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tokio::spawn(serve_incoming(
                        stream,
                        remote,
                        Arc::clone(&config),
                        Arc::clone(&connectors),
                        Arc::clone(&metrics),
                        shutdown.clone(),
                    ));
                }
                Err(err) => {
                    warn!("accept failed: {err}; retrying");
                    tokio::time::sleep(config.accept_retry_interval).await;
                }
            }
        }
    }
    debug!("acceptor stopped");
}
