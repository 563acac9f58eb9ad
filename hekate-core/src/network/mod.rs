//! Connection-oriented, protocol-multiplexed TCP transport.
//!
//! The transport offers named connectors: each carries a protocol
//! identifier, a codec and (server-side) a message handler. Inbound
//! connections select their connector during the handshake; outbound
//! connections are dialed with [`NetworkService::connect`]. Heartbeats,
//! idle watchdogs, pause/resume and port-range bind failover live here.

mod client;
mod connection;
pub(crate) mod protocol;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

pub use client::{ClientFailure, ClientHandler, ClientState, NetworkClient};
pub use connection::DisconnectReason;
pub use server::{NetworkConnectorConfig, ServerConnection, ServerHandler};

use crate::codec::{CodecError, CodecFactory};
use crate::config::NetworkConfig;
use crate::metrics::MetricsRegistry;
use client::ConnectSettings;
use protocol::{TransportFrame, try_split_frame};
use server::{ErasedConnector, TypedConnector};

/// Protocol id of the built-in ping connector every server exposes.
pub const PING_PROTOCOL: &str = "hekate.ping";

/// Transport failures.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Dial did not finish within the configured budget.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// Read-idle watchdog fired.
    #[error("read timed out")]
    ReadTimeout,
    /// Connection is closed (locally or by the peer).
    #[error("connection closed")]
    ClosedChannel,
    /// Server refused the handshake.
    #[error("handshake rejected: {reason}")]
    HandshakeRejected {
        /// Reason supplied by the remote handler.
        reason: String,
    },
    /// No connector is registered for the requested protocol.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),
    /// A connector with this protocol id already exists.
    #[error("duplicate protocol: {0}")]
    DuplicateProtocol(String),
    /// Every port in the configured range failed to bind.
    #[error("bind failed after {attempts} attempts starting at port {start_port}: {source}")]
    BindExhausted {
        /// First port tried.
        start_port: u16,
        /// Ports tried.
        attempts: u16,
        /// Last bind error observed.
        #[source]
        source: std::io::Error,
    },
    /// Encode/decode failure.
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),
    /// Underlying socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of probing a remote transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    /// A transport answered the ping handshake.
    Success,
    /// Nothing answered within the connect timeout.
    Timeout,
    /// The host refused or reset the connection.
    Failure,
}

struct ServerRuntime {
    local_addr: SocketAddr,
    acceptor: JoinHandle<()>,
}

/// The transport service: connector registry, server runtime and dialer.
pub struct NetworkService {
    config: Arc<NetworkConfig>,
    metrics: Arc<MetricsRegistry>,
    connectors: Arc<DashMap<String, Arc<dyn ErasedConnector>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    server: Mutex<Option<ServerRuntime>>,
}

impl NetworkService {
    /// Creates a stopped transport with the built-in ping connector.
    #[must_use]
    pub fn new(config: NetworkConfig, metrics: Arc<MetricsRegistry>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let service = Arc::new(Self {
            config: Arc::new(config),
            metrics,
            connectors: Arc::new(DashMap::new()),
            shutdown_tx,
            shutdown_rx,
            server: Mutex::new(None),
        });
        service
            .connectors
            .insert(PING_PROTOCOL.to_string(), Arc::new(PingConnector));
        service
    }

    /// Transport configuration.
    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Registers a named connector; protocols must be unique.
    pub fn register_connector<T: Send + 'static>(
        &self,
        config: NetworkConnectorConfig<T>,
        handler: Arc<dyn ServerHandler<T>>,
    ) -> Result<(), NetworkError> {
        let protocol = config.protocol.clone();
        let connector: Arc<dyn ErasedConnector> = Arc::new(TypedConnector::new(&config, handler));
        match self.connectors.entry(protocol.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(NetworkError::DuplicateProtocol(protocol))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(connector);
                Ok(())
            }
        }
    }

    /// Binds the listener (walking the port range) and starts accepting.
    pub fn start(&self) -> Result<SocketAddr, NetworkError> {
        let mut server = self.server.lock();
        if let Some(runtime) = server.as_ref() {
            return Ok(runtime.local_addr);
        }
        let listener = server::bind_listener(&self.config)?;
        let local_addr = listener.local_addr()?;
        if self.config.transport != crate::config::TransportMode::Auto {
            // Readiness polling is owned by the runtime; the option is kept
            // for deployment parity and surfaced here.
            info!(transport = ?self.config.transport, "transport backend pinned by configuration");
        }
        let acceptor = tokio::spawn(server::acceptor_loop(
            listener,
            Arc::clone(&self.config),
            Arc::clone(&self.connectors),
            Arc::clone(&self.metrics),
            self.shutdown_rx.clone(),
        ));
        info!(%local_addr, "network service started");
        *server = Some(ServerRuntime {
            local_addr,
            acceptor,
        });
        Ok(local_addr)
    }

    /// Address the listener is bound to, if started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(|runtime| runtime.local_addr)
    }

    /// Stops the acceptor and closes every tracked connection. The
    /// connector registry is dropped as well; a stopped service is not
    /// restarted (each incarnation builds a fresh one).
    pub async fn stop(&self) {
        let runtime = self.server.lock().take();
        if let Some(runtime) = runtime {
            let _ = self.shutdown_tx.send(true);
            runtime.acceptor.abort();
            let _ = runtime.acceptor.await;
            self.connectors.clear();
            debug!("network service stopped");
        }
    }

    /// Dials a remote connector. The returned client starts in
    /// `Connecting`; sends are buffered until the handshake completes.
    pub fn connect<T: Send + 'static>(
        &self,
        remote: SocketAddr,
        protocol: impl Into<String>,
        login: Bytes,
        codec: &Arc<dyn CodecFactory<T>>,
        handler: Arc<dyn ClientHandler<T>>,
    ) -> NetworkClient<T> {
        client::launch_client(
            remote,
            protocol.into(),
            login,
            codec,
            handler,
            ConnectSettings {
                connect_timeout: self.config.connect_timeout,
                tcp_no_delay: self.config.tcp_no_delay,
            },
            Arc::clone(&self.metrics),
        )
    }

    /// Probes `addr` for a live transport.
    ///
    /// `Success` iff a transport completes the ping handshake; `Timeout`
    /// when nothing answers within the connect timeout; `Failure` on
    /// refusal/reset or a non-transport peer.
    pub async fn ping(&self, addr: SocketAddr) -> PingResult {
        let budget = self.config.connect_timeout;
        match timeout(budget, ping_handshake(addr)).await {
            Ok(Ok(())) => PingResult::Success,
            Ok(Err(PingProbeError::Refused)) => PingResult::Failure,
            Ok(Err(PingProbeError::NotTransport)) => PingResult::Failure,
            Err(_) => PingResult::Timeout,
        }
    }
}

enum PingProbeError {
    Refused,
    NotTransport,
}

async fn ping_handshake(addr: SocketAddr) -> Result<(), PingProbeError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|_| PingProbeError::Refused)?;
    let request = TransportFrame::HandshakeRequest {
        protocol: PING_PROTOCOL.to_string(),
        login: Bytes::new(),
    };
    stream
        .write_all(&request.encode())
        .await
        .map_err(|_| PingProbeError::Refused)?;

    let mut buf = BytesMut::with_capacity(256);
    loop {
        match try_split_frame(&mut buf) {
            Ok(Some(body)) => {
                return match TransportFrame::decode(body) {
                    Ok(TransportFrame::HandshakeAccept { .. }) => Ok(()),
                    _ => Err(PingProbeError::NotTransport),
                };
            }
            Ok(None) => {}
            Err(_) => return Err(PingProbeError::NotTransport),
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) => return Err(PingProbeError::NotTransport),
            Ok(_) => {}
            Err(_) => return Err(PingProbeError::Refused),
        }
    }
}

/// Built-in connector answering ping handshakes; inbound payloads are
/// ignored and the connection simply idles until the prober goes away.
struct PingConnector;

#[async_trait::async_trait]
impl ErasedConnector for PingConnector {
    fn heartbeat_disabled(&self) -> bool {
        false
    }

    async fn try_accept(&self, _login: Bytes, _remote: SocketAddr) -> Result<(), String> {
        Ok(())
    }

    fn launch(
        &self,
        stream: TcpStream,
        leftover: BytesMut,
        _remote: SocketAddr,
        heartbeats: connection::HeartbeatSettings,
        metrics: Arc<MetricsRegistry>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (handle, mut events) = connection::spawn_connection(stream, leftover, heartbeats, metrics);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        handle.close();
                    }
                    event = events.recv() => match event {
                        Some(connection::ConnEvent::Message(_)) => {}
                        Some(connection::ConnEvent::Disconnected(_)) | None => return,
                    }
                }
            }
        });
    }
}
