//! Server network layer accepting TCP connections and handing them to bridges

use crate::bridge::ConnectionBridge;
use crate::hub::{BroadcastHub, HubConfig};
use log::{debug, error, info, warn};
use shared::{read_packet, Metadata, Packet};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Settings for the listener and the hub it owns
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hub: HubConfig,
    /// How long a new connection may take to send its `Hello` frame
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hub: HubConfig::default(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Accept loop owning the broadcast hub
pub struct Server {
    listener: TcpListener,
    hub: BroadcastHub,
    shutdown: CancellationToken,
    handshake_timeout: Duration,
}

impl Server {
    /// Binds the listener and starts the hub under `shutdown`
    pub async fn bind(
        addr: &str,
        config: ServerConfig,
        shutdown: CancellationToken,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let hub = BroadcastHub::spawn(config.hub, shutdown.clone());

        Ok(Server {
            listener,
            hub,
            shutdown,
            handshake_timeout: config.handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    /// Accepts connections until the shutdown token fires, then waits for the
    /// hub to close every outbox
    pub async fn run(self) -> io::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr),
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        info!("Server shutting down");
        self.hub.stopped().await;
        Ok(())
    }

    /// Spawns the task serving one accepted connection
    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let hub = self.hub.clone();
        let cancel = self.shutdown.child_token();
        let handshake_timeout = self.handshake_timeout;

        tokio::spawn(async move {
            debug!("Accepted connection from {}", addr);
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
            }

            let (mut reader, writer) = stream.into_split();
            let metadata = tokio::select! {
                result = read_handshake(&mut reader, handshake_timeout) => match result {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        warn!("Handshake with {} failed: {}", addr, e);
                        return;
                    }
                },
                _ = cancel.cancelled() => return,
            };

            let bridge = ConnectionBridge::new(hub, cancel);
            match bridge.run(&metadata, reader, writer).await {
                Ok(()) => debug!("Connection from {} closed", addr),
                Err(e) if e.is_auth() => warn!("Rejected connection from {}: {}", addr, e),
                Err(e) => warn!("Connection from {} failed: {}", addr, e),
            }
        });
    }
}

/// Reads the `Hello` frame that opens every connection
///
/// A first frame of any other kind carries no metadata, which the bridge then
/// rejects as unauthenticated.
pub async fn read_handshake<R>(reader: &mut R, limit: Duration) -> io::Result<Metadata>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(limit, read_packet(reader)).await {
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no hello within {:?}", limit),
        )),
        Ok(Ok(Some(Packet::Hello { metadata }))) => Ok(metadata),
        Ok(Ok(Some(other))) => {
            debug!("Connection opened with {:?} instead of hello", other);
            Ok(Metadata::new())
        }
        Ok(Ok(None)) => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before hello",
        )),
        Ok(Err(e)) => Err(e),
    }
}
