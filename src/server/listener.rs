//! Relay server
//!
//! Owns the listening socket and the accept loop. Each accepted connection
//! goes through the registration handshake (its first line is the sensor's
//! label) and is then handed to the hub as a register event; everything
//! after that point belongs to the hub and the connection's handler.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_MAX_SENSORS;
use crate::hub::{Hub, HubHandle, SensorConnection};

/// How long an accepted connection gets to send its registration line.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the relay server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum number of simultaneously registered sensors
    pub max_sensors: usize,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
            max_sensors: DEFAULT_MAX_SENSORS,
        }
    }

    /// Set the sensor limit
    pub fn with_max_sensors(mut self, max_sensors: usize) -> Self {
        self.max_sensors = max_sensors;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// TCP relay server for line-oriented sensor traffic
pub struct RelayServer {
    config: ServerConfig,
    listener: TcpListener,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Bind the listening socket.
    ///
    /// An unavailable address is fatal and reported here; the server never
    /// starts.
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        let addr = config.socket_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind relay listener on {}", addr))?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            listener,
            shutdown_tx,
        })
    }

    /// The address the listener is actually bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Trigger server shutdown: stops the accept loop, the hub, and every
    /// connection handler.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the relay server.
    ///
    /// Starts the hub event loop, then accepts connections until a shutdown
    /// signal arrives. Accept and handshake failures are logged and the
    /// loop continues.
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!("Relay listening on {}", addr);

        let (hub, handle) = Hub::new(self.shutdown_tx.clone());
        tokio::spawn(hub.run());

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => self.admit(stream, peer_addr, &handle).await,
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping accept loop");
                    break;
                }
            }
        }

        let remaining = handle.registered_count();
        if remaining > 0 {
            info!("Shutting down with {} sensors still registered", remaining);
        }
        Ok(())
    }

    /// Handshake one accepted connection and register it with the hub.
    async fn admit(&self, stream: TcpStream, peer_addr: SocketAddr, handle: &HubHandle) {
        debug!("Accepted connection from {}", peer_addr);

        if handle.registered_count() >= self.config.max_sensors {
            // Capacity policy: dropping the stream closes it.
            warn!(
                "Sensor limit of {} reached, refusing connection from {}",
                self.config.max_sensors, peer_addr
            );
            return;
        }

        match handshake(stream).await {
            Ok((label, connection)) => {
                debug!("Sensor {} completed handshake from {}", label, peer_addr);
                if handle.submit_register(label, connection).await.is_err() {
                    warn!("Hub is no longer accepting registrations");
                }
            }
            // The connection was never registered; dropping the stream in
            // handshake() closed it.
            Err(e) => warn!("Registration handshake with {} failed: {}", peer_addr, e),
        }
    }
}

/// Read the registration line off a fresh connection.
///
/// Returns the sensor's label and the connection with the handshake bytes
/// already consumed. On any failure the stream is dropped, which closes it.
async fn handshake(stream: TcpStream) -> io::Result<(String, SensorConnection)> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let n = timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                "registration line not received in time",
            )
        })??;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before registration",
        ));
    }

    let label = line.trim_end_matches(['\r', '\n']).to_string();
    Ok((label, SensorConnection::from_parts(reader, write_half)))
}

/// Construct and run a relay server on `addr` (`host:port`).
///
/// Returns only on fatal listener setup failure or after a shutdown signal.
pub async fn listen_and_serve(addr: &str) -> anyhow::Result<()> {
    let (bind, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("address {} must be host:port", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in address {}", addr))?;

    let server = RelayServer::bind(ServerConfig::new(bind, port)).await?;
    server.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{Sensor, SensorError};
    use std::sync::Arc;

    async fn start_server(config: ServerConfig) -> (Arc<RelayServer>, String) {
        let server = Arc::new(RelayServer::bind(config).await.unwrap());
        let addr = server.local_addr().unwrap().to_string();
        let runner = Arc::clone(&server);
        tokio::spawn(async move { runner.run().await });
        (server, addr)
    }

    async fn recv(sensor: &mut Sensor) -> String {
        timeout(Duration::from_secs(5), sensor.read())
            .await
            .expect("timed out waiting for a broadcast line")
            .unwrap()
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1", 4600);
        assert_eq!(config.socket_addr(), "127.0.0.1:4600");
        assert_eq!(config.max_sensors, DEFAULT_MAX_SENSORS);
    }

    #[test]
    fn test_server_config_with_max_sensors() {
        let config = ServerConfig::new("0.0.0.0", 4600).with_max_sensors(2);
        assert_eq!(config.max_sensors, 2);
    }

    #[tokio::test]
    async fn test_end_to_end_relay() {
        let (_server, addr) = start_server(ServerConfig::new("127.0.0.1", 0)).await;

        let mut a = Sensor::connect("Temp-01", &addr).await.unwrap();
        assert_eq!(recv(&mut a).await, "Sensor: Temp-01 registered\n");

        let mut b = Sensor::connect("Temp-02", &addr).await.unwrap();
        assert_eq!(recv(&mut b).await, "Sensor: Temp-02 registered\n");
        assert_eq!(recv(&mut a).await, "Sensor: Temp-02 registered\n");

        a.send("10C").await.unwrap();
        let want = "sensor message: SensorID: Temp-01, Message: 10C\n";
        assert_eq!(recv(&mut b).await, want);
        // The sender is a registered sensor too, so it hears its own
        // message back.
        assert_eq!(recv(&mut a).await, want);
    }

    #[tokio::test]
    async fn test_disconnected_sensor_leaves_server_healthy() {
        let (_server, addr) = start_server(ServerConfig::new("127.0.0.1", 0)).await;

        let mut a = Sensor::connect("Temp-01", &addr).await.unwrap();
        recv(&mut a).await;
        let mut b = Sensor::connect("Temp-02", &addr).await.unwrap();
        recv(&mut b).await;
        recv(&mut a).await;

        b.close().await.unwrap();

        // Relaying keeps working for the remaining sensor.
        a.send("21C").await.unwrap();
        assert_eq!(
            recv(&mut a).await,
            "sensor message: SensorID: Temp-01, Message: 21C\n"
        );
    }

    #[tokio::test]
    async fn test_sensor_limit_refuses_extra_connections() {
        let (_server, addr) =
            start_server(ServerConfig::new("127.0.0.1", 0).with_max_sensors(1)).await;

        let mut a = Sensor::connect("Temp-01", &addr).await.unwrap();
        assert_eq!(recv(&mut a).await, "Sensor: Temp-01 registered\n");

        // The connection itself succeeds, but the server drops it before
        // the handshake. Depending on whether the registration line was
        // already buffered server-side, the refusal surfaces as a clean
        // close or a reset; either way, no line ever arrives.
        let mut b = Sensor::connect("Temp-02", &addr).await.unwrap();
        let result = timeout(Duration::from_secs(5), b.read())
            .await
            .expect("timed out waiting for the refused connection to close");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_handshake_failure_leaves_server_healthy() {
        let (_server, addr) = start_server(ServerConfig::new("127.0.0.1", 0)).await;

        // Connect and leave without ever sending a registration line.
        let stream = TcpStream::connect(&addr).await.unwrap();
        drop(stream);

        let mut a = Sensor::connect("Temp-01", &addr).await.unwrap();
        assert_eq!(recv(&mut a).await, "Sensor: Temp-01 registered\n");
    }

    #[tokio::test]
    async fn test_listen_and_serve_rejects_address_in_use() {
        let server = RelayServer::bind(ServerConfig::new("127.0.0.1", 0)).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let result = listen_and_serve(&addr).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_listen_and_serve_rejects_malformed_address() {
        assert!(listen_and_serve("no-port-here").await.is_err());
        assert!(listen_and_serve("127.0.0.1:notaport").await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_server_and_closes_sensors() {
        let server = Arc::new(
            RelayServer::bind(ServerConfig::new("127.0.0.1", 0)).await.unwrap(),
        );
        let addr = server.local_addr().unwrap().to_string();
        let runner = Arc::clone(&server);
        let task = tokio::spawn(async move { runner.run().await });

        // A completed registration proves the accept loop is running.
        let mut a = Sensor::connect("Temp-01", &addr).await.unwrap();
        assert_eq!(recv(&mut a).await, "Sensor: Temp-01 registered\n");

        server.shutdown();
        timeout(Duration::from_secs(5), task)
            .await
            .expect("server did not stop after shutdown")
            .unwrap()
            .unwrap();

        // The hub dropped its write halves on the way out.
        let result = timeout(Duration::from_secs(5), a.read())
            .await
            .expect("timed out waiting for the connection to close");
        assert!(matches!(result, Err(SensorError::ServerClosed)));
    }
}
