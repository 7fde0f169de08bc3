//! Sensor client
//!
//! The client-side peer of the relay protocol: connects, registers under a
//! label, then exchanges newline-terminated text with the server.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::server::protocol;

/// Errors that can occur during sensor operations
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server closed the connection")]
    ServerClosed,
}

/// Result type for sensor operations
pub type SensorResult<T> = Result<T, SensorError>;

/// A connected, registered sensor.
pub struct Sensor {
    label: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Sensor {
    /// Connect to a relay server and register under the given label.
    ///
    /// The registration line goes out immediately; the server considers the
    /// sensor registered once its hub has processed the event.
    pub async fn connect(label: impl Into<String>, addr: &str) -> SensorResult<Self> {
        let label = label.into();
        let stream = TcpStream::connect(addr).await?;
        let (read_half, mut write_half) = stream.into_split();

        write_half
            .write_all(protocol::registration_line(&label).as_bytes())
            .await?;

        Ok(Self {
            label,
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// The label this sensor registered under.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Send one payload line, framed with this sensor's identity.
    ///
    /// A single trailing newline on the payload is tolerated; the frame
    /// always goes out with exactly one delimiter.
    pub async fn send(&mut self, payload: &str) -> SensorResult<()> {
        let frame = protocol::sensor_frame(&self.label, payload.trim_end_matches('\n'));
        self.writer.write_all(frame.as_bytes()).await?;
        Ok(())
    }

    /// Block until one broadcast line arrives, returning it with its
    /// delimiter. A clean server close is reported as
    /// [`SensorError::ServerClosed`].
    pub async fn read(&mut self) -> SensorResult<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(SensorError::ServerClosed);
        }
        Ok(line)
    }

    /// Close the connection to the server.
    pub async fn close(mut self) -> SensorResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn sensor_and_peer(label: &str) -> (Sensor, BufReader<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (sensor, accepted) = tokio::join!(Sensor::connect(label, &addr), async {
            listener.accept().await.unwrap().0
        });
        (sensor.unwrap(), BufReader::new(accepted))
    }

    async fn read_line(reader: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        line
    }

    #[tokio::test]
    async fn test_connect_sends_registration_line() {
        let (sensor, mut peer) = sensor_and_peer("Hum-07").await;
        assert_eq!(sensor.label(), "Hum-07");
        assert_eq!(read_line(&mut peer).await, "Hum-07\n");
    }

    #[tokio::test]
    async fn test_send_frames_payload_with_identity() {
        let (mut sensor, mut peer) = sensor_and_peer("Hum-07").await;
        read_line(&mut peer).await;

        sensor.send("10C").await.unwrap();
        assert_eq!(read_line(&mut peer).await, "SensorID: Hum-07, Message: 10C\n");

        // A caller-supplied newline is not doubled.
        sensor.send("11C\n").await.unwrap();
        assert_eq!(read_line(&mut peer).await, "SensorID: Hum-07, Message: 11C\n");
    }

    #[tokio::test]
    async fn test_read_returns_one_broadcast_line() {
        let (mut sensor, mut peer) = sensor_and_peer("Hum-07").await;
        read_line(&mut peer).await;

        peer.write_all(b"sensor message: hello\n").await.unwrap();
        let line = timeout(Duration::from_secs(5), sensor.read())
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        assert_eq!(line, "sensor message: hello\n");
    }

    #[tokio::test]
    async fn test_read_after_server_close() {
        let (mut sensor, mut peer) = sensor_and_peer("Hum-07").await;
        // Drain the registration line so the close below is a clean FIN.
        read_line(&mut peer).await;
        drop(peer);

        let result = timeout(Duration::from_secs(5), sensor.read())
            .await
            .expect("timed out waiting for the connection to close");
        assert!(matches!(result, Err(SensorError::ServerClosed)));
    }
}
