//! Per-connection read pump
//!
//! Each registered sensor gets one handler task. It reads newline-terminated
//! messages off the connection and turns them into broadcast events; its only
//! link back to the hub is the event queues. A handler lives exactly as long
//! as its connection: the read failing (or the peer closing) ends the loop
//! and triggers unregistration.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::HubHandle;
use crate::server::protocol;

/// Pumps inbound lines from one sensor into the hub.
pub struct ConnectionHandler {
    sensor_id: Uuid,
    label: String,
    reader: BufReader<OwnedReadHalf>,
    hub: HubHandle,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ConnectionHandler {
    pub(crate) fn new(
        sensor_id: Uuid,
        label: String,
        reader: BufReader<OwnedReadHalf>,
        hub: HubHandle,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            sensor_id,
            label,
            reader,
            hub,
            shutdown_rx,
        }
    }

    /// Read lines until the connection ends, then unregister exactly once.
    ///
    /// A clean close and a transport error differ only in how they are
    /// logged; both end in unregistration. Reads are never retried.
    pub async fn run(mut self) {
        let mut line = String::new();
        loop {
            line.clear();
            tokio::select! {
                result = self.reader.read_line(&mut line) => match result {
                    Ok(0) => {
                        info!("Sensor {} closed its connection", self.label);
                        break;
                    }
                    Ok(_) if !line.ends_with('\n') => {
                        // Final fragment with no delimiter: the peer vanished
                        // mid-write. The fragment is dropped, not relayed.
                        warn!("Sensor {} sent a truncated line, dropping it", self.label);
                        break;
                    }
                    Ok(_) => {
                        let message =
                            protocol::relay_message(line.trim_end_matches(['\r', '\n']));
                        if self.hub.submit_broadcast(message).await.is_err() {
                            debug!("Hub stopped, ending read loop for sensor {}", self.label);
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("Reading from sensor {} failed: {}", self.label, e);
                        break;
                    }
                },
                _ = self.shutdown_rx.recv() => {
                    // The hub is tearing down with us; nothing to unregister.
                    debug!("Shutdown received, ending read loop for sensor {}", self.label);
                    return;
                }
            }
        }

        if self.hub.submit_unregister(self.sensor_id).await.is_err() {
            debug!("Hub stopped before sensor {} could unregister", self.label);
        }
    }
}
