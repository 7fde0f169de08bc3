//! Connection registry coordinator
//!
//! The hub is the single point of truth for "who is connected". All registry
//! mutation and all broadcast fan-out happen inside one event loop, so the
//! accept loop and the per-connection handlers never touch the sensor map:
//! they only enqueue events onto the hub's bounded queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ConnectionHandler;
use crate::server::protocol;

/// Capacity of the register event queue.
pub const REGISTER_QUEUE_CAPACITY: usize = 16;

/// Capacity of the unregister event queue.
pub const UNREGISTER_QUEUE_CAPACITY: usize = 16;

/// Capacity of the broadcast event queue. Larger than the lifecycle queues
/// since every line any sensor sends passes through it.
pub const BROADCAST_QUEUE_CAPACITY: usize = 64;

/// Errors that can occur when submitting events to the hub
#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub event loop is not running")]
    Closed,
}

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;

/// One live sensor stream, split for concurrent reading and writing.
///
/// Ownership is joint: once registered, the handler owns the buffered read
/// half and the registry owns the write half. Removal is arbitrated solely
/// by the hub via unregister events; dropping both halves closes the socket.
pub struct SensorConnection {
    id: Uuid,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SensorConnection {
    /// Wrap a freshly accepted stream.
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self::from_parts(BufReader::new(read_half), write_half)
    }

    /// Build a connection from halves that were split earlier, keeping any
    /// bytes the registration handshake buffered ahead of the payload.
    pub fn from_parts(reader: BufReader<OwnedReadHalf>, writer: OwnedWriteHalf) -> Self {
        Self {
            id: Uuid::new_v4(),
            reader,
            writer,
        }
    }

    /// Opaque identity used as the registry key.
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn into_parts(self) -> (Uuid, BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        (self.id, self.reader, self.writer)
    }
}

/// Request to add a sensor to the registry.
pub struct RegisterEvent {
    /// Free-form label read during the registration handshake.
    pub label: String,
    /// The connection to register.
    pub connection: SensorConnection,
}

/// Cloneable producer side of the hub's event queues.
///
/// Submitting suspends only while the target queue is full and fails only
/// once the hub loop has stopped.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<RegisterEvent>,
    unregister_tx: mpsc::Sender<Uuid>,
    broadcast_tx: mpsc::Sender<String>,
    registered: Arc<AtomicUsize>,
}

impl HubHandle {
    /// Enqueue a register event for a connection that completed its handshake.
    pub async fn submit_register(
        &self,
        label: impl Into<String>,
        connection: SensorConnection,
    ) -> HubResult<()> {
        self.register_tx
            .send(RegisterEvent {
                label: label.into(),
                connection,
            })
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Enqueue an unregister event for the given sensor.
    ///
    /// Unregistering a sensor that was already removed is a no-op when the
    /// event is processed.
    pub async fn submit_unregister(&self, sensor_id: Uuid) -> HubResult<()> {
        self.unregister_tx
            .send(sensor_id)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Enqueue one line to be sent to every registered sensor.
    ///
    /// The line is written to each connection verbatim, so it should carry
    /// its `\n` delimiter.
    pub async fn submit_broadcast(&self, line: impl Into<String>) -> HubResult<()> {
        self.broadcast_tx
            .send(line.into())
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Number of sensors currently in the registry.
    pub fn registered_count(&self) -> usize {
        self.registered.load(Ordering::Relaxed)
    }
}

/// A registered sensor as the hub sees it: its label and its write half.
struct RegisteredSensor {
    label: String,
    writer: OwnedWriteHalf,
}

/// The authoritative mapping of live connections to their labels.
///
/// Only the hub loop holds this; every mutation below runs between two
/// `select!` polls, so no locking is involved.
struct Registry {
    sensors: HashMap<Uuid, RegisteredSensor>,
    registered: Arc<AtomicUsize>,
    handle: HubHandle,
    shutdown_tx: broadcast::Sender<()>,
}

impl Registry {
    /// Insert the connection, announce the new membership, and start the
    /// sensor's read pump.
    async fn register(&mut self, event: RegisterEvent) {
        let RegisterEvent { label, connection } = event;
        let (id, reader, writer) = connection.into_parts();

        info!("Sensor {} registered ({})", label, id);
        self.sensors.insert(
            id,
            RegisteredSensor {
                label: label.clone(),
                writer,
            },
        );
        self.registered.store(self.sensors.len(), Ordering::Relaxed);

        // The announcement travels through the broadcast queue like any other
        // fan-out request. try_send keeps the loop off its own bounded queue;
        // when the queue is full the announcement is dropped with a warning.
        let announcement = protocol::registration_announcement(&label);
        if self.handle.broadcast_tx.try_send(announcement).is_err() {
            warn!(
                "Broadcast queue full, dropping registration announcement for {}",
                label
            );
        }

        let handler = ConnectionHandler::new(
            id,
            label,
            reader,
            self.handle.clone(),
            self.shutdown_tx.subscribe(),
        );
        tokio::spawn(handler.run());
    }

    /// Write one line to every registered sensor, best effort.
    ///
    /// A failed write is a local warning, not a health signal: the sensor
    /// stays registered until its own handler reports a read failure.
    async fn broadcast(&mut self, line: &str) {
        for (id, sensor) in &mut self.sensors {
            if let Err(e) = sensor.writer.write_all(line.as_bytes()).await {
                warn!("Sending to sensor {} ({}) failed: {}", sensor.label, id, e);
            }
        }
    }

    /// Remove the sensor if it is still present.
    fn unregister(&mut self, sensor_id: Uuid) {
        match self.sensors.remove(&sensor_id) {
            Some(sensor) => info!("Sensor {} unregistered ({})", sensor.label, sensor_id),
            None => debug!("Unregister for unknown sensor {}", sensor_id),
        }
        self.registered.store(self.sensors.len(), Ordering::Relaxed);
    }
}

/// The coordinator event loop and its input queues.
pub struct Hub {
    registry: Registry,
    register_rx: mpsc::Receiver<RegisterEvent>,
    unregister_rx: mpsc::Receiver<Uuid>,
    broadcast_rx: mpsc::Receiver<String>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Hub {
    /// Create a hub and the handle used to feed it events.
    ///
    /// The hub does nothing until [`Hub::run`] is awaited, typically on a
    /// spawned task. `shutdown_tx` is shared with the owning server: firing
    /// it stops the loop and every connection handler.
    pub fn new(shutdown_tx: broadcast::Sender<()>) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(REGISTER_QUEUE_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(UNREGISTER_QUEUE_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE_CAPACITY);

        let registered = Arc::new(AtomicUsize::new(0));
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            registered: Arc::clone(&registered),
        };
        let shutdown_rx = shutdown_tx.subscribe();

        let hub = Hub {
            registry: Registry {
                sensors: HashMap::new(),
                registered,
                handle: handle.clone(),
                shutdown_tx,
            },
            register_rx,
            unregister_rx,
            broadcast_rx,
            shutdown_rx,
        };
        (hub, handle)
    }

    /// Consume events one at a time until shutdown.
    ///
    /// Processing is strictly sequential: a broadcast completes its full
    /// fan-out before the next event is looked at, so two broadcasts are
    /// never interleaved mid-write and the registry is never observed
    /// mid-mutation. No priority exists between the three queues.
    pub async fn run(self) {
        let Hub {
            mut registry,
            mut register_rx,
            mut unregister_rx,
            mut broadcast_rx,
            mut shutdown_rx,
        } = self;

        info!("Hub event loop started");
        loop {
            tokio::select! {
                Some(event) = register_rx.recv() => registry.register(event).await,
                Some(line) = broadcast_rx.recv() => registry.broadcast(&line).await,
                Some(sensor_id) = unregister_rx.recv() => registry.unregister(sensor_id),
                _ = shutdown_rx.recv() => {
                    info!("Hub event loop stopping");
                    break;
                }
            }
        }
    }
}
