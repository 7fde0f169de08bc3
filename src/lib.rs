//! Line-oriented TCP broadcast relay for sensor networks.
//!
//! A relay server accepts sensor connections, registers each one under a
//! free-form label, and rebroadcasts every line any sensor sends to all
//! registered sensors. Connection bookkeeping is serialized through a single
//! hub event loop; see [`hub`] for the coordination model and
//! [`server::protocol`] for the wire format.

pub mod config;
pub mod hub;
pub mod sensor;
pub mod server;

pub use config::RelayConfig;
pub use hub::{Hub, HubHandle, SensorConnection};
pub use sensor::Sensor;
pub use server::{listen_and_serve, RelayServer, ServerConfig};
