//! Sensor client module
//!
//! The client-side peer of the relay protocol.

mod client;

pub use client::*;
