//! Configuration module
//!
//! Loads relay server settings from a TOML file.

mod relay;

pub use relay::*;
