//! Wire format for the relay protocol
//!
//! Everything on the wire is newline-terminated UTF-8 text: no binary
//! framing, no length prefixes, no message ids, no acknowledgements. These
//! helpers build every line the protocol knows about.

/// First line a sensor sends after connecting: its free-form label.
pub fn registration_line(label: &str) -> String {
    format!("{}\n", label)
}

/// Announcement fanned out when a sensor joins the registry.
pub fn registration_announcement(label: &str) -> String {
    format!("Sensor: {} registered\n", label)
}

/// Relay wrapper applied to every line received from a registered sensor.
///
/// `line` is the received text without its delimiter; the sender's identity
/// is already embedded in it by the sensor's own framing.
pub fn relay_message(line: &str) -> String {
    format!("sensor message: {}\n", line)
}

/// Frame a payload with the sending sensor's identity.
pub fn sensor_frame(label: &str, payload: &str) -> String {
    format!("SensorID: {}, Message: {}\n", label, payload)
}
