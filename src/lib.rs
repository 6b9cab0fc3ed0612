//! Linky smart meter acquisition library
//!
//! Reads the TIC output of French Linky meters from a serial link or from
//! D2L dongles over TCP and hands typed channel values to an MQTT publisher.

pub mod models;
#[cfg(feature = "api")]
pub mod api;
pub mod mqtt;
pub mod config;
pub mod linky;

// Re-export common types for easier access
pub use models::{DeviceProtocol, DeviceStatus};
pub use mqtt::{CALLBACKS, MqttManager};
#[cfg(feature = "api")]
pub use api::ApiManager;
pub use config::CONFIG;
pub use linky::LinkyManager;

pub fn get_unix_ts() -> u64 {
    return std::time::SystemTime::now().duration_since(std::time::SystemTime::UNIX_EPOCH).unwrap_or_default().as_secs();
}
