//! Optical port meter bridge
//!
//! Reads the energy and instantaneous value tables of an electricity meter,
//! decodes them and publishes the values together with Home Assistant
//! discovery configs to MQTT.

pub mod config;
pub mod decoder;
pub mod mqtt;
pub mod poll;
pub mod tables;

// Re-export common types for easier access
pub use config::Config;
pub use mqtt::{MetricPublisher, MqttManager, Transmission};
pub use mqtt::ha_interface::{DiscoveryPublisher, SENSOR_KEYS};
pub use poll::{CycleReport, PollCycle};
pub use tables::{TableReader, TableSource, POLLED_TABLES};
pub use tables::file_source::FileTableSource;
