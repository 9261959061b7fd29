use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

fn mqtt_client_name_default() -> String { return "meter2mqtt".to_string() }
fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_ha_enabled_default() -> bool { return true }
fn mqtt_keep_alive_default() -> u64 { return 5 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default="mqtt_ha_enabled_default")]
    pub ha_enabled: bool,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    #[serde(default="mqtt_keep_alive_default")]
    pub keep_alive: u64,
}

fn meter_topic_prefix_default() -> String { return "meter2mqtt".to_string() }
fn meter_manufacturer_default() -> String { return "Networked Electricity Services".to_string() }
fn meter_model_default() -> String { return "NES-Meter".to_string() }
fn meter_device_name_default() -> String { return "Electricity Meter".to_string() }

/// Identity of the meter as it shows up in topics and in Home Assistant
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MeterConfig {
    pub name: String,
    pub id: String,
    #[serde(default="meter_topic_prefix_default")]
    pub topic_prefix: String,
    #[serde(default="meter_manufacturer_default")]
    pub manufacturer: String,
    #[serde(default="meter_model_default")]
    pub model: String,
    #[serde(default="meter_device_name_default")]
    pub device_name: String,
}

fn poll_interval_default() -> u64 { return 60 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct PollConfig {
    /// Seconds between two poll cycles
    #[serde(default="poll_interval_default")]
    pub interval: u64,
}

fn source_dump_dir_default() -> String { return "tables".to_string() }
fn source_retry_delay_default() -> u64 { return 1000 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SourceConfig {
    #[serde(default="source_dump_dir_default")]
    pub dump_dir: String,
    #[serde(default)]
    pub read_retries: u32,
    #[serde(default="source_retry_delay_default")]
    pub retry_delay_ms: u64,
}

fn poll_default() -> PollConfig { return PollConfig { interval: poll_interval_default() } }
fn source_default() -> SourceConfig {
    return SourceConfig {
        dump_dir: source_dump_dir_default(),
        read_retries: 0,
        retry_delay_ms: source_retry_delay_default(),
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub meter: MeterConfig,
    #[serde(default="poll_default")]
    pub poll: PollConfig,
    #[serde(default="source_default")]
    pub source: SourceConfig,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to find the config on config/m2m.yaml or m2m.yaml")]
    NotFound,
    #[error("Unable to read config file {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("Unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
}

const CONFIG_LOCATIONS: [&str; 2] = ["config/m2m.yaml", "m2m.yaml"];

impl Config {
    /// Loads the config from an explicit path or the first default location that exists
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => p.to_path_buf(),
            None => Self::find_default().ok_or(ConfigError::NotFound)?,
        };

        info!("Loading config from {}", file.display());
        let contents = fs::read_to_string(&file)
            .map_err(|e| ConfigError::Io(file.display().to_string(), e))?;
        return Self::from_yaml(&contents);
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let c: Config = serde_yml::from_str(contents)?;
        debug!("Config loaded for meter {} ({})", c.meter.name, c.meter.id);
        return Ok(c);
    }

    fn find_default() -> Option<PathBuf> {
        CONFIG_LOCATIONS.iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }
}
