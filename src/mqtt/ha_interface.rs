use log::{info, warn};
use serde::Serialize;
use tokio::sync::mpsc::Sender;

use crate::config::MeterConfig;
use crate::mqtt::{data_topic, send_transmission, PublishData, Transmission};

/// Every metric the decoder produces, in the order discovery is announced
pub const SENSOR_KEYS: [&str; 10] = [
    "Fwd_kWh",
    "Rev_kWh",
    "fwd_Now",
    "rev_Now",
    "L1_A",
    "L1_V",
    "L2_A",
    "L2_V",
    "L3_A",
    "L3_V",
];

#[derive(Debug, Clone, PartialEq)]
pub struct SensorMetadata {
    pub key: &'static str,
    pub icon: &'static str,
    pub name: &'static str,
    pub unit: &'static str,
    pub state_class: &'static str,
    pub device_class: Option<&'static str>,
}

const fn sensor(
    key: &'static str,
    icon: &'static str,
    name: &'static str,
    unit: &'static str,
    state_class: &'static str,
    device_class: Option<&'static str>,
) -> SensorMetadata {
    SensorMetadata { key, icon, name, unit, state_class, device_class }
}

static SENSORS: [SensorMetadata; 10] = [
    sensor("Fwd_kWh", "mdi:transmission-tower-import", "Energy Import", "kWh", "total_increasing", Some("energy")),
    sensor("Rev_kWh", "mdi:transmission-tower-export", "Energy Export", "kWh", "total_increasing", Some("energy")),
    sensor("fwd_Now", "mdi:meter-electric-outline", "Power Import", "W", "measurement", Some("power")),
    sensor("rev_Now", "mdi:meter-electric", "Power Export", "W", "measurement", Some("power")),
    sensor("L1_A", "mdi:alpha-a-circle", "Phase 1 Amperage", "A", "measurement", None),
    sensor("L1_V", "mdi:alpha-v-circle", "Phase 1 Voltage", "V", "measurement", Some("voltage")),
    sensor("L2_A", "mdi:alpha-a-circle", "Phase 2 Amperage", "A", "measurement", None),
    sensor("L2_V", "mdi:alpha-v-circle", "Phase 2 Voltage", "V", "measurement", Some("voltage")),
    sensor("L3_A", "mdi:alpha-a-circle", "Phase 3 Amperage", "A", "measurement", None),
    sensor("L3_V", "mdi:alpha-v-circle", "Phase 3 Voltage", "V", "measurement", Some("voltage")),
];

pub fn lookup_sensor(key: &str) -> Option<&'static SensorMetadata> {
    SENSORS.iter().find(|s| s.key == key)
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct HaDevice {
    pub identifiers: Vec<String>,
    pub manufacturer: String,
    pub model: String,
    pub name: String,
}

impl HaDevice {
    pub fn from_meter(meter: &MeterConfig) -> Self {
        HaDevice {
            identifiers: vec![meter.id.clone()],
            manufacturer: meter.manufacturer.clone(),
            model: meter.model.clone(),
            name: meter.device_name.clone(),
        }
    }
}

/// Home Assistant MQTT discovery payload of one sensor
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct HaSensorConfig {
    pub device: HaDevice,
    pub name: String,
    pub unit_of_measurement: String,
    pub state_topic: String,
    pub unique_id: String,
    pub state_class: String,
    pub icon: String,
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
}

impl HaSensorConfig {
    pub fn new(device: &HaDevice, meter: &MeterConfig, sensor: &SensorMetadata) -> Self {
        HaSensorConfig {
            device: device.clone(),
            name: sensor.name.to_string(),
            unit_of_measurement: sensor.unit.to_string(),
            state_topic: data_topic(meter, sensor.key),
            unique_id: format!("{}_{}", meter.id, sensor.key),
            state_class: sensor.state_class.to_string(),
            icon: sensor.icon.to_string(),
            platform: "mqtt".to_string(),
            device_class: sensor.device_class.map(|d| d.to_string()),
        }
    }
}

pub fn discovery_topic(meter: &MeterConfig, key: &str) -> String {
    format!("homeassistant/sensor/{}_{}/config", meter.name, key)
}

pub struct DiscoveryPublisher {
    sender: Sender<Transmission>,
    meter: MeterConfig,
    device: HaDevice,
}

impl DiscoveryPublisher {
    pub fn new(sender: Sender<Transmission>, meter: &MeterConfig) -> Self {
        Self {
            sender,
            meter: meter.clone(),
            device: HaDevice::from_meter(meter),
        }
    }

    /// Topic and JSON payload announcing `key`, None if the catalog does not know it
    pub fn build(&self, key: &str) -> Option<PublishData> {
        let sensor = match lookup_sensor(key) {
            Some(s) => s,
            None => {
                warn!("No config found for {}", key);
                return None;
            }
        };

        let config = HaSensorConfig::new(&self.device, &self.meter, sensor);
        let payload = match serde_json::to_string(&config) {
            Ok(p) => p,
            Err(e) => {
                warn!("Unable to serialize discovery config for {}: {}", key, e);
                return None;
            }
        };

        Some(PublishData {
            topic: discovery_topic(&self.meter, key),
            payload,
            qos: 0,
            retain: true,
        })
    }

    /// Announces every key it can, returns how many configs were queued
    pub fn publish_all(&self, keys: &[&str]) -> usize {
        let mut published = 0;
        for key in keys {
            let data = match self.build(key) {
                Some(d) => d,
                None => continue,
            };

            let topic = data.topic.clone();
            match send_transmission(&self.sender, Transmission::AutoDiscovery(data)) {
                Ok(_) => {
                    info!("Initial configuration published for {}", topic);
                    published += 1;
                }
                Err(e) => {
                    warn!("Discovery config for {} not published: {}", key, e);
                }
            }
        }
        published
    }
}
