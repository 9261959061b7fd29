pub mod ha_interface;

use std::time::Duration;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;

use crate::config::{MeterConfig, MqttConfig};

/// Capacity of the outbound queue between the producers and the broker client
pub const OUTBOUND_QUEUE_SIZE: usize = 100;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct PublishData {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transmission {
    /// Retained Home Assistant discovery config
    AutoDiscovery(PublishData),
    /// A single metric value
    Publish(PublishData),
}

impl Transmission {
    pub fn data(&self) -> &PublishData {
        match self {
            Transmission::AutoDiscovery(d) => d,
            Transmission::Publish(d) => d,
        }
    }
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Outbound queue is closed")]
    QueueClosed,
    #[error("Outbound queue is full")]
    QueueFull,
    #[error("Broker client refused the message: {0}")]
    Client(#[from] rumqttc::ClientError),
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Hands a message to the broker queue without waiting for room or for the broker
pub fn send_transmission(sender: &Sender<Transmission>, transmission: Transmission) -> Result<(), PublishError> {
    sender.try_send(transmission).map_err(|e| match e {
        TrySendError::Full(_) => PublishError::QueueFull,
        TrySendError::Closed(_) => PublishError::QueueClosed,
    })
}

/// Owns the broker connection.
///
/// The event loop runs in its own task. It is stopped when the manager loop
/// ends or when the manager is dropped, whichever comes first.
pub struct MqttManager {
    rx: Receiver<Transmission>,
    client: AsyncClient,
    eventloop_task: Option<JoinHandle<()>>,
}

impl MqttManager {
    pub fn new(config: &MqttConfig) -> (Self, Sender<Transmission>) {
        let (mtx, mrx) = tokio::sync::mpsc::channel(OUTBOUND_QUEUE_SIZE);

        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive.max(1)));
        if !config.user.is_empty() {
            mqttoptions.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, OUTBOUND_QUEUE_SIZE);
        let eventloop_task = tokio::spawn(run_eventloop(eventloop));

        return (MqttManager {
            rx: mrx,
            client,
            eventloop_task: Some(eventloop_task),
        }, mtx);
    }

    /// Forwards queued messages to the broker until every sender is gone, then disconnects
    pub async fn start_thread(&mut self) {
        while let Some(transmission) = self.rx.recv().await {
            let kind = match transmission {
                Transmission::AutoDiscovery(_) => "discovery config",
                Transmission::Publish(_) => "data",
            };
            let data = transmission.data();

            // Never wait on the client: with the broker down its request queue stays full
            let result = self.client
                .try_publish(data.topic.clone(), qos_from_u8(data.qos), data.retain, data.payload.clone())
                .map_err(PublishError::from);
            match result {
                Err(e) => { error!("Error publishing {} to {}: {}", kind, data.topic, e); },
                Ok(_) => { debug!("Published {} to {}: {}", kind, data.topic, data.payload); }
            }
        }

        debug!("All producers are gone, shutting down MQTT");
        self.shutdown().await;
    }

    /// Sends the disconnect and waits a short while for the event loop to flush it
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("Failed to disconnect MQTT cleanly: {}", e);
        }

        if let Some(mut task) = self.eventloop_task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("MQTT event loop did not stop in time, aborting it");
                task.abort();
            }
            info!("MQTT client disconnected");
        }
    }
}

impl Drop for MqttManager {
    fn drop(&mut self) {
        if let Some(task) = self.eventloop_task.take() {
            task.abort();
        }
    }
}

async fn run_eventloop(mut eventloop: EventLoop) {
    info!("MQTT Eventloop started");
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT client connected");
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent, event loop stops");
                break;
            },
            Ok(_) => {},
            Err(e) => {
                error!("Error in MQTT {:?}, reconnecting in {:?}", e, RECONNECT_DELAY);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Topic the value of `key` is published on
pub fn data_topic(meter: &MeterConfig, key: &str) -> String {
    format!("{}/{}/{}", meter.topic_prefix, meter.name, key)
}

pub struct MetricPublisher {
    sender: Sender<Transmission>,
    meter: MeterConfig,
}

impl MetricPublisher {
    pub fn new(sender: Sender<Transmission>, meter: &MeterConfig) -> Self {
        Self { sender, meter: meter.clone() }
    }

    /// Publishes every value unretained with QoS 0. Returns how many were queued.
    pub fn publish(&self, samples: &Map<String, Value>) -> usize {
        let mut published = 0;
        for (key, value) in samples {
            let data = PublishData {
                topic: data_topic(&self.meter, key),
                payload: value.to_string(),
                qos: 0,
                retain: false,
            };

            let topic = data.topic.clone();
            match send_transmission(&self.sender, Transmission::Publish(data)) {
                Ok(_) => {
                    info!("Data published to {}: {}", topic, value);
                    published += 1;
                }
                Err(e) => {
                    error!("Publishing {} failed: {}", topic, e);
                }
            }
        }
        published
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn meter_config() -> MeterConfig {
        MeterConfig {
            name: "house".to_string(),
            id: "0815".to_string(),
            topic_prefix: "meter2mqtt".to_string(),
            manufacturer: "Networked Electricity Services".to_string(),
            model: "NES-Meter".to_string(),
            device_name: "Electricity Meter".to_string(),
        }
    }

    pub fn drain(rx: &mut Receiver<Transmission>) -> Vec<Transmission> {
        let mut out = Vec::new();
        while let Ok(t) = rx.try_recv() {
            out.push(t);
        }
        out
    }

    #[tokio::test]
    async fn test_manager_releases_connection_when_producers_are_gone() {
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: String::new(),
            pass: String::new(),
            ha_enabled: true,
            client_name: "meter2mqtt-test".to_string(),
            keep_alive: 5,
        };
        let (mut manager, tx) = MqttManager::new(&config);

        let data = PublishData { topic: "t".to_string(), payload: "1".to_string(), qos: 0, retain: false };
        send_transmission(&tx, Transmission::Publish(data)).unwrap();
        drop(tx);

        let done = tokio::time::timeout(Duration::from_secs(10), manager.start_thread()).await;
        assert!(done.is_ok());
        assert!(manager.eventloop_task.is_none());
    }

    #[tokio::test]
    async fn test_manager_releases_connection_with_backlog_and_no_broker() {
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: String::new(),
            pass: String::new(),
            ha_enabled: true,
            client_name: "meter2mqtt-backlog".to_string(),
            keep_alive: 5,
        };
        let (mut manager, tx) = MqttManager::new(&config);

        // More than the queue and the client can hold together while nothing is connected
        let producer = tokio::spawn(async move {
            for i in 0..(3 * OUTBOUND_QUEUE_SIZE) {
                let data = PublishData { topic: format!("t/{}", i), payload: i.to_string(), qos: 0, retain: false };
                let _ = tx.send(Transmission::Publish(data)).await;
            }
        });

        let done = tokio::time::timeout(Duration::from_secs(10), manager.start_thread()).await;
        let _ = producer.await;
        assert!(done.is_ok(), "manager kept the connection after all producers were gone");
        assert!(manager.eventloop_task.is_none());
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_u8(7), QoS::AtMostOnce);
    }

    #[test]
    fn test_data_topic() {
        assert_eq!(data_topic(&meter_config(), "L1_V"), "meter2mqtt/house/L1_V");
    }

    #[test]
    fn test_metric_publisher_queues_unretained() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let publisher = MetricPublisher::new(tx, &meter_config());

        let mut samples = Map::new();
        samples.insert("fwd_Now".to_string(), Value::from(100));
        samples.insert("Fwd_kWh".to_string(), Value::from(1.0));

        assert_eq!(publisher.publish(&samples), 2);

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert!(sent.contains(&Transmission::Publish(PublishData {
            topic: "meter2mqtt/house/fwd_Now".to_string(),
            payload: "100".to_string(),
            qos: 0,
            retain: false,
        })));
        assert!(sent.contains(&Transmission::Publish(PublishData {
            topic: "meter2mqtt/house/Fwd_kWh".to_string(),
            payload: "1.0".to_string(),
            qos: 0,
            retain: false,
        })));
    }

    #[test]
    fn test_metric_publisher_survives_closed_queue() {
        let (tx, rx) = tokio::sync::mpsc::channel(OUTBOUND_QUEUE_SIZE);
        drop(rx);
        let publisher = MetricPublisher::new(tx, &meter_config());

        let mut samples = Map::new();
        samples.insert("L1_A".to_string(), Value::from(5.0));
        samples.insert("L2_A".to_string(), Value::from(6.0));

        assert_eq!(publisher.publish(&samples), 0);
    }

    #[test]
    fn test_full_queue_does_not_block() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let publisher = MetricPublisher::new(tx, &meter_config());

        let mut samples = Map::new();
        samples.insert("L1_V".to_string(), Value::from(230.0));
        samples.insert("L2_V".to_string(), Value::from(231.0));
        samples.insert("L3_V".to_string(), Value::from(229.5));

        assert_eq!(publisher.publish(&samples), 1);
        assert_eq!(drain(&mut rx).len(), 1);
    }
}
