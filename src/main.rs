use meter2mqtt::{Config, DiscoveryPublisher, FileTableSource, MetricPublisher, MqttManager, PollCycle, TableReader, POLLED_TABLES, SENSOR_KEYS};
use std::{env, path::PathBuf, process::ExitCode, time::Duration};
use log::{error, info};


#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    let default_filter = std::env::var("M2M_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config_path = env::args().nth(1).map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    // The manager owns the broker connection; it disconnects once every sender is dropped
    let (mut mqtt, tx) = MqttManager::new(&config.mqtt);
    let mqtt_task = tokio::spawn(async move {
        mqtt.start_thread().await;
    });

    if config.mqtt.ha_enabled {
        let discovery = DiscoveryPublisher::new(tx.clone(), &config.meter);
        let published = discovery.publish_all(&SENSOR_KEYS);
        info!("Published {} of {} discovery configs", published, SENSOR_KEYS.len());
    }

    let reader = TableReader::new(FileTableSource::new(&config.source.dump_dir), &config.source);
    let publisher = MetricPublisher::new(tx, &config.meter);
    let mut poll = PollCycle::new(reader, publisher, &POLLED_TABLES);

    let interval = Duration::from_secs(config.poll.interval.max(1));
    let poll_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            poll.execute().await;
        }
    });

    info!("Polling every {:?}, now waiting for a signal to exit", interval);
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {}", e);
    }

    // Dropping the poll cycle releases the last sender so the manager can disconnect
    poll_task.abort();
    let _ = poll_task.await;
    if let Err(e) = mqtt_task.await {
        error!("MQTT task ended abnormally: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
