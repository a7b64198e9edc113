//! Main entry point for the application.
#![warn(missing_docs)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use anyhow::Result;
use solidgps_bridge::services::mqtt::{mqtt_channel, run_client, Subscriptions};
use solidgps_bridge::services::persistent_state::PersistentStateDatabase;
use solidgps_bridge::{config, ha, logging, solidgps};
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    color_backtrace::install();

    let env = config::Environment::load()?;
    let config = env.config()?;

    let (mqtt, mqtt_rx) = mqtt_channel();
    let mut subscriptions = Subscriptions::new();
    let state_db = PersistentStateDatabase::new(&config.state_path)?;

    info!("Starting bridge for {} tracker(s)", config.trackers.len());

    for tracker in &config.trackers {
        let store = state_db.for_name(&tracker.imei);
        let command_rx = subscriptions.subscribe(solidgps::command_topic(&tracker.imei));
        let entity_rx = solidgps::run(tracker.clone(), store, command_rx);
        ha::run(mqtt.clone(), &config.homeassistant, tracker, entity_rx);
    }

    run_client(subscriptions, mqtt_rx, config.mqtt);

    loop {
        debug!("I haven't crashed yet!");
        tokio::time::sleep(std::time::Duration::from_secs(300)).await;
    }
}
