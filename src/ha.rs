//! Map tracker state onto Home Assistant MQTT entities.
//!
//! Publishes retained MQTT discovery configs for a GPS device tracker and
//! a moving binary sensor, then mirrors every entity-state change onto
//! the attribute, availability and moving topics. Home Assistant derives
//! home/away/zone from the published coordinates; no zone matching
//! happens here.
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::pipes::stateful;
use crate::services::mqtt::{MqttMessage, MqttTx, QoS};
use crate::solidgps::api::LocationRecord;
use crate::solidgps::{self, EntityState};
use crate::spawn;

/// Home Assistant specific configuration.
#[derive(Deserialize, Clone)]
pub struct Config {
    /// The MQTT discovery prefix Home Assistant listens on.
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_prefix: default_discovery_prefix(),
        }
    }
}

struct Topics {
    discovery_prefix: String,
    base: String,
    tracker_config: String,
    moving_config: String,
    state: String,
    attributes: String,
    availability: String,
    moving: String,
    motion_event: String,
}

impl Topics {
    fn new(config: &Config, imei: &str) -> Self {
        let prefix = &config.discovery_prefix;
        let base = format!("solidgps/{imei}");
        Self {
            discovery_prefix: prefix.clone(),
            tracker_config: format!("{prefix}/device_tracker/solidgps_{imei}/config"),
            moving_config: format!("{prefix}/binary_sensor/solidgps_{imei}_moving/config"),
            state: format!("{base}/state"),
            attributes: format!("{base}/attributes"),
            availability: format!("{base}/availability"),
            moving: format!("{base}/moving"),
            motion_event: format!("{base}/event/motion"),
            base,
        }
    }

    fn sensor_config(&self, imei: &str, key: &str) -> String {
        format!(
            "{}/sensor/solidgps_{imei}_{key}/config",
            self.discovery_prefix
        )
    }

    fn sensor_state(&self, key: &str) -> String {
        format!("{}/{key}", self.base)
    }
}

#[derive(Serialize)]
struct Device<'a> {
    identifiers: [String; 1],
    name: &'a str,
    manufacturer: &'static str,
    model: &'static str,
}

impl<'a> Device<'a> {
    fn new(imei: &str, name: &'a str) -> Self {
        Self {
            identifiers: [format!("solidgps_{imei}")],
            name,
            manufacturer: "SolidGPS",
            model: "GPS Tracker",
        }
    }
}

#[derive(Serialize)]
struct TrackerDiscovery<'a> {
    name: Option<&'a str>,
    unique_id: String,
    state_topic: &'a str,
    json_attributes_topic: &'a str,
    availability_topic: &'a str,
    payload_available: &'static str,
    payload_not_available: &'static str,
    source_type: &'static str,
    device: Device<'a>,
}

#[derive(Serialize)]
struct MovingDiscovery<'a> {
    name: &'static str,
    unique_id: String,
    state_topic: &'a str,
    device_class: &'static str,
    availability_topic: &'a str,
    payload_available: &'static str,
    payload_not_available: &'static str,
    device: Device<'a>,
}

#[derive(Serialize)]
struct SensorDiscovery<'a> {
    name: &'static str,
    unique_id: String,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'static str>,
    availability_topic: &'a str,
    payload_available: &'static str,
    payload_not_available: &'static str,
    device: Device<'a>,
}

/// A plain sensor derived from the location record.
struct SensorDescription {
    key: &'static str,
    name: &'static str,
    device_class: Option<&'static str>,
    unit_of_measurement: Option<&'static str>,
    state_class: Option<&'static str>,
    value: fn(&LocationRecord) -> Option<String>,
}

const SENSORS: [SensorDescription; 2] = [
    SensorDescription {
        key: "speed",
        name: "Speed",
        device_class: Some("speed"),
        unit_of_measurement: Some("km/h"),
        state_class: Some("measurement"),
        value: |record| Some(record.speed.to_string()),
    },
    SensorDescription {
        key: "gps_quality",
        name: "GPS quality",
        device_class: None,
        unit_of_measurement: None,
        state_class: None,
        value: |record| record.gps_quality.clone(),
    },
];

#[derive(Serialize)]
struct TrackerAttributes<'a> {
    latitude: f64,
    longitude: f64,
    gps_accuracy: u32,
    speed: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    course: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gps_quality: Option<&'a str>,
    location_source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_gps_update: Option<String>,
}

impl<'a> TrackerAttributes<'a> {
    fn new(record: &'a LocationRecord) -> Self {
        Self {
            latitude: record.latitude,
            longitude: record.longitude,
            gps_accuracy: 0,
            speed: record.speed,
            course: record.course,
            gps_quality: record.gps_quality.as_deref(),
            location_source: record.source.as_str(),
            last_gps_update: record
                .last_gps_update
                .map(|utc| utc.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }
}

#[derive(Serialize)]
struct MotionEvent<'a> {
    event: &'static str,
    imei: &'a str,
}

const AVAILABLE: &str = "online";
const NOT_AVAILABLE: &str = "offline";

fn discovery_messages(topics: &Topics, imei: &str, device_name: &str) -> Vec<MqttMessage> {
    let tracker = TrackerDiscovery {
        // A null name makes this the main entity of the device.
        name: None,
        unique_id: format!("solidgps_{imei}"),
        state_topic: &topics.state,
        json_attributes_topic: &topics.attributes,
        availability_topic: &topics.availability,
        payload_available: AVAILABLE,
        payload_not_available: NOT_AVAILABLE,
        source_type: "gps",
        device: Device::new(imei, device_name),
    };

    let moving = MovingDiscovery {
        name: "Moving",
        unique_id: format!("solidgps_{imei}_moving"),
        state_topic: &topics.moving,
        device_class: "moving",
        availability_topic: &topics.availability,
        payload_available: AVAILABLE,
        payload_not_available: NOT_AVAILABLE,
        device: Device::new(imei, device_name),
    };

    let mut messages = Vec::with_capacity(2 + SENSORS.len());
    match MqttMessage::from_json(&topics.tracker_config, &tracker, true, QoS::AtLeastOnce) {
        Ok(msg) => messages.push(msg),
        Err(err) => error!("{imei}: failed to serialize tracker discovery: {err}"),
    }
    match MqttMessage::from_json(&topics.moving_config, &moving, true, QoS::AtLeastOnce) {
        Ok(msg) => messages.push(msg),
        Err(err) => error!("{imei}: failed to serialize moving discovery: {err}"),
    }

    for sensor in &SENSORS {
        let discovery = SensorDiscovery {
            name: sensor.name,
            unique_id: format!("solidgps_{imei}_{}", sensor.key),
            state_topic: topics.sensor_state(sensor.key),
            device_class: sensor.device_class,
            unit_of_measurement: sensor.unit_of_measurement,
            state_class: sensor.state_class,
            availability_topic: &topics.availability,
            payload_available: AVAILABLE,
            payload_not_available: NOT_AVAILABLE,
            device: Device::new(imei, device_name),
        };
        let topic = topics.sensor_config(imei, sensor.key);
        match MqttMessage::from_json(topic, &discovery, true, QoS::AtLeastOnce) {
            Ok(msg) => messages.push(msg),
            Err(err) => error!("{imei}: failed to serialize {} discovery: {err}", sensor.key),
        }
    }

    messages
}

fn state_messages(topics: &Topics, imei: &str, state: &EntityState) -> Vec<MqttMessage> {
    let mut messages = Vec::new();

    let availability = if state.available { AVAILABLE } else { NOT_AVAILABLE };
    messages.push(MqttMessage::new(
        &topics.availability,
        availability,
        true,
        QoS::AtLeastOnce,
    ));

    if let Some(record) = &state.record {
        match MqttMessage::from_json(
            &topics.attributes,
            &TrackerAttributes::new(record),
            true,
            QoS::AtLeastOnce,
        ) {
            Ok(msg) => messages.push(msg),
            Err(err) => error!("{imei}: failed to serialize attributes: {err}"),
        }

        let moving = if record.is_moving() { "ON" } else { "OFF" };
        messages.push(MqttMessage::new(
            &topics.moving,
            moving,
            true,
            QoS::AtLeastOnce,
        ));

        for sensor in &SENSORS {
            if let Some(value) = (sensor.value)(record) {
                messages.push(MqttMessage::new(
                    topics.sensor_state(sensor.key),
                    value,
                    true,
                    QoS::AtLeastOnce,
                ));
            }
        }
    }

    messages
}

fn motion_event_message(
    topics: &Topics,
    imei: &str,
    was_moving: Option<bool>,
    moving: bool,
) -> Option<MqttMessage> {
    let transition = was_moving.is_some_and(|was| was != moving);
    if !transition {
        return None;
    }

    let event = MotionEvent {
        event: if moving {
            "motion_started"
        } else {
            "motion_stopped"
        },
        imei,
    };

    match MqttMessage::from_json(&topics.motion_event, &event, false, QoS::ExactlyOnce) {
        Ok(msg) => Some(msg),
        Err(err) => {
            error!("{imei}: failed to serialize motion event: {err}");
            None
        }
    }
}

/// Publish the entities for one tracker and keep them up to date.
pub fn run(
    mqtt: MqttTx,
    config: &Config,
    tracker: &solidgps::Config,
    rx: stateful::Receiver<EntityState>,
) {
    let imei = tracker.imei.clone();
    let device_name = tracker.device_name();
    let topics = Topics::new(config, &imei);

    for msg in discovery_messages(&topics, &imei, &device_name) {
        mqtt.try_send(msg);
    }

    spawn(async move {
        let mut sub = rx.subscribe().await;
        let mut was_moving: Option<bool> = None;

        while let Ok(state) = sub.recv().await {
            debug!("{imei}: publishing entity state: {state:?}");

            for msg in state_messages(&topics, &imei, &state) {
                mqtt.try_send(msg);
            }

            if let Some(record) = &state.record {
                let moving = record.is_moving();
                if let Some(msg) = motion_event_message(&topics, &imei, was_moving, moving) {
                    mqtt.try_send(msg);
                }
                was_moving = Some(moving);
            }
        }
    });
}
