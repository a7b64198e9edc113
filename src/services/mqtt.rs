//! Sink (and source) for MQTT data.
use rumqttc::tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use rumqttc::v5::mqttbytes::v5::{Filter, Packet, Publish};
use rumqttc::v5::{AsyncClient, Event, Incoming, MqttOptions};
use rumqttc::{Outgoing, Transport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str;
use std::str::Utf8Error;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error};

use crate::pipes::stateless;
use crate::spawn;

const NUMBER_OF_STARTUP_MESSAGES: usize = 100;
const NUMBER_OF_STARTUP_SUBSCRIPTIONS: usize = 100;

/// The `QoS` level for a MQTT message.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum QoS {
    /// At most once
    AtMostOnce,

    /// At least once
    AtLeastOnce,

    /// Exactly once
    ExactlyOnce,
}

const fn qos_to_rumqttc(qos: QoS) -> rumqttc::v5::mqttbytes::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
    }
}

const fn qos_from_rumqttc(qos: rumqttc::v5::mqttbytes::QoS) -> QoS {
    match qos {
        rumqttc::v5::mqttbytes::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::v5::mqttbytes::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::v5::mqttbytes::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// A MQTT message.
#[derive(Clone, Debug)]
pub struct MqttMessage {
    /// MQTT topic the message belongs to.
    pub topic: String,

    /// The message payload.
    pub payload: String,

    /// Was/Is this message retained?
    pub retain: bool,

    /// What is the `QoS` of this message?
    pub qos: QoS,
}

impl MqttMessage {
    /// Create a new message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<String>, retain: bool, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
            qos,
        }
    }

    /// Create a new message from a JSON payload.
    ///
    /// # Errors
    ///
    /// This function will fail if the payload cannot be serialized to JSON.
    pub fn from_json<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
        retain: bool,
        qos: QoS,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_string(payload)?;
        Ok(Self::new(topic, payload, retain, qos))
    }
}

fn publish_to_mqtt_message(msg: &Publish) -> Result<MqttMessage, Utf8Error> {
    let topic = str::from_utf8(&msg.topic)?.to_string();
    let payload = str::from_utf8(&msg.payload)?.to_string();
    Ok(MqttMessage {
        topic,
        payload,
        retain: msg.retain,
        qos: qos_from_rumqttc(msg.qos),
    })
}

/// Struct used to send outgoing MQTT messages.
#[derive(Clone)]
pub struct MqttTx(mpsc::Sender<MqttMessage>);

impl MqttTx {
    /// Send a message to the MQTT broker.
    pub fn try_send(&self, msg: MqttMessage) {
        let _ = self
            .0
            .try_send(msg)
            .map_err(|e| error!("MQTT send error: {e}"));
    }
}

/// Receiving half of the outgoing MQTT queue, consumed by [`run_client`].
pub struct MqttRx {
    rx: mpsc::Receiver<MqttMessage>,
}

/// Create the outgoing MQTT queue.
#[must_use]
pub fn mqtt_channel() -> (MqttTx, MqttRx) {
    let (tx, rx) = mpsc::channel(NUMBER_OF_STARTUP_MESSAGES);
    (MqttTx(tx), MqttRx { rx })
}

/// Credentials for MQTT
#[derive(Deserialize, Default)]
#[serde(tag = "type")]
pub enum Credentials {
    /// Username and password
    UsernamePassword {
        /// Username
        username: String,

        /// Password
        password: String,
    },

    /// No credentials
    #[default]
    None,
}

/// MQTT configuration
#[derive(Deserialize)]
pub struct Config {
    /// MQTT host
    pub host: String,

    /// MQTT port
    pub port: u16,

    /// MQTT credentials
    #[serde(default)]
    pub credentials: Credentials,
}

struct Subscription {
    tx: stateless::Sender<MqttMessage>,
    rx: stateless::Receiver<MqttMessage>,
}

/// The set of topics the client subscribes to, registered before the
/// client starts.
pub struct Subscriptions(HashMap<String, Subscription>);

impl Subscriptions {
    /// Create a new set of subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Add a subscription and return a receiver for its messages.
    pub fn subscribe(&mut self, topic: impl Into<String>) -> stateless::Receiver<MqttMessage> {
        let topic = topic.into();
        if let Some(subscription) = self.0.get(&topic) {
            return subscription.rx.clone();
        }

        let (tx, rx) = stateless::create_pipe(topic.clone());
        let receiver = rx.clone();
        self.0.insert(topic, Subscription { tx, rx });
        receiver
    }

    fn get(&self, topic: &str) -> Option<&Subscription> {
        self.0.get(topic)
    }
}

impl Default for Subscriptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Connect to the MQTT broker and send/receive messages.
pub fn run_client(subscriptions: Subscriptions, channel: MqttRx, config: Config) {
    let hostname = gethostname::gethostname();
    let hostname = hostname.to_str().unwrap_or("unknown");
    let client_id = format!("solidgps-bridge-{hostname}");

    let root_store = get_root_store();
    let client_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let mut mqtt_options = MqttOptions::new(client_id, config.host, config.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    if config.port == 8883 {
        mqtt_options.set_transport(Transport::tls_with_config(client_config.into()));
    }

    match config.credentials {
        Credentials::UsernamePassword { username, password } => {
            mqtt_options.set_credentials(username, password);
        }
        Credentials::None => {}
    }

    let (client, mut event_loop) = AsyncClient::new(mqtt_options, NUMBER_OF_STARTUP_SUBSCRIPTIONS);

    spawn(async move {
        let mut rx = channel.rx;

        loop {
            select! {
                event = event_loop.poll() => {
                    match event {
                        Ok(Event::Incoming(pkt)) => {
                            incoming_event(&client, pkt, &subscriptions);
                        }
                        Ok(Event::Outgoing(o)) => {
                            if let Outgoing::Publish(p) = o {
                                debug!("Published message: {:?}.", p);
                            }
                        }
                        Err(err) => {
                            error!("MQTT Error: {err:?}");
                            sleep(Duration::from_secs(10)).await;
                        }
                    }
                }
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => {
                            debug!("Outgoing mqtt {} {}.", msg.retain, msg.topic);
                            if let Err(err) = client.try_publish(
                                msg.topic,
                                qos_to_rumqttc(msg.qos),
                                msg.retain,
                                msg.payload.into_bytes(),
                            ) {
                                error!("Failed to publish message: {err:?}.");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });
}

fn get_root_store() -> RootCertStore {
    let mut root_store = rustls::RootCertStore::empty();

    let certs = match rustls_native_certs::load_native_certs() {
        Ok(certs) => certs,
        Err(err) => {
            error!("Failed to load native certs: {err:?}");
            return root_store;
        }
    };

    for cert in certs {
        _ = root_store
            .add(cert)
            .map_err(|err| {
                error!("Failed to add certificate: {err:?}");
            });
    }

    root_store
}

fn incoming_event(client: &AsyncClient, pkt: Packet, subscriptions: &Subscriptions) {
    match pkt {
        Incoming::Publish(p) => match publish_to_mqtt_message(&p) {
            Ok(msg) => {
                if let Some(subscription) = subscriptions.get(&msg.topic) {
                    subscription.tx.try_send(msg);
                }
            }
            Err(err) => error!("Invalid message received: {err}"),
        },
        Incoming::ConnAck(_) => {
            debug!("Resubscribe topics.");
            subscribe_topics(client, subscriptions);
        }
        _ => {}
    }
}

fn topic_to_filter(topic: &str) -> Filter {
    Filter {
        path: topic.to_string(),
        qos: rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
        nolocal: true,
        ..Default::default()
    }
}

fn subscribe_topics(client: &AsyncClient, subscriptions: &Subscriptions) {
    if subscriptions.0.is_empty() {
        return;
    }

    let topics = subscriptions.0.keys().map(|topic| topic_to_filter(topic));

    if let Err(e) = client.try_subscribe_many(topics) {
        error!("Error subscribing to topics: {e:?}");
    }
}
