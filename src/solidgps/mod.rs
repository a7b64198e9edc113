//! Poll a SolidGPS tracker and keep its latest position.
//!
//! One coordinator per configured tracker. The coordinator owns the
//! credentials, polls on a fixed hourly cadence with at most one fetch in
//! flight, and feeds the resulting entity state into a stateful pipe. A
//! rejected credential suspends polling until a `replace_credentials`
//! command arrives over MQTT.
pub mod api;

use serde::Deserialize;
use tokio::select;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::pipes::{stateful, stateless};
use crate::services::mqtt::MqttMessage;
use crate::services::persistent_state::PersistentStateRow;
use crate::spawn;

use api::{Api, Credentials, Error, LocationClient, LocationRecord};

/// Fixed polling cadence.
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The configuration of a single tracker.
#[derive(Deserialize, Clone)]
pub struct Config {
    /// Hardware identifier of the tracker.
    pub imei: String,

    /// Vendor-issued authentication code.
    pub auth_code: String,

    /// Vendor-issued tracking code.
    pub tracking_code: String,

    /// Optional display name for the device.
    pub name: Option<String>,
}

impl Config {
    /// The display name for the device, derived from the IMEI when not
    /// configured.
    #[must_use]
    pub fn device_name(&self) -> String {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map_or_else(
                || {
                    let start = self.imei.len().saturating_sub(4);
                    format!("SolidGPS {}", &self.imei[start..])
                },
                ToString::to_string,
            )
    }

    fn credentials(&self) -> Credentials {
        Credentials {
            imei: self.imei.clone(),
            auth_code: self.auth_code.clone(),
            tracking_code: self.tracking_code.clone(),
        }
    }
}

/// The command topic for a tracker.
#[must_use]
pub fn command_topic(imei: &str) -> String {
    format!("solidgps/{imei}/command")
}

/// Commands accepted on the command topic.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Command {
    /// Replace the rotated half of the credentials after a reauth.
    ReplaceCredentials {
        auth_code: String,
        tracking_code: String,
    },
}

/// Scheduler state of a coordinator.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PollState {
    /// Waiting for the next tick.
    Idle,

    /// A fetch is outstanding.
    Polling,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// A new position was accepted.
    Updated(LocationRecord),

    /// Nothing changed; either the vendor reported the same position or a
    /// transient failure left the previous position in place.
    Unchanged,

    /// The credentials were rejected; polling is suspended.
    ReauthRequired,

    /// The tick was skipped, either because a fetch was still outstanding
    /// or because a reauthentication is pending.
    Skipped,
}

/// What the device-tracker entity should currently show.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    /// False while a reauthentication is pending.
    pub available: bool,

    /// The last known good position, if any.
    pub record: Option<LocationRecord>,
}

/// Polls the vendor API for one tracker and remembers the latest position.
pub struct Coordinator<C> {
    client: C,
    credentials: Credentials,
    state: PollState,
    reauth_pending: bool,
    last: Option<LocationRecord>,
}

impl<C: LocationClient> Coordinator<C> {
    /// Create a new coordinator.
    pub const fn new(client: C, credentials: Credentials) -> Self {
        Self {
            client,
            credentials,
            state: PollState::Idle,
            reauth_pending: false,
            last: None,
        }
    }

    fn imei(&self) -> &str {
        &self.credentials.imei
    }

    /// Run one poll cycle.
    pub async fn tick(&mut self) -> TickOutcome {
        if self.state == PollState::Polling {
            debug!("{}: previous fetch still outstanding, skipping tick", self.imei());
            return TickOutcome::Skipped;
        }
        if self.reauth_pending {
            debug!("{}: waiting for new credentials, skipping tick", self.imei());
            return TickOutcome::Skipped;
        }

        self.state = PollState::Polling;
        let result = self.client.fetch(&self.credentials).await;
        self.state = PollState::Idle;

        match result {
            Ok(record) => self.accept(record),
            Err(Error::Auth(err)) => {
                warn!("{}: credentials rejected, reauthentication required: {err}", self.imei());
                self.reauth_pending = true;
                TickOutcome::ReauthRequired
            }
            Err(err) => {
                error!("{}: poll failed, keeping last known position: {err}", self.imei());
                TickOutcome::Unchanged
            }
        }
    }

    /// Validate a new auth/tracking code pair and replace the stored
    /// credentials if the vendor accepts them.
    ///
    /// # Errors
    ///
    /// Returns the fetch error when the validation poll fails; the old
    /// credentials stay in place in that case.
    pub async fn replace_credentials(
        &mut self,
        auth_code: String,
        tracking_code: String,
    ) -> Result<TickOutcome, Error> {
        let candidate = Credentials {
            imei: self.credentials.imei.clone(),
            auth_code,
            tracking_code,
        };

        let record = self.client.fetch(&candidate).await?;
        self.credentials = candidate;
        self.reauth_pending = false;
        Ok(self.accept(record))
    }

    fn accept(&mut self, record: LocationRecord) -> TickOutcome {
        if self.last.as_ref() == Some(&record) {
            TickOutcome::Unchanged
        } else {
            self.last = Some(record.clone());
            TickOutcome::Updated(record)
        }
    }

    /// The credentials currently in use.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Is a reauthentication pending?
    #[must_use]
    pub const fn reauth_pending(&self) -> bool {
        self.reauth_pending
    }

    /// The state the device-tracker entity should currently show.
    #[must_use]
    pub fn entity_state(&self) -> EntityState {
        EntityState {
            available: !self.reauth_pending,
            record: self.last.clone(),
        }
    }
}

/// Run the coordinator for one tracker.
///
/// Returns a stateful receiver of entity states; duplicates are
/// suppressed by the pipe, so republishing an identical position is a
/// no-op downstream.
#[must_use]
pub fn run(
    config: Config,
    store: PersistentStateRow<Credentials>,
    command_rx: stateless::Receiver<MqttMessage>,
) -> stateful::Receiver<EntityState> {
    let (tx, rx) = stateful::create_pipe(format!("solidgps_{}", config.imei));

    spawn(async move {
        // Credentials rotated in a previous run take precedence over the
        // config file, as long as they belong to the same tracker.
        let credentials = store
            .load()
            .ok()
            .filter(|stored: &Credentials| stored.imei == config.imei)
            .unwrap_or_else(|| config.credentials());

        let mut coordinator = Coordinator::new(Api::new(), credentials);
        let mut commands = command_rx.subscribe();

        // The first tick fires immediately and doubles as the startup
        // credential validation.
        let mut interval = interval(UPDATE_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = interval.tick() => {
                    let outcome = coordinator.tick().await;
                    match &outcome {
                        TickOutcome::Updated(record) => {
                            info!("{}: position updated: {record:?}", config.imei);
                        }
                        TickOutcome::Unchanged => {
                            debug!("{}: position unchanged", config.imei);
                        }
                        TickOutcome::ReauthRequired | TickOutcome::Skipped => {}
                    }
                    tx.try_send(coordinator.entity_state());
                }
                command = commands.recv() => {
                    match command {
                        Ok(msg) => {
                            handle_command(&mut coordinator, &store, &msg).await;
                            tx.try_send(coordinator.entity_state());
                        }
                        Err(err) => {
                            debug!("{}: command pipe closed: {err}", config.imei);
                            break;
                        }
                    }
                }
            }
        }
    });

    rx
}

async fn handle_command<C: LocationClient>(
    coordinator: &mut Coordinator<C>,
    store: &PersistentStateRow<Credentials>,
    msg: &MqttMessage,
) {
    let imei = coordinator.imei().to_string();

    let command: Command = match serde_json::from_str(&msg.payload) {
        Ok(command) => command,
        Err(err) => {
            error!("{imei}: invalid command on {}: {err}", msg.topic);
            return;
        }
    };

    match command {
        Command::ReplaceCredentials {
            auth_code,
            tracking_code,
        } => match coordinator.replace_credentials(auth_code, tracking_code).await {
            Ok(_outcome) => {
                info!("{imei}: credentials replaced");
                if let Err(err) = store.save(coordinator.credentials()) {
                    error!("{imei}: failed to persist credentials: {err}");
                }
            }
            Err(Error::Auth(err)) => {
                error!("{imei}: new credentials rejected: {err}");
            }
            Err(err) => {
                error!("{imei}: could not validate new credentials: {err}");
            }
        },
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use chrono::DateTime;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<LocationRecord, Error>>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<LocationRecord, Error>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait::async_trait]
    impl LocationClient for ScriptedClient {
        async fn fetch(&self, _credentials: &Credentials) -> Result<LocationRecord, Error> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Data("script exhausted".to_string())))
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            imei: "123456789012345".to_string(),
            auth_code: "auth".to_string(),
            tracking_code: "track".to_string(),
        }
    }

    fn record(latitude: f64) -> LocationRecord {
        LocationRecord {
            latitude,
            longitude: -74.0,
            speed: 0.0,
            course: None,
            gps_quality: Some("Great".to_string()),
            source: api::LocationSource::Gps,
            last_gps_update: DateTime::from_timestamp(1_700_000_000, 0),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_updated_then_unchanged() {
        let client = ScriptedClient::new(vec![Ok(record(40.7)), Ok(record(40.7))]);
        let mut coordinator = Coordinator::new(client, credentials());

        assert_eq!(coordinator.tick().await, TickOutcome::Updated(record(40.7)));
        assert_eq!(coordinator.tick().await, TickOutcome::Unchanged);

        let state = coordinator.entity_state();
        assert!(state.available);
        assert_eq!(state.record, Some(record(40.7)));
    }

    #[test_log::test(tokio::test)]
    async fn test_transient_failure_keeps_last_position() {
        let client = ScriptedClient::new(vec![
            Ok(record(40.7)),
            Err(Error::Data("no GPS or cell data".to_string())),
            Err(Error::Vendor(500)),
        ]);
        let mut coordinator = Coordinator::new(client, credentials());

        assert!(matches!(coordinator.tick().await, TickOutcome::Updated(_)));
        assert_eq!(coordinator.tick().await, TickOutcome::Unchanged);
        assert_eq!(coordinator.tick().await, TickOutcome::Unchanged);

        let state = coordinator.entity_state();
        assert!(state.available);
        assert_eq!(state.record, Some(record(40.7)));
    }

    #[test_log::test(tokio::test)]
    async fn test_auth_failure_suspends_polling() {
        let client = ScriptedClient::new(vec![
            Ok(record(40.7)),
            Err(Error::Auth("vendor status 401".to_string())),
            // Never reached: ticks are skipped while reauth is pending.
            Ok(record(50.0)),
        ]);
        let mut coordinator = Coordinator::new(client, credentials());

        assert!(matches!(coordinator.tick().await, TickOutcome::Updated(_)));
        assert_eq!(coordinator.tick().await, TickOutcome::ReauthRequired);
        assert!(coordinator.reauth_pending());

        let state = coordinator.entity_state();
        assert!(!state.available);
        assert_eq!(state.record, Some(record(40.7)));

        assert_eq!(coordinator.tick().await, TickOutcome::Skipped);
    }

    #[test_log::test(tokio::test)]
    async fn test_overlapping_tick_is_skipped() {
        let client = ScriptedClient::new(vec![]);
        let mut coordinator = Coordinator::new(client, credentials());

        coordinator.state = PollState::Polling;
        assert_eq!(coordinator.tick().await, TickOutcome::Skipped);
    }

    #[test_log::test(tokio::test)]
    async fn test_replace_credentials() {
        let client = ScriptedClient::new(vec![
            Err(Error::Auth("vendor status 401".to_string())),
            Ok(record(40.7)),
        ]);
        let mut coordinator = Coordinator::new(client, credentials());

        assert_eq!(coordinator.tick().await, TickOutcome::ReauthRequired);

        let outcome = coordinator
            .replace_credentials("new-auth".to_string(), "new-track".to_string())
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Updated(record(40.7)));
        assert!(!coordinator.reauth_pending());
        assert_eq!(coordinator.credentials().auth_code, "new-auth");
        assert_eq!(coordinator.credentials().tracking_code, "new-track");
        assert!(coordinator.entity_state().available);
    }

    #[test_log::test(tokio::test)]
    async fn test_replace_credentials_rejected() {
        let client = ScriptedClient::new(vec![
            Err(Error::Auth("vendor status 401".to_string())),
            Err(Error::Auth("still wrong".to_string())),
        ]);
        let mut coordinator = Coordinator::new(client, credentials());

        assert_eq!(coordinator.tick().await, TickOutcome::ReauthRequired);

        let result = coordinator
            .replace_credentials("bad".to_string(), "bad".to_string())
            .await;
        assert!(matches!(result, Err(Error::Auth(_))));
        assert!(coordinator.reauth_pending());
        assert_eq!(coordinator.credentials().auth_code, "auth");
    }

    #[test]
    fn test_device_name() {
        let config = Config {
            imei: "123456789012345".to_string(),
            auth_code: String::new(),
            tracking_code: String::new(),
            name: None,
        };
        assert_eq!(config.device_name(), "SolidGPS 2345");

        let config = Config {
            name: Some("Van".to_string()),
            ..config
        };
        assert_eq!(config.device_name(), "Van");

        let config = Config {
            name: Some("   ".to_string()),
            ..config
        };
        assert_eq!(config.device_name(), "SolidGPS 2345");
    }

    #[test]
    fn test_command_topic() {
        assert_eq!(command_topic("42"), "solidgps/42/command");
    }

    #[test]
    fn test_parse_replace_credentials_command() {
        let payload = r#"{"type": "replace_credentials", "auth_code": "a", "tracking_code": "t"}"#;
        let command: Command = serde_json::from_str(payload).unwrap();
        let Command::ReplaceCredentials {
            auth_code,
            tracking_code,
        } = command;
        assert_eq!(auth_code, "a");
        assert_eq!(tracking_code, "t");
    }
}
