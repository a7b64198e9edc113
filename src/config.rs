//! Configuration for the bridge.
use envconfig::Envconfig;
use serde::Deserialize;
use serde_yml::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::services::mqtt;
use crate::{ha, solidgps};

/// The environment variables the bridge reads at startup.
#[derive(Envconfig)]
pub struct Environment {
    /// Path to the YAML config file.
    #[envconfig(from = "CONFIG_FILE")]
    pub config_file: PathBuf,

    /// Optional YAML file overlaying secrets onto the config.
    #[envconfig(from = "SECRETS_FILE")]
    pub secrets_file: Option<PathBuf>,
}

impl Environment {
    /// Load the environment from the environment variables.
    ///
    /// # Errors
    ///
    /// If a required environment variable is not set.
    pub fn load() -> Result<Self, envconfig::Error> {
        Self::init_from_env()
    }

    /// Load the config file, overlaying the secrets file when present.
    ///
    /// # Errors
    ///
    /// If either file cannot be read or parsed, or the overlay does not
    /// line up with the config.
    pub fn config(&self) -> Result<Config, Error> {
        let config = load_file(&self.config_file)?;

        let config = if let Some(secrets_file) = &self.secrets_file {
            let secrets = load_file(secrets_file)?;
            overlay_values(config, secrets)?
        } else {
            config
        };

        let config: Config = serde_yml::from_value(config)
            .map_err(|e| Error::Yaml(self.config_file.clone(), e))?;

        Ok(config)
    }
}

/// The bridge configuration.
#[derive(Deserialize)]
pub struct Config {
    /// MQTT broker settings.
    pub mqtt: mqtt::Config,

    /// Directory that holds rotated credentials.
    pub state_path: PathBuf,

    /// Home Assistant settings.
    #[serde(default)]
    pub homeassistant: ha::Config,

    /// The trackers to poll.
    pub trackers: Vec<solidgps::Config>,
}

/// An error loading the Config
#[derive(Error, Debug)]
pub enum Error {
    /// Error reading the file
    #[error("Error reading file {0}: {1}")]
    File(PathBuf, std::io::Error),

    /// Error parsing the file
    #[error("Error parsing file {0}: {1}")]
    Yaml(PathBuf, serde_yml::Error),

    /// The secrets file does not line up with the config file.
    #[error("Cannot overlay {1} onto {0}")]
    Overlay(&'static str, &'static str),
}

fn load_file(filename: &Path) -> Result<Value, Error> {
    let f = std::fs::File::open(filename).map_err(|e| Error::File(filename.to_path_buf(), e))?;
    let config: Value =
        serde_yml::from_reader(f).map_err(|e| Error::Yaml(filename.to_path_buf(), e))?;

    Ok(config)
}

/// Overlay `secrets` onto `base`. Mappings merge recursively, everything
/// else is replaced by the overlay when the types line up.
fn overlay_values(base: Value, overlay: Value) -> Result<Value, Error> {
    let merged = match (base, overlay) {
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                let existing = base.remove(key.clone()).unwrap_or(Value::Null);
                base.insert(key, overlay_values(existing, value)?);
            }
            Value::Mapping(base)
        }
        (Value::Null, overlay) => overlay,
        (base, Value::Null) => base,
        (base, overlay) => {
            if value_kind(&base) != value_kind(&overlay) {
                return Err(Error::Overlay(value_kind(&base), value_kind(&overlay)));
            }
            overlay
        }
    };

    Ok(merged)
}

const fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged",
    }
}
