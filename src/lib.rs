//! Bridge SolidGPS vehicle trackers into Home Assistant.
//!
//! Polls the vendor dashboard API once an hour per configured tracker,
//! normalises the reported position and publishes it as a Home Assistant
//! MQTT device tracker (with discovery), including a moving binary sensor
//! and motion events. Credential rotation is handled over MQTT commands.
#![warn(missing_docs)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod ha;
pub mod logging;
pub mod pipes;
pub mod services;
pub mod solidgps;

use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Spawn a task and automatically monitor its execution.
pub fn spawn<T>(future: T) -> JoinHandle<()>
where
    T: Future + Send + 'static,
    T::Output: Send + 'static,
{
    let task = tokio::spawn(future);

    tokio::spawn(async move {
        let rc = task.await;

        match rc {
            Ok(_rc) => {
                debug!("The thread terminated normally");
            }
            Err(err) => {
                error!("The thread aborted with error: {err}");
                std::process::exit(1);
            }
        };
    })
}
