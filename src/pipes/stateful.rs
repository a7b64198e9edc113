//! Stateful pipes remember the current value, deduplicate repeats, and
//! replay the current value to new subscribers.
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, warn};

use super::{RecvError, PIPE_SIZE};
use crate::spawn;

enum ReceiveMessage<T> {
    Get(oneshot::Sender<Option<T>>),
    Subscribe(oneshot::Sender<(broadcast::Receiver<T>, Option<T>)>),
}

/// Send a value to a stateful pipe.
#[derive(Clone)]
pub struct Sender<T> {
    name: String,
    tx: mpsc::Sender<T>,
}

impl<T> Sender<T> {
    /// Send data to the pipe or fail if the buffer is full.
    pub fn try_send(&self, data: T) {
        if let Err(err) = self.tx.try_send(data) {
            error!("{}: send failed: {err}", self.name);
        }
    }
}

/// Receive values from a stateful pipe.
#[derive(Clone)]
pub struct Receiver<T> {
    name: String,
    tx: mpsc::Sender<ReceiveMessage<T>>,
}

impl<T: Clone + Send> Receiver<T> {
    /// Retrieve the most recent value from the pipe.
    ///
    /// Returns `None` if no value was sent yet or the pipe is closed.
    pub async fn get(&self) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if let Err(err) = self.tx.send(ReceiveMessage::Get(tx)).await {
            error!("{}: get/send failed: {err}", self.name);
            return None;
        }
        rx.await.unwrap_or_else(|_| {
            error!("{}: get/await failed", self.name);
            None
        })
    }

    /// Subscribe to this pipe.
    ///
    /// The current value, if any, is delivered first.
    pub async fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = oneshot::channel();
        if let Err(err) = self.tx.send(ReceiveMessage::Subscribe(tx)).await {
            error!("{}: subscribe/send failed: {err}", self.name);
            return Subscription::closed(self.name.clone());
        }
        rx.await.map_or_else(
            |_| {
                error!("{}: subscribe/await failed", self.name);
                Subscription::closed(self.name.clone())
            },
            |(rx, initial)| Subscription {
                name: self.name.clone(),
                rx,
                initial,
            },
        )
    }
}

/// A subscription to a stateful pipe.
pub struct Subscription<T> {
    name: String,
    rx: broadcast::Receiver<T>,
    initial: Option<T>,
}

impl<T: Clone + Send> Subscription<T> {
    fn closed(name: String) -> Self {
        let (tx, rx) = broadcast::channel(1);
        drop(tx);
        Subscription {
            name,
            rx,
            initial: None,
        }
    }

    /// Wait for the next value from the pipe.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Closed` if the pipe is closed.
    pub async fn recv(&mut self) -> Result<T, RecvError> {
        if let Some(initial) = self.initial.take() {
            return Ok(initial);
        }
        loop {
            match self.rx.recv().await {
                Ok(data) => return Ok(data),
                Err(broadcast::error::RecvError::Closed) => return Err(RecvError::Closed),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!("{}: receiver lagged, skipped {count} values", self.name);
                }
            }
        }
    }
}

/// Create a stateful pipe that only forwards changed values.
#[must_use]
pub fn create_pipe<T>(name: impl Into<String>) -> (Sender<T>, Receiver<T>)
where
    T: Clone + PartialEq + Send + 'static,
{
    let (in_tx, mut in_rx) = mpsc::channel::<T>(PIPE_SIZE);
    let (receive_tx, mut receive_rx) = mpsc::channel::<ReceiveMessage<T>>(PIPE_SIZE);
    let (out_tx, out_rx) = broadcast::channel::<T>(PIPE_SIZE);
    drop(out_rx);

    let name = name.into();
    let sender = Sender {
        name: name.clone(),
        tx: in_tx,
    };
    let receiver = Receiver {
        name: name.clone(),
        tx: receive_tx,
    };

    spawn(async move {
        let mut current: Option<T> = None;

        loop {
            select! {
                data = in_rx.recv() => {
                    match data {
                        Some(data) => {
                            let changed = current.as_ref() != Some(&data);
                            if changed {
                                current = Some(data.clone());
                                if out_tx.send(data).is_err() {
                                    // It is not an error if there are no subscribers.
                                }
                            }
                        }
                        None => {
                            debug!("stateful::create_pipe({name}): send channel closed");
                            break;
                        }
                    }
                }
                msg = receive_rx.recv() => {
                    match msg {
                        Some(ReceiveMessage::Get(tx)) => {
                            if tx.send(current.clone()).is_err() {
                                error!("stateful::create_pipe({name}): get send failed");
                            }
                        }
                        Some(ReceiveMessage::Subscribe(tx)) => {
                            if tx.send((out_tx.subscribe(), current.clone())).is_err() {
                                error!("stateful::create_pipe({name}): subscribe send failed");
                            }
                        }
                        None => {
                            debug!("stateful::create_pipe({name}): receive channel closed");
                            break;
                        }
                    }
                }
            }
        }
    });

    (sender, receiver)
}
