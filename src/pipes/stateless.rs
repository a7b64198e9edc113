//! Stateless pipes forward every message without remembering any of them.
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use super::{RecvError, PIPE_SIZE};
use crate::spawn;

/// Send a value into a pipe.
#[derive(Clone)]
pub struct Sender<T> {
    name: String,
    tx: mpsc::Sender<T>,
}

impl<T> Sender<T> {
    /// Send data into the pipe or fail if the buffer is full.
    pub fn try_send(&self, data: T) {
        if let Err(err) = self.tx.try_send(data) {
            error!("{}: send failed: {err}", self.name);
        }
    }
}

/// Receive values from a pipe.
#[derive(Clone)]
pub struct Receiver<T> {
    name: String,
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send> Receiver<T> {
    /// Subscribe to this pipe.
    #[must_use]
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            name: self.name.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

/// A subscription to a stateless pipe.
pub struct Subscription<T> {
    name: String,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone + Send> Subscription<T> {
    /// Wait for the next value from the pipe.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Closed` if the pipe is closed.
    pub async fn recv(&mut self) -> Result<T, RecvError> {
        loop {
            match self.rx.recv().await {
                Ok(data) => return Ok(data),
                Err(broadcast::error::RecvError::Closed) => return Err(RecvError::Closed),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!("{}: receiver lagged, skipped {count} messages", self.name);
                }
            }
        }
    }
}

/// Create a stateless pipe that forwards every message to all subscribers.
#[must_use]
pub fn create_pipe<T>(name: impl Into<String>) -> (Sender<T>, Receiver<T>)
where
    T: Clone + Send + 'static,
{
    let (in_tx, mut in_rx) = mpsc::channel::<T>(PIPE_SIZE);
    let (out_tx, out_rx) = broadcast::channel::<T>(PIPE_SIZE);
    drop(out_rx);

    let name = name.into();
    let sender = Sender {
        name: name.clone(),
        tx: in_tx,
    };
    let receiver = Receiver {
        name: name.clone(),
        tx: out_tx.clone(),
    };

    spawn(async move {
        while let Some(data) = in_rx.recv().await {
            if out_tx.send(data).is_err() {
                // It is not an error if there are no subscribers.
            }
        }
        debug!("stateless::create_pipe({name}): send channel closed");
    });

    (sender, receiver)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn test_forwards_every_message() {
        let (tx, rx) = create_pipe::<u32>("test");
        let mut sub = rx.subscribe();

        tx.try_send(1);
        tx.try_send(1);
        tx.try_send(2);

        assert_eq!(sub.recv().await.unwrap(), 1);
        assert_eq!(sub.recv().await.unwrap(), 1);
        assert_eq!(sub.recv().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_closed_pipe() {
        let (tx, rx) = create_pipe::<u32>("test");
        let mut sub = rx.subscribe();

        drop(tx);
        assert!(matches!(sub.recv().await, Err(RecvError::Closed)));
    }
}
