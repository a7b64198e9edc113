//! Message queues that connect sources, coordinators and sinks.
use thiserror::Error;

pub mod stateful;
pub mod stateless;

/// Size of all pipes.
pub const PIPE_SIZE: usize = 10;

/// Something went wrong in Receiver.
#[derive(Error, Debug)]
pub enum RecvError {
    /// The Pipe was closed.
    #[error("The pipe was closed")]
    Closed,
}
