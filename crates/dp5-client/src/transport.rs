//! Transport contract between the client driver and the network
//!
//! A transport delivers opaque messages to the server for a track and
//! shard. It never calls back into the client: each send carries a
//! [`ReplyHandle`] which the transport completes exactly once, from any
//! task, and the completion is queued for the client to pick up.

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use dp5_core::{ActionId, Epoch, RequestId, RequestLabel, Track};

/// Position of a reply within its operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Registration,
    Metadata,
    Shard(usize),
}

/// Everything the client needs to resume an operation when a reply lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continuation {
    pub label: RequestLabel,
    pub request: RequestId,
    pub action: ActionId,
    pub step: Step,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("No {track} server configured for shard {shard}")]
    NoServer { track: Track, shard: usize },
}

/// Reply to one network send
#[derive(Debug)]
pub struct Completion {
    pub continuation: Continuation,
    pub result: Result<Vec<u8>, NetworkError>,
}

/// Single-use completion handle given to the transport with every send
#[derive(Debug)]
pub struct ReplyHandle {
    continuation: Continuation,
    tx: UnboundedSender<Completion>,
}

impl ReplyHandle {
    pub(crate) fn new(continuation: Continuation, tx: UnboundedSender<Completion>) -> Self {
        Self { continuation, tx }
    }

    pub fn continuation(&self) -> &Continuation {
        &self.continuation
    }

    pub fn succeed(self, reply: Vec<u8>) {
        self.complete(Ok(reply));
    }

    pub fn fail(self, error: NetworkError) {
        self.complete(Err(error));
    }

    fn complete(self, result: Result<Vec<u8>, NetworkError>) {
        let completion = Completion {
            continuation: self.continuation,
            result,
        };
        if self.tx.send(completion).is_err() {
            tracing::trace!(label = %self.continuation.label, "Client gone, dropping reply");
        }
    }
}

/// Message delivery for the presence client
///
/// An empty lookup message needs no server round trip: implementations
/// must answer it at once with an empty successful reply.
pub trait Transport: Send {
    /// Registration for `epoch` (the epoch being registered for)
    fn send_registration(&mut self, epoch: Epoch, track: Track, message: Vec<u8>, reply: ReplyHandle);

    fn send_lookup(
        &mut self,
        epoch: Epoch,
        track: Track,
        shard: usize,
        message: Vec<u8>,
        reply: ReplyHandle,
    );

    /// Sends handed over and not yet completed
    fn in_flight(&self) -> usize;
}
