//! dp5-core: shared building blocks for the DP5 presence service
//!
//! DP5 lets clients announce that they are online and learn which of
//! their friends are online without the servers learning the social
//! graph. It runs two tracks:
//!
//! - Standard track: long epochs. A client registers, for each friend, a
//!   record carrying its combined-track identifier; friends fetch it with
//!   a sharded PIR lookup.
//! - Combined track: short epochs. A client registers its current
//!   presence payload under its combined identifier; friends who learned
//!   that identifier look it up.
//!
//! This crate holds what both the client driver and the server need:
//! epoch parameters, the request tracker, the event bus and the engine
//! adapter traits. The cryptography itself lives behind [`engine`];
//! [`PlaintextEngine`] is a non-private stand-in for tests and demos.

mod epoch;
mod error;
mod events;
mod tracker;

pub mod engine;
pub mod plaintext;

pub use engine::{
    ClientEngine, EngineError, EngineResult, KeyPair, LookupServer, LookupSession, Presence,
    PublicKey, Registrar, RegistrationSession, ServerEngine,
};
pub use epoch::{Clock, Epoch, EpochConfig, ManualClock, SystemClock, Track, MAC_BYTES};
pub use error::Error;
pub use events::{
    ActionId, Event, EventBus, EventSink, HandlerId, NullSink, Outcome, Reaction, TracingSink,
};
pub use plaintext::PlaintextEngine;
pub use tracker::{ProtocolKind, RequestId, RequestLabel, RequestTracker};

pub type Result<T> = std::result::Result<T, Error>;

/// Defaults shared by client and server configuration
pub mod constants {
    /// Standard track epoch length in seconds
    pub const STANDARD_EPOCH_SECS: u64 = 60;

    /// Combined track epoch length in seconds
    pub const COMBINED_EPOCH_SECS: u64 = 10;

    /// Combined track record width in bytes
    pub const COMBINED_DATA_SIZE: usize = 32;

    /// Lookup servers per track
    pub const LOOKUP_SERVERS: usize = 3;

    /// Outstanding network operations above which `update` stops
    /// starting lookups
    pub const MAX_IN_FLIGHT: usize = 5;

    /// Seconds before an HTTP request to another server is abandoned
    pub const HTTP_TIMEOUT_SECS: u64 = 30;
}
