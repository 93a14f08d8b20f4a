//! Engine adapter: the cryptographic/PIR collaborator as typed operations
//!
//! The engine builds and checks every protocol message. Nothing in this
//! workspace inspects message bytes; they are produced by a session,
//! carried by a transport, consumed by the matching server handle and
//! answered back into the same session.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

use crate::epoch::{Epoch, EpochConfig, Track};

/// Public key or combined-track identifier
///
/// Keys are compared byte for byte; no canonicalization is applied.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "hex")] Vec<u8>);

impl PublicKey {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First five bytes in hex, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(5)])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Key pair in the engine's opaque encoding
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(with = "hex")]
    secret: Vec<u8>,
    public: PublicKey,
}

impl KeyPair {
    pub fn new(secret: Vec<u8>, public: PublicKey) -> Self {
        Self { secret, public }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Serialized secret, accepted back by [`ClientEngine::restore_keypair`]
    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Decoded lookup result for one queried key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub key: PublicKey,
    pub online: bool,
    pub payload: Option<Vec<u8>>,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No database available for epoch {epoch}")]
    NoDatabase { epoch: Epoch },

    #[error("Stale epoch: expected {expected}, got {actual}")]
    StaleEpoch { expected: Epoch, actual: Epoch },

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_no_database(&self) -> bool {
        matches!(self, EngineError::NoDatabase { .. })
    }
}

impl From<bincode::Error> for EngineError {
    fn from(e: bincode::Error) -> Self {
        EngineError::Malformed(e.to_string())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Client half of the engine
pub trait ClientEngine: Send + 'static {
    type Registration: RegistrationSession + Send;
    type Lookup: LookupSession + Send;

    fn generate_keypair(&self, track: Track) -> EngineResult<KeyPair>;

    fn restore_keypair(&self, track: Track, secret: &[u8]) -> EngineResult<KeyPair>;

    /// Standard registration for `epoch`: tells every key in `friends`
    /// that `key` is online with `payload`
    fn start_registration(
        &self,
        config: &EpochConfig,
        key: &KeyPair,
        friends: &[PublicKey],
        payload: &[u8],
        epoch: Epoch,
    ) -> EngineResult<(Self::Registration, Vec<u8>)>;

    /// Combined registration for `epoch` publishing `payload`
    fn start_combined_registration(
        &self,
        config: &EpochConfig,
        key: &KeyPair,
        payload: &[u8],
        epoch: Epoch,
    ) -> EngineResult<(Self::Registration, Vec<u8>)>;

    /// Lookup of `targets` at `epoch`; the track follows `config`.
    /// Returns the session and its metadata request.
    fn start_lookup(
        &self,
        config: &EpochConfig,
        key: &KeyPair,
        targets: &[PublicKey],
        epoch: Epoch,
    ) -> EngineResult<(Self::Lookup, Vec<u8>)>;
}

pub trait RegistrationSession {
    fn finish(self, reply: &[u8]) -> EngineResult<()>;
}

pub trait LookupSession {
    fn metadata_reply(&mut self, reply: &[u8]) -> EngineResult<()>;

    /// One request per shard; an empty request needs no network round trip
    fn lookup_requests(&mut self, num_servers: usize) -> EngineResult<Vec<Vec<u8>>>;

    /// Decode the full, shard-ordered reply set
    fn decode_replies(&mut self, replies: &[Vec<u8>]) -> EngineResult<Vec<Presence>>;
}

/// Server half of the engine
pub trait ServerEngine: Send + Sync + 'static {
    type Registrar: Registrar + Send + 'static;
    type LookupServer: LookupServer + Send + Sync + 'static;

    /// Registration authority accepting registrations for `epoch + 1`
    fn init_registration(
        &self,
        config: &EpochConfig,
        epoch: Epoch,
        reg_dir: &Path,
        data_dir: &Path,
    ) -> EngineResult<Self::Registrar>;

    fn init_lookup(
        &self,
        config: &EpochConfig,
        epoch: Epoch,
        meta_file: &Path,
        data_file: &Path,
    ) -> EngineResult<Self::LookupServer>;

    /// Lookup handle for an epoch that has no database; its replies
    /// decode as [`EngineError::NoDatabase`]
    fn empty_lookup(&self, config: &EpochConfig, epoch: Epoch) -> EngineResult<Self::LookupServer>;
}

pub trait Registrar {
    fn epoch(&self) -> Epoch;

    fn register(&mut self, message: &[u8]) -> EngineResult<Vec<u8>>;

    /// Persist the accumulated database and move to the next epoch
    fn epoch_change(&mut self, meta_file: &Path, data_file: &Path) -> EngineResult<Epoch>;
}

pub trait LookupServer {
    fn epoch(&self) -> Epoch;

    fn process(&self, message: &[u8]) -> EngineResult<Vec<u8>>;
}
