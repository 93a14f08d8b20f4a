//! Per-track epoch parameters and the wall-clock to epoch mapping

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Error;

/// Epoch number: index of a fixed-length time window since the Unix epoch
pub type Epoch = u64;

/// MAC bytes reserved in every encrypted record
pub const MAC_BYTES: usize = 16;

/// Protocol track
///
/// - Standard: long epochs, long-term identity keys, used to learn a
///   friend's combined-track identifier
/// - Combined: short epochs, carries the current presence payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    Standard,
    Combined,
}

impl Track {
    pub fn is_combined(&self) -> bool {
        matches!(self, Track::Combined)
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Track::Standard => write!(f, "standard"),
            Track::Combined => write!(f, "combined"),
        }
    }
}

/// Immutable per-track parameters
///
/// `data_size` is the encrypted record width; the plaintext payload a
/// client supplies is `data_size - MAC_BYTES` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochConfig {
    epoch_length: Duration,
    data_size: usize,
    combined: bool,
}

impl EpochConfig {
    pub fn new(epoch_length: Duration, data_size: usize, combined: bool) -> Result<Self, Error> {
        if epoch_length.as_millis() == 0 {
            return Err(Error::InvalidConfig("epoch length must be positive".into()));
        }
        if data_size <= MAC_BYTES {
            return Err(Error::InvalidConfig(format!(
                "data size {} must exceed the {} byte MAC",
                data_size, MAC_BYTES
            )));
        }
        Ok(Self {
            epoch_length,
            data_size,
            combined,
        })
    }

    pub fn standard(epoch_length: Duration, data_size: usize) -> Result<Self, Error> {
        Self::new(epoch_length, data_size, false)
    }

    pub fn combined(epoch_length: Duration, data_size: usize) -> Result<Self, Error> {
        Self::new(epoch_length, data_size, true)
    }

    pub fn epoch_length(&self) -> Duration {
        self.epoch_length
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Width of the payload a client registers
    pub fn plaintext_size(&self) -> usize {
        self.data_size - MAC_BYTES
    }

    pub fn is_combined(&self) -> bool {
        self.combined
    }

    pub fn track(&self) -> Track {
        if self.combined {
            Track::Combined
        } else {
            Track::Standard
        }
    }

    /// Map a point in time to its epoch. Times before 1970 map to epoch 0.
    pub fn epoch_at(&self, time: SystemTime) -> Epoch {
        let elapsed = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        (elapsed.as_millis() / self.epoch_length.as_millis()) as Epoch
    }

    pub fn current_epoch(&self, clock: &dyn Clock) -> Epoch {
        self.epoch_at(clock.now())
    }

    /// Wall-clock start of an epoch
    pub fn epoch_start(&self, epoch: Epoch) -> SystemTime {
        let millis = self.epoch_length.as_millis() as u64 * epoch;
        UNIX_EPOCH + Duration::from_millis(millis)
    }

    /// Check a payload against the configured plaintext width
    pub fn check_payload(&self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() != self.plaintext_size() {
            return Err(Error::PayloadSize {
                expected: self.plaintext_size(),
                actual: payload.len(),
            });
        }
        Ok(())
    }
}

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually driven clock for tests and simulations
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        let clock = Self::default();
        clock.set(start);
        clock
    }

    /// Clock positioned at the start of `epoch` under `config`
    pub fn at_epoch(config: &EpochConfig, epoch: Epoch) -> Self {
        Self::new(config.epoch_start(epoch))
    }

    pub fn set(&self, time: SystemTime) {
        let millis = time.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}
