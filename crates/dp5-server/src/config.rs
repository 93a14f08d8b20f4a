//! Server configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use dp5_core::constants::{
    COMBINED_DATA_SIZE, COMBINED_EPOCH_SECS, HTTP_TIMEOUT_SECS, STANDARD_EPOCH_SECS,
};
use dp5_core::plaintext::KEY_BYTES;
use dp5_core::{Epoch, EpochConfig, MAC_BYTES};

use crate::error::Result;

/// Configuration for one DP5 server process (one track)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Accept registrations and roll the database over each epoch
    #[serde(default = "default_true")]
    pub is_reg_server: bool,
    /// Answer lookups for closed epochs
    #[serde(default = "default_true")]
    pub is_lookup_server: bool,
    /// Registration journals
    #[serde(default = "default_reg_dir")]
    pub reg_dir: PathBuf,
    /// Per-epoch shard files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Registration server to download missing shard files from
    #[serde(default)]
    pub upstream: Option<String>,
    /// Seconds before a shard download from `upstream` is abandoned
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,
    /// Serve the combined track instead of the standard one
    #[serde(default)]
    pub combined: bool,
    /// Epoch length in seconds; defaults per track
    #[serde(default)]
    pub epoch_length_secs: Option<u64>,
    /// Encrypted record width in bytes; defaults per track
    #[serde(default)]
    pub data_size: Option<usize>,
    /// Expose `/debugfastforward`
    #[serde(default)]
    pub debug_fast_forward: bool,
}

fn default_true() -> bool {
    true
}

fn default_upstream_timeout() -> u64 {
    HTTP_TIMEOUT_SECS
}

fn default_reg_dir() -> PathBuf {
    PathBuf::from("./dp5-data/reg")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./dp5-data/data")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_base_dir("./dp5-data")
    }
}

impl ServerConfig {
    /// Registration and lookup server keeping its files under `base_dir`
    pub fn from_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base = base_dir.into();
        Self {
            is_reg_server: true,
            is_lookup_server: true,
            reg_dir: base.join("reg"),
            data_dir: base.join("data"),
            upstream: None,
            upstream_timeout_secs: HTTP_TIMEOUT_SECS,
            combined: false,
            epoch_length_secs: None,
            data_size: None,
            debug_fast_forward: false,
        }
    }

    pub fn combined(mut self, combined: bool) -> Self {
        self.combined = combined;
        self
    }

    /// Lookup-only server fetching its shard files from `upstream`
    pub fn lookup_only(mut self, upstream: impl Into<String>) -> Self {
        self.is_reg_server = false;
        self.is_lookup_server = true;
        self.upstream = Some(upstream.into());
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn with_epoch_length(mut self, secs: u64) -> Self {
        self.epoch_length_secs = Some(secs);
        self
    }

    pub fn with_debug_fast_forward(mut self, enabled: bool) -> Self {
        self.debug_fast_forward = enabled;
        self
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Epoch parameters of the served track. Without an explicit
    /// `data_size` the standard track carries a combined public key of
    /// the reference engine.
    pub fn epoch_config(&self) -> Result<EpochConfig> {
        let (secs, size) = if self.combined {
            (COMBINED_EPOCH_SECS, COMBINED_DATA_SIZE)
        } else {
            (STANDARD_EPOCH_SECS, MAC_BYTES + KEY_BYTES)
        };
        Ok(EpochConfig::new(
            Duration::from_secs(self.epoch_length_secs.unwrap_or(secs)),
            self.data_size.unwrap_or(size),
            self.combined,
        )?)
    }

    /// Metadata and data shard files of `epoch`
    pub fn shard_paths(&self, epoch: Epoch) -> (PathBuf, PathBuf) {
        (
            self.data_dir.join(format!("meta{}.dat", epoch)),
            self.data_dir.join(format!("data{}.dat", epoch)),
        )
    }
}
