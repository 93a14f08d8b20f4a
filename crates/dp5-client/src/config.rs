//! Client configuration
//!
//! Loaded from the same JSON layout the servers are described with:
//!
//! ```json
//! {
//!   "standard": { "regServer": "https://reg:8443", "lookupServers": ["https://l0:8443"], "epochLength": 1800 },
//!   "combined": { "regServer": "https://cbreg:8443", "lookupServers": ["https://cb0:8443"], "epochLength": 300, "dataEncSize": 32 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use dp5_core::constants::{
    COMBINED_DATA_SIZE, COMBINED_EPOCH_SECS, HTTP_TIMEOUT_SECS, LOOKUP_SERVERS,
    STANDARD_EPOCH_SECS,
};
use dp5_core::{EpochConfig, Track, MAC_BYTES};

use crate::error::{ClientError, Result};

/// Servers and parameters of one track
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackConfig {
    /// Registration server base URL
    #[serde(default)]
    pub reg_server: String,
    /// Lookup server base URLs, one per shard
    #[serde(default)]
    pub lookup_servers: Vec<String>,
    /// Epoch length in seconds
    #[serde(default)]
    pub epoch_length: Option<u64>,
    /// Encrypted record width in bytes
    #[serde(default)]
    pub data_enc_size: Option<usize>,
}

impl TrackConfig {
    pub fn new(reg_server: impl Into<String>, lookup_servers: Vec<String>) -> Self {
        Self {
            reg_server: reg_server.into(),
            lookup_servers,
            ..Self::default()
        }
    }

    pub fn with_epoch_length(mut self, secs: u64) -> Self {
        self.epoch_length = Some(secs);
        self
    }

    pub fn with_data_enc_size(mut self, bytes: usize) -> Self {
        self.data_enc_size = Some(bytes);
        self
    }

    /// Number of lookup shards. Without a server list the default pool
    /// size is assumed.
    pub fn num_servers(&self) -> usize {
        if self.lookup_servers.is_empty() {
            LOOKUP_SERVERS
        } else {
            self.lookup_servers.len()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub standard: TrackConfig,
    #[serde(default)]
    pub combined: TrackConfig,
    /// Name used in diagnostic logs; defaults to a public key prefix
    #[serde(default)]
    pub name: Option<String>,
    /// Seconds before a registration or lookup request counts as failed
    #[serde(default = "default_request_timeout", rename = "requestTimeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    HTTP_TIMEOUT_SECS
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(TrackConfig::default(), TrackConfig::default())
    }
}

impl ClientConfig {
    pub fn new(standard: TrackConfig, combined: TrackConfig) -> Self {
        Self {
            standard,
            combined,
            name: None,
            request_timeout_secs: HTTP_TIMEOUT_SECS,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn track(&self, track: Track) -> &TrackConfig {
        match track {
            Track::Standard => &self.standard,
            Track::Combined => &self.combined,
        }
    }

    /// Standard track parameters. Its records carry the combined public
    /// key, so the record width is fixed by the key length.
    pub fn standard_epoch_config(&self, combined_key_len: usize) -> Result<EpochConfig> {
        let expected = MAC_BYTES + combined_key_len;
        if let Some(size) = self.standard.data_enc_size {
            if size != expected {
                return Err(ClientError::Config(format!(
                    "standard dataEncSize is {} but records carry a {} byte key (expected {})",
                    size, combined_key_len, expected
                )));
            }
        }
        let secs = self.standard.epoch_length.unwrap_or(STANDARD_EPOCH_SECS);
        Ok(EpochConfig::standard(Duration::from_secs(secs), expected)?)
    }

    pub fn combined_epoch_config(&self) -> Result<EpochConfig> {
        let secs = self.combined.epoch_length.unwrap_or(COMBINED_EPOCH_SECS);
        let size = self.combined.data_enc_size.unwrap_or(COMBINED_DATA_SIZE);
        Ok(EpochConfig::combined(Duration::from_secs(secs), size)?)
    }
}
