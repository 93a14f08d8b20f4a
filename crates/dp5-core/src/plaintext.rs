//! Plaintext reference engine
//!
//! A deterministic, NON-private engine with the same message flow as the
//! real one: registrations for the next epoch, a metadata round trip,
//! per-shard lookup requests and an epoch-change snapshot into a
//! metadata file and a data file. Records are keyed by keccak-256 tags
//! so the server never needs to parse keys, but payloads travel in the
//! clear. Use it for tests and local demos only.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tiny_keccak::{Hasher, Keccak};

use crate::engine::{
    ClientEngine, EngineError, EngineResult, KeyPair, LookupServer, LookupSession, Presence,
    PublicKey, Registrar, RegistrationSession, ServerEngine,
};
use crate::epoch::{Epoch, EpochConfig, Track};

/// Length of secrets and public keys
pub const KEY_BYTES: usize = 32;

type Tag = [u8; 32];

fn keccak(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    out
}

fn domain(track: Track) -> &'static [u8] {
    match track {
        Track::Standard => b"dp5-standard",
        Track::Combined => b"dp5-combined",
    }
}

/// Tag under which `owner` publishes a record for `reader`
fn record_tag(owner: &PublicKey, reader: Option<&PublicKey>, epoch: Epoch) -> Tag {
    match reader {
        Some(reader) => keccak(&[owner.as_bytes(), reader.as_bytes(), &epoch.to_le_bytes()]),
        None => keccak(&[owner.as_bytes(), &epoch.to_le_bytes()]),
    }
}

fn shard_of(tag: &Tag, num_shards: usize) -> usize {
    tag[0] as usize % num_shards
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    tag: Tag,
    payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistrationRequest {
    epoch: Epoch,
    combined: bool,
    records: Vec<Record>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistrationReceipt {
    epoch: Epoch,
    accepted: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct DatabaseMetadata {
    epoch: Epoch,
    combined: bool,
    num_records: u64,
}

#[derive(Debug, Serialize, Deserialize)]
enum LookupRequest {
    Metadata { epoch: Epoch },
    Shard { epoch: Epoch, shard: u32, tags: Vec<Tag> },
}

#[derive(Debug, Serialize, Deserialize)]
enum LookupResponse {
    Metadata(DatabaseMetadata),
    Shard { shard: u32, records: Vec<(Tag, Option<Vec<u8>>)> },
}

/// Reference engine implementing both halves of the adapter
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextEngine;

impl PlaintextEngine {
    pub fn new() -> Self {
        Self
    }

    fn keypair_from_secret(track: Track, secret: Vec<u8>) -> KeyPair {
        let public = keccak(&[domain(track), &secret]);
        KeyPair::new(secret, PublicKey::from_bytes(public.to_vec()))
    }

    fn registration(
        config: &EpochConfig,
        records: Vec<Record>,
        epoch: Epoch,
    ) -> EngineResult<(PlaintextRegistration, Vec<u8>)> {
        for record in &records {
            if record.payload.len() != config.plaintext_size() {
                return Err(EngineError::Rejected(format!(
                    "payload is {} bytes, track expects {}",
                    record.payload.len(),
                    config.plaintext_size()
                )));
            }
        }
        let session = PlaintextRegistration {
            epoch,
            records: records.len(),
        };
        let message = bincode::serialize(&RegistrationRequest {
            epoch,
            combined: config.is_combined(),
            records,
        })?;
        Ok((session, message))
    }
}

impl ClientEngine for PlaintextEngine {
    type Registration = PlaintextRegistration;
    type Lookup = PlaintextLookup;

    fn generate_keypair(&self, track: Track) -> EngineResult<KeyPair> {
        let mut secret = vec![0u8; KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut secret);
        Ok(Self::keypair_from_secret(track, secret))
    }

    fn restore_keypair(&self, track: Track, secret: &[u8]) -> EngineResult<KeyPair> {
        if secret.len() != KEY_BYTES {
            return Err(EngineError::Malformed(format!(
                "secret is {} bytes, expected {}",
                secret.len(),
                KEY_BYTES
            )));
        }
        Ok(Self::keypair_from_secret(track, secret.to_vec()))
    }

    fn start_registration(
        &self,
        config: &EpochConfig,
        key: &KeyPair,
        friends: &[PublicKey],
        payload: &[u8],
        epoch: Epoch,
    ) -> EngineResult<(PlaintextRegistration, Vec<u8>)> {
        let records = friends
            .iter()
            .map(|friend| Record {
                tag: record_tag(key.public(), Some(friend), epoch),
                payload: payload.to_vec(),
            })
            .collect();
        Self::registration(config, records, epoch)
    }

    fn start_combined_registration(
        &self,
        config: &EpochConfig,
        key: &KeyPair,
        payload: &[u8],
        epoch: Epoch,
    ) -> EngineResult<(PlaintextRegistration, Vec<u8>)> {
        let records = vec![Record {
            tag: record_tag(key.public(), None, epoch),
            payload: payload.to_vec(),
        }];
        Self::registration(config, records, epoch)
    }

    fn start_lookup(
        &self,
        config: &EpochConfig,
        key: &KeyPair,
        targets: &[PublicKey],
        epoch: Epoch,
    ) -> EngineResult<(PlaintextLookup, Vec<u8>)> {
        let reader = if config.is_combined() {
            None
        } else {
            Some(key.public())
        };
        let targets = targets
            .iter()
            .map(|target| (target.clone(), record_tag(target, reader, epoch)))
            .collect();
        let session = PlaintextLookup {
            epoch,
            targets,
            metadata: None,
            num_shards: 0,
        };
        let message = bincode::serialize(&LookupRequest::Metadata { epoch })?;
        Ok((session, message))
    }
}

#[derive(Debug)]
pub struct PlaintextRegistration {
    epoch: Epoch,
    records: usize,
}

impl RegistrationSession for PlaintextRegistration {
    fn finish(self, reply: &[u8]) -> EngineResult<()> {
        let receipt: RegistrationReceipt = bincode::deserialize(reply)?;
        if receipt.epoch != self.epoch {
            return Err(EngineError::StaleEpoch {
                expected: self.epoch,
                actual: receipt.epoch,
            });
        }
        if receipt.accepted as usize != self.records {
            return Err(EngineError::Rejected(format!(
                "server accepted {} of {} records",
                receipt.accepted, self.records
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct PlaintextLookup {
    epoch: Epoch,
    targets: Vec<(PublicKey, Tag)>,
    metadata: Option<DatabaseMetadata>,
    num_shards: usize,
}

impl LookupSession for PlaintextLookup {
    fn metadata_reply(&mut self, reply: &[u8]) -> EngineResult<()> {
        match bincode::deserialize::<LookupResponse>(reply)? {
            LookupResponse::Metadata(meta) => {
                if meta.epoch != self.epoch {
                    return Err(EngineError::StaleEpoch {
                        expected: self.epoch,
                        actual: meta.epoch,
                    });
                }
                self.metadata = Some(meta);
                Ok(())
            }
            LookupResponse::Shard { .. } => {
                Err(EngineError::Malformed("expected a metadata reply".into()))
            }
        }
    }

    fn lookup_requests(&mut self, num_servers: usize) -> EngineResult<Vec<Vec<u8>>> {
        let meta = self
            .metadata
            .ok_or_else(|| EngineError::Malformed("metadata not received".into()))?;
        if num_servers == 0 {
            return Err(EngineError::Rejected("no lookup servers".into()));
        }
        self.num_shards = num_servers;

        let mut per_shard: Vec<Vec<Tag>> = vec![Vec::new(); num_servers];
        if meta.num_records > 0 {
            for (_, tag) in &self.targets {
                per_shard[shard_of(tag, num_servers)].push(*tag);
            }
        }

        per_shard
            .into_iter()
            .enumerate()
            .map(|(shard, tags)| {
                if tags.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(bincode::serialize(&LookupRequest::Shard {
                    epoch: self.epoch,
                    shard: shard as u32,
                    tags,
                })?)
            })
            .collect()
    }

    fn decode_replies(&mut self, replies: &[Vec<u8>]) -> EngineResult<Vec<Presence>> {
        let meta = self
            .metadata
            .ok_or_else(|| EngineError::Malformed("metadata not received".into()))?;
        if replies.len() != self.num_shards {
            return Err(EngineError::Malformed(format!(
                "expected {} shard replies, got {}",
                self.num_shards,
                replies.len()
            )));
        }
        if meta.num_records == 0 {
            return Err(EngineError::NoDatabase { epoch: self.epoch });
        }

        let mut found: HashMap<Tag, Vec<u8>> = HashMap::new();
        for (index, reply) in replies.iter().enumerate() {
            if reply.is_empty() {
                continue;
            }
            match bincode::deserialize::<LookupResponse>(reply)? {
                LookupResponse::Shard { shard, records } if shard as usize == index => {
                    found.extend(
                        records
                            .into_iter()
                            .filter_map(|(tag, payload)| payload.map(|p| (tag, p))),
                    );
                }
                _ => {
                    return Err(EngineError::Malformed(format!(
                        "reply {} is not a shard reply for that shard",
                        index
                    )))
                }
            }
        }

        Ok(self
            .targets
            .iter()
            .map(|(key, tag)| {
                let payload = found.remove(tag);
                Presence {
                    key: key.clone(),
                    online: payload.is_some(),
                    payload,
                }
            })
            .collect())
    }
}

impl ServerEngine for PlaintextEngine {
    type Registrar = PlaintextRegistrar;
    type LookupServer = PlaintextLookupServer;

    fn init_registration(
        &self,
        config: &EpochConfig,
        epoch: Epoch,
        reg_dir: &Path,
        data_dir: &Path,
    ) -> EngineResult<PlaintextRegistrar> {
        fs::create_dir_all(reg_dir)?;
        fs::create_dir_all(data_dir)?;
        let mut registrar = PlaintextRegistrar {
            config: *config,
            epoch,
            reg_dir: reg_dir.to_path_buf(),
            records: BTreeMap::new(),
        };
        registrar.replay_journal()?;
        Ok(registrar)
    }

    fn init_lookup(
        &self,
        _config: &EpochConfig,
        epoch: Epoch,
        meta_file: &Path,
        data_file: &Path,
    ) -> EngineResult<PlaintextLookupServer> {
        let meta: DatabaseMetadata = bincode::deserialize(&fs::read(meta_file)?)?;
        if meta.epoch != epoch {
            return Err(EngineError::StaleEpoch {
                expected: epoch,
                actual: meta.epoch,
            });
        }
        let records: Vec<Record> = bincode::deserialize(&fs::read(data_file)?)?;
        if records.len() as u64 != meta.num_records {
            return Err(EngineError::Malformed(format!(
                "metadata lists {} records, data file holds {}",
                meta.num_records,
                records.len()
            )));
        }
        Ok(PlaintextLookupServer {
            meta,
            records: records.into_iter().map(|r| (r.tag, r.payload)).collect(),
        })
    }

    fn empty_lookup(&self, config: &EpochConfig, epoch: Epoch) -> EngineResult<PlaintextLookupServer> {
        Ok(PlaintextLookupServer {
            meta: DatabaseMetadata {
                epoch,
                combined: config.is_combined(),
                num_records: 0,
            },
            records: HashMap::new(),
        })
    }
}

/// Registration authority for one epoch at a time
#[derive(Debug)]
pub struct PlaintextRegistrar {
    config: EpochConfig,
    epoch: Epoch,
    reg_dir: PathBuf,
    records: BTreeMap<Tag, Vec<u8>>,
}

impl PlaintextRegistrar {
    /// Journal of accepted registrations for the upcoming epoch
    fn journal_path(&self) -> PathBuf {
        self.reg_dir.join(format!("reg{}.journal", self.epoch + 1))
    }

    fn replay_journal(&mut self) -> EngineResult<()> {
        let path = self.journal_path();
        if !path.exists() {
            return Ok(());
        }
        let bytes = fs::read(&path)?;
        let mut offset = 0;
        while offset + 4 <= bytes.len() {
            let len = u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ]) as usize;
            offset += 4;
            let Some(chunk) = bytes.get(offset..offset + len) else {
                tracing::warn!(path = %path.display(), "Truncated registration journal entry");
                break;
            };
            let records: Vec<Record> = bincode::deserialize(chunk)?;
            self.records
                .extend(records.into_iter().map(|r| (r.tag, r.payload)));
            offset += len;
        }
        tracing::info!(
            epoch = self.epoch + 1,
            records = self.records.len(),
            "Replayed registration journal"
        );
        Ok(())
    }

    fn append_journal(&self, records: &[Record]) -> EngineResult<()> {
        let entry = bincode::serialize(records)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())?;
        file.write_all(&(entry.len() as u32).to_le_bytes())?;
        file.write_all(&entry)?;
        Ok(())
    }
}

impl Registrar for PlaintextRegistrar {
    fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn register(&mut self, message: &[u8]) -> EngineResult<Vec<u8>> {
        let request: RegistrationRequest = bincode::deserialize(message)?;
        if request.epoch != self.epoch + 1 {
            return Err(EngineError::StaleEpoch {
                expected: self.epoch + 1,
                actual: request.epoch,
            });
        }
        if request.combined != self.config.is_combined() {
            return Err(EngineError::Rejected(format!(
                "registration for the wrong track (combined = {})",
                request.combined
            )));
        }
        if let Some(bad) = request
            .records
            .iter()
            .find(|r| r.payload.len() != self.config.plaintext_size())
        {
            return Err(EngineError::Rejected(format!(
                "payload is {} bytes, track expects {}",
                bad.payload.len(),
                self.config.plaintext_size()
            )));
        }

        self.append_journal(&request.records)?;
        let accepted = request.records.len() as u32;
        self.records
            .extend(request.records.into_iter().map(|r| (r.tag, r.payload)));

        Ok(bincode::serialize(&RegistrationReceipt {
            epoch: request.epoch,
            accepted,
        })?)
    }

    fn epoch_change(&mut self, meta_file: &Path, data_file: &Path) -> EngineResult<Epoch> {
        let next = self.epoch + 1;
        let records: Vec<Record> = std::mem::take(&mut self.records)
            .into_iter()
            .map(|(tag, payload)| Record { tag, payload })
            .collect();
        let meta = DatabaseMetadata {
            epoch: next,
            combined: self.config.is_combined(),
            num_records: records.len() as u64,
        };

        fs::write(data_file, bincode::serialize(&records)?)?;
        fs::write(meta_file, bincode::serialize(&meta)?)?;

        let journal = self.journal_path();
        if journal.exists() {
            fs::remove_file(journal)?;
        }
        self.epoch = next;
        Ok(next)
    }
}

/// Read-only database for one epoch
#[derive(Debug)]
pub struct PlaintextLookupServer {
    meta: DatabaseMetadata,
    records: HashMap<Tag, Vec<u8>>,
}

impl PlaintextLookupServer {
    pub fn num_records(&self) -> usize {
        self.records.len()
    }
}

impl LookupServer for PlaintextLookupServer {
    fn epoch(&self) -> Epoch {
        self.meta.epoch
    }

    fn process(&self, message: &[u8]) -> EngineResult<Vec<u8>> {
        let response = match bincode::deserialize::<LookupRequest>(message)? {
            LookupRequest::Metadata { epoch } | LookupRequest::Shard { epoch, .. }
                if epoch != self.meta.epoch =>
            {
                return Err(EngineError::StaleEpoch {
                    expected: self.meta.epoch,
                    actual: epoch,
                })
            }
            LookupRequest::Metadata { .. } => LookupResponse::Metadata(self.meta),
            LookupRequest::Shard { shard, tags, .. } => LookupResponse::Shard {
                shard,
                records: tags
                    .into_iter()
                    .map(|tag| (tag, self.records.get(&tag).cloned()))
                    .collect(),
            },
        };
        Ok(bincode::serialize(&response)?)
    }
}
