//! Per-epoch server state
//!
//! The registration side is one registrar behind a global mutex that
//! also covers the epoch rollover, so no registration can land in an
//! epoch while it is being written out. Lookup handles are created on
//! first use per epoch and kept for the life of the process.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use dp5_core::{Clock, Epoch, EpochConfig, LookupServer, Registrar, ServerEngine};

use crate::cache::LazyMap;
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::metrics;
use crate::shard_fetch::{lock_path, read_shard, FileLock, LockMode, ShardFetcher, ShardFile};

/// Response from the status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub epoch: Epoch,
    pub register: bool,
}

struct EpochState<R> {
    epoch: Epoch,
    registrar: Option<R>,
    /// Epochs added by debug fast-forward
    offset: Epoch,
}

pub struct EpochManager<E: ServerEngine> {
    engine: Arc<E>,
    config: ServerConfig,
    epoch_config: EpochConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<EpochState<E::Registrar>>,
    lookups: LazyMap<Epoch, Arc<E::LookupServer>>,
    fetcher: ShardFetcher,
}

impl<E: ServerEngine> EpochManager<E> {
    /// Fix the starting epoch from `clock` and open registration for it
    pub fn new(engine: E, config: ServerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let epoch_config = config.epoch_config()?;
        let epoch = epoch_config.current_epoch(&*clock);
        std::fs::create_dir_all(&config.data_dir)?;

        let registrar = if config.is_reg_server {
            Some(engine.init_registration(&epoch_config, epoch, &config.reg_dir, &config.data_dir)?)
        } else {
            None
        };

        let track = epoch_config.track();
        tracing::info!(
            track = %track,
            epoch,
            register = config.is_reg_server,
            lookup = config.is_lookup_server,
            upstream = ?config.upstream,
            "Epoch manager initialized"
        );
        metrics::set_current_epoch(&track.to_string(), epoch);

        let fetcher = ShardFetcher::new(config.upstream.clone(), config.upstream_timeout())?;
        Ok(Self {
            engine: Arc::new(engine),
            config,
            epoch_config,
            clock,
            state: Mutex::new(EpochState {
                epoch,
                registrar,
                offset: 0,
            }),
            lookups: LazyMap::new(),
            fetcher,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn epoch_config(&self) -> &EpochConfig {
        &self.epoch_config
    }

    /// Track name for logs and metric labels
    pub fn track(&self) -> String {
        self.epoch_config.track().to_string()
    }

    fn wall_epoch(&self, offset: Epoch) -> Epoch {
        self.epoch_config.current_epoch(&*self.clock) + offset
    }

    /// Roll the registrar forward to the wall-clock epoch, writing one
    /// database per closed epoch
    async fn advance(&self, state: &mut EpochState<E::Registrar>) -> Result<()> {
        let target = self.wall_epoch(state.offset);
        while state.epoch < target {
            let from = state.epoch;
            match state.registrar.take() {
                Some(mut registrar) => {
                    let (meta, data) = self.config.shard_paths(from + 1);
                    let joined = tokio::task::spawn_blocking(move || {
                        let changed = change_epoch(&mut registrar, &meta, &data);
                        (registrar, changed)
                    })
                    .await;
                    let (registrar, changed) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            tracing::error!(track = %self.track(), from, error = %e, "Epoch change aborted");
                            state.registrar = self.reload_registrar(from);
                            return Err(e.into());
                        }
                    };
                    state.registrar = Some(registrar);

                    let next = changed?;
                    if next <= from {
                        return Err(ServerError::Internal(format!(
                            "epoch change from {} returned {}",
                            from, next
                        )));
                    }
                    state.epoch = next;
                    metrics::record_epoch_change(&self.track());
                }
                None => state.epoch = target,
            }
            tracing::info!(track = %self.track(), from, to = state.epoch, "Epoch advanced");
        }
        metrics::set_current_epoch(&self.track(), state.epoch);
        Ok(())
    }

    /// Registrar for `epoch` rebuilt from its journal
    fn reload_registrar(&self, epoch: Epoch) -> Option<E::Registrar> {
        match self.engine.init_registration(
            &self.epoch_config,
            epoch,
            &self.config.reg_dir,
            &self.config.data_dir,
        ) {
            Ok(registrar) => {
                tracing::warn!(track = %self.track(), epoch, "Registrar reloaded from journal");
                Some(registrar)
            }
            Err(e) => {
                tracing::error!(
                    track = %self.track(),
                    epoch,
                    error = %e,
                    "Registrar lost, registrations refused until restart"
                );
                None
            }
        }
    }

    /// Current epoch, after any pending rollover
    pub async fn check_epoch(&self) -> Result<Epoch> {
        let mut state = self.state.lock().await;
        self.advance(&mut state).await?;
        Ok(state.epoch)
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        let mut state = self.state.lock().await;
        self.advance(&mut state).await?;
        let register = state
            .registrar
            .as_ref()
            .map_or(false, |r| r.epoch() == state.epoch);
        Ok(StatusResponse {
            epoch: state.epoch,
            register,
        })
    }

    /// Accept a registration sent to the open epoch `epoch`
    pub async fn register(&self, epoch: Epoch, message: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state.lock().await;
        self.advance(&mut state).await?;

        if epoch != state.epoch {
            return Err(ServerError::forbidden(format!(
                "registration is open for epoch {}, not {}",
                state.epoch, epoch
            )));
        }
        let current = state.epoch;
        let registrar = state
            .registrar
            .as_mut()
            .filter(|r| r.epoch() == current)
            .ok_or_else(|| ServerError::forbidden("not a registration server"))?;

        Ok(registrar.register(message)?)
    }

    /// Lookup handle for `epoch`, fetching its shard files if needed
    pub async fn lookup_server(&self, epoch: Epoch) -> Result<Arc<E::LookupServer>> {
        let server = self
            .lookups
            .get_or_try_insert_with(epoch, || async move {
                let (meta, data) = self.config.shard_paths(epoch);
                self.fetcher.ensure(epoch, ShardFile::Meta, &meta).await?;
                self.fetcher.ensure(epoch, ShardFile::Data, &data).await?;

                let engine = self.engine.clone();
                let config = self.epoch_config;
                let server = tokio::task::spawn_blocking(move || -> Result<E::LookupServer> {
                    let _meta_lock = FileLock::acquire_blocking(&lock_path(&meta), LockMode::Shared)?;
                    let _data_lock = FileLock::acquire_blocking(&lock_path(&data), LockMode::Shared)?;
                    Ok(engine.init_lookup(&config, epoch, &meta, &data)?)
                })
                .await??;

                tracing::info!(track = %self.track(), epoch, "Lookup handle created");
                Ok::<_, ServerError>(Arc::new(server))
            })
            .await?;
        metrics::set_lookup_handles(&self.track(), self.lookups.len().await);
        Ok(server)
    }

    /// Answer a lookup message for `epoch`
    pub async fn lookup(&self, epoch: Epoch, message: Vec<u8>) -> Result<Vec<u8>> {
        if !self.config.is_lookup_server {
            return Err(ServerError::forbidden("not a lookup server"));
        }
        let current = self.check_epoch().await?;
        if epoch > current {
            return Err(ServerError::forbidden(format!(
                "epoch {} has not started (current {})",
                epoch, current
            )));
        }

        match self.lookup_server(epoch).await {
            Ok(server) => Ok(tokio::task::spawn_blocking(move || server.process(&message)).await??),
            // no shard files here or upstream; not cached, they may still appear
            Err(ServerError::ShardUnavailable { reason, .. }) => {
                tracing::debug!(track = %self.track(), epoch, reason = %reason, "No database for epoch");
                let server = self.engine.empty_lookup(&self.epoch_config, epoch)?;
                Ok(server.process(&message)?)
            }
            Err(e) => Err(e),
        }
    }

    /// Raw shard file of a closed epoch
    pub async fn download(&self, epoch: Epoch, file: ShardFile) -> Result<Vec<u8>> {
        self.check_epoch().await?;
        let (meta, data) = self.config.shard_paths(epoch);
        let path = match file {
            ShardFile::Meta => meta,
            ShardFile::Data => data,
        };
        read_shard(&path)
            .await?
            .ok_or_else(|| ServerError::forbidden(format!("no shard file for epoch {}", epoch)))
    }

    /// Advance the simulated clock by one epoch. Returns the wall-clock
    /// epoch before and after.
    pub async fn fast_forward(&self) -> Result<(Epoch, Epoch)> {
        let mut state = self.state.lock().await;
        let old = self.wall_epoch(state.offset);
        state.offset += 1;
        self.advance(&mut state).await?;
        let new = self.wall_epoch(state.offset);
        tracing::warn!(track = %self.track(), old, new, "Debug fast-forward");
        Ok((old, new))
    }
}

/// Write the registrar's database to `meta`/`data` while holding their
/// exclusive locks
fn change_epoch<R: Registrar>(registrar: &mut R, meta: &Path, data: &Path) -> Result<Epoch> {
    let _meta_lock = FileLock::acquire_blocking(&lock_path(meta), LockMode::Exclusive)?;
    let _data_lock = FileLock::acquire_blocking(&lock_path(data), LockMode::Exclusive)?;
    Ok(registrar.epoch_change(meta, data)?)
}
