//! Shard files shared between processes on one host
//!
//! Every shard file `X` has an advisory lock file `X.lock` next to it.
//! Readers hold it shared; whoever writes `X` holds it exclusive, so a
//! file is never observed half written. Downloads stream into `X.part`
//! under its own lock and only take `X.lock` for the final rename, so
//! an upstream serving the same directory is never waited on while
//! holding it. Locks are host-local: servers on different hosts may
//! each download the same file.

use nix::fcntl::{flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use dp5_core::Epoch;

use crate::error::{Result, ServerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn arg(self) -> FlockArg {
        match self {
            LockMode::Shared => FlockArg::LockShared,
            LockMode::Exclusive => FlockArg::LockExclusive,
        }
    }
}

/// Held `flock` on a lock file; released on drop
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock is held
    pub fn acquire_blocking(path: &Path, mode: LockMode) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        flock(file.as_raw_fd(), mode.arg())?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub async fn acquire(path: &Path, mode: LockMode) -> Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::acquire_blocking(&path, mode)).await?
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release file lock");
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Lock file guarding `path`
pub fn lock_path(path: &Path) -> PathBuf {
    with_suffix(path, ".lock")
}

/// Staging file a download of `path` is written to
pub fn partial_path(path: &Path) -> PathBuf {
    with_suffix(path, ".part")
}

/// Read `path` under its shared lock; `None` when absent
pub async fn read_shard(path: &Path) -> Result<Option<Vec<u8>>> {
    let _lock = FileLock::acquire(&lock_path(path), LockMode::Shared).await?;
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn is_present(path: &Path) -> Result<bool> {
    let _lock = FileLock::acquire(&lock_path(path), LockMode::Shared).await?;
    Ok(tokio::fs::try_exists(path).await?)
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial shard file");
        }
    }
}

/// Which of an epoch's two shard files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardFile {
    Meta,
    Data,
}

impl ShardFile {
    /// Route serving this file on the upstream server
    pub fn route(self, epoch: Epoch) -> String {
        match self {
            ShardFile::Meta => format!("/download/{}/meta", epoch),
            ShardFile::Data => format!("/download/{}", epoch),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetched {
    Present,
    Downloaded { bytes: u64 },
}

/// Downloads missing shard files from the upstream registration server
#[derive(Debug, Clone)]
pub struct ShardFetcher {
    http: reqwest::Client,
    upstream: Option<String>,
}

impl ShardFetcher {
    pub fn new(upstream: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            upstream: upstream.map(|u| u.trim_end_matches('/').to_string()),
        })
    }

    /// Make sure `path` holds `file` of `epoch`, downloading it if no
    /// process on this host has yet
    pub async fn ensure(&self, epoch: Epoch, file: ShardFile, path: &Path) -> Result<Fetched> {
        if is_present(path).await? {
            return Ok(Fetched::Present);
        }
        let Some(upstream) = &self.upstream else {
            return Err(ServerError::ShardUnavailable {
                epoch,
                reason: format!("{} missing and no upstream configured", path.display()),
            });
        };

        // one downloader per file on this host
        let partial = partial_path(path);
        let _fetch_lock = FileLock::acquire(&lock_path(&partial), LockMode::Exclusive).await?;
        if is_present(path).await? {
            return Ok(Fetched::Present);
        }

        let url = format!("{}{}", upstream, file.route(epoch));
        tracing::info!(url = %url, path = %path.display(), "Downloading shard file");

        let bytes = match self.download(epoch, &url, &partial).await {
            Ok(bytes) => bytes,
            Err(e) => {
                crate::metrics::record_shard_download(e.outcome());
                remove_partial(&partial).await;
                return Err(e);
            }
        };

        let _lock = FileLock::acquire(&lock_path(path), LockMode::Exclusive).await?;
        if tokio::fs::try_exists(path).await? {
            // written on this host while the download ran
            remove_partial(&partial).await;
            return Ok(Fetched::Present);
        }
        tokio::fs::rename(&partial, path).await?;

        crate::metrics::record_shard_download(crate::metrics::OUTCOME_OK);
        tracing::info!(epoch, bytes, path = %path.display(), "Shard file downloaded");
        Ok(Fetched::Downloaded { bytes })
    }

    async fn download(&self, epoch: Epoch, url: &str, partial: &Path) -> Result<u64> {
        let resp = self.http.get(url).send().await?;
        // upstream has no such file; anything else is an upstream fault
        let status = resp.status();
        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::NOT_FOUND {
            return Err(ServerError::ShardUnavailable {
                epoch,
                reason: format!("upstream answered {}", status),
            });
        }
        let mut resp = resp.error_for_status()?;

        let mut file = tokio::fs::File::create(partial).await?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;
        Ok(written)
    }
}
