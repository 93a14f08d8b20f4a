//! dp5-server: DP5 registration and lookup server
//!
//! One process serves one track. As a registration server it accepts
//! registrations for the open epoch and writes that epoch's database to
//! a pair of shard files when the epoch closes. As a lookup server it
//! answers PIR lookups for closed epochs, downloading shard files from
//! its upstream registration server on first use.

pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod shard_fetch;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use manager::{EpochManager, StatusResponse};
pub use routes::create_router;
pub use server::{Dp5Server, ServerBuilder};
pub use shard_fetch::ShardFile;
