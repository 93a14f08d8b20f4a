//! DP5 server implementation

use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use dp5_core::{Clock, ServerEngine, SystemClock};
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::manager::EpochManager;
use crate::routes::create_router;

/// One track's registration and/or lookup server
pub struct Dp5Server<E: ServerEngine> {
    manager: Arc<EpochManager<E>>,
    addr: SocketAddr,
    prometheus: Option<PrometheusHandle>,
}

impl<E: ServerEngine> Dp5Server<E> {
    pub fn router(&self) -> Router {
        create_router(self.manager.clone(), self.prometheus.clone())
    }

    /// Get the epoch manager for testing
    pub fn manager(&self) -> Arc<EpochManager<E>> {
        self.manager.clone()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run the server until the process is stopped
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let ticker = tokio::spawn(roll_epochs(self.manager.clone()));

        tracing::info!(addr = %self.addr, track = %self.manager.track(), "Starting DP5 server");

        let listener = TcpListener::bind(self.addr).await?;
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Internal(e.to_string()));

        ticker.abort();
        served
    }
}

/// Roll the registration database over at each epoch boundary even when
/// no request arrives to trigger it
async fn roll_epochs<E: ServerEngine>(manager: Arc<EpochManager<E>>) {
    let mut interval = tokio::time::interval(
        (manager.epoch_config().epoch_length() / 4).max(std::time::Duration::from_millis(100)),
    );
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = manager.check_epoch().await {
            tracing::error!(error = %e, "Epoch check failed");
        }
    }
}

/// Builder for Dp5Server
pub struct ServerBuilder<E: ServerEngine> {
    engine: E,
    config: ServerConfig,
    addr: SocketAddr,
    clock: Arc<dyn Clock>,
    prometheus: Option<PrometheusHandle>,
}

impl<E: ServerEngine> ServerBuilder<E> {
    pub fn new(engine: E, config: ServerConfig) -> Self {
        Self {
            engine,
            config,
            addr: ([127, 0, 0, 1], 8443).into(),
            clock: Arc::new(SystemClock),
            prometheus: None,
        }
    }

    pub fn addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.addr = ([0, 0, 0, 0], port).into();
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Serve `/metrics` from this recorder
    pub fn prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub fn build(self) -> Result<Dp5Server<E>> {
        let manager = EpochManager::new(self.engine, self.config, self.clock)?;
        Ok(Dp5Server {
            manager: Arc::new(manager),
            addr: self.addr,
            prometheus: self.prometheus,
        })
    }
}
