//! HTTP routes for the DP5 server

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

use dp5_core::{Epoch, ServerEngine};

use crate::error::Result;
use crate::manager::{EpochManager, StatusResponse};
use crate::metrics::{self, ROUTE_DOWNLOAD, ROUTE_LOOKUP, ROUTE_REGISTER};
use crate::shard_fetch::ShardFile;

pub type SharedManager<E> = Arc<EpochManager<E>>;

/// `?epoch=` on register and lookup
#[derive(Debug, Deserialize)]
pub struct EpochQuery {
    pub epoch: Epoch,
}

async fn status<E: ServerEngine>(State(manager): State<SharedManager<E>>) -> Result<Json<StatusResponse>> {
    Ok(Json(manager.status().await?))
}

async fn register<E: ServerEngine>(
    State(manager): State<SharedManager<E>>,
    Query(query): Query<EpochQuery>,
    body: Bytes,
) -> Result<Response> {
    let start = Instant::now();
    let result = manager.register(query.epoch, &body).await;
    finish(ROUTE_REGISTER, &manager.track(), start, result)
}

async fn lookup<E: ServerEngine>(
    State(manager): State<SharedManager<E>>,
    Query(query): Query<EpochQuery>,
    body: Bytes,
) -> Result<Response> {
    let start = Instant::now();
    let result = manager.lookup(query.epoch, body.to_vec()).await;
    finish(ROUTE_LOOKUP, &manager.track(), start, result)
}

async fn download_data<E: ServerEngine>(
    State(manager): State<SharedManager<E>>,
    Path(epoch): Path<Epoch>,
) -> Result<Response> {
    let start = Instant::now();
    let result = manager.download(epoch, ShardFile::Data).await;
    finish(ROUTE_DOWNLOAD, &manager.track(), start, result)
}

async fn download_meta<E: ServerEngine>(
    State(manager): State<SharedManager<E>>,
    Path(epoch): Path<Epoch>,
) -> Result<Response> {
    let start = Instant::now();
    let result = manager.download(epoch, ShardFile::Meta).await;
    finish(ROUTE_DOWNLOAD, &manager.track(), start, result)
}

async fn fast_forward<E: ServerEngine>(State(manager): State<SharedManager<E>>) -> Result<String> {
    let (old, new) = manager.fast_forward().await?;
    Ok(format!("Old: {} New: {}", old, new))
}

fn finish(route: &str, track: &str, start: Instant, result: Result<Vec<u8>>) -> Result<Response> {
    let outcome = match &result {
        Ok(_) => metrics::OUTCOME_OK,
        Err(e) => e.outcome(),
    };
    metrics::record_request(route, track, outcome, start.elapsed());
    result.map(octet_stream)
}

fn octet_stream(body: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response()
}

/// Create the router. `/debugfastforward` is only mounted when the
/// configuration enables it; `/metrics` only with a Prometheus handle.
pub fn create_router<E: ServerEngine>(manager: SharedManager<E>, prometheus: Option<PrometheusHandle>) -> Router {
    let mut router = Router::new()
        .route("/", get(status::<E>))
        .route("/register", post(register::<E>))
        .route("/lookup", post(lookup::<E>))
        .route("/download/:epoch", get(download_data::<E>))
        .route("/download/:epoch/meta", get(download_meta::<E>));

    if manager.config().debug_fast_forward {
        router = router.route("/debugfastforward", get(fast_forward::<E>));
    }
    if let Some(handle) = prometheus {
        router = router.route("/metrics", get(move || async move { handle.render() }));
    }

    router.with_state(manager)
}
