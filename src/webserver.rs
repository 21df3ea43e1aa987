use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::service::Indexer;

#[derive(Debug, Deserialize)]
struct IndexRequest {
    paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RemoveParams {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    path: Option<String>,
    content: Option<String>,
}

/// Serve the index API until the process is stopped. The indexer must be
/// running in service mode; handlers only enqueue work and read snapshots.
pub async fn serve(indexer: Arc<Indexer>, port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!(%addr, "serving index API");
    axum::Server::bind(&addr)
        .serve(router(indexer).into_make_service())
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
}

pub fn router(indexer: Arc<Indexer>) -> Router {
    Router::new()
        .route("/i", post(add_index).delete(delete_index))
        .route("/q", get(query_index))
        .route("/i/refresh", post(refresh_index))
        .with_state(indexer)
}

async fn add_index(
    State(indexer): State<Arc<Indexer>>,
    Json(request): Json<IndexRequest>,
) -> Json<Value> {
    for path in request.paths {
        indexer.index(path, false);
    }
    Json(json!({ "result": "ok" }))
}

async fn delete_index(
    State(indexer): State<Arc<Indexer>>,
    Query(params): Query<RemoveParams>,
) -> Result<Json<Value>, StatusCode> {
    let path = params
        .path
        .filter(|p| !p.is_empty())
        .ok_or(StatusCode::BAD_REQUEST)?;
    indexer.remove(path);
    Ok(Json(json!({ "result": "ok" })))
}

async fn query_index(
    State(indexer): State<Arc<Indexer>>,
    Query(params): Query<QueryParams>,
) -> Result<Json<Value>, StatusCode> {
    let path = params.path.filter(|p| !p.is_empty());
    let content = params.content.filter(|c| !c.is_empty());

    let query = indexer
        .query(path.as_deref(), content.as_deref(), true, false)
        .map_err(|err| {
            warn!(%err, "rejecting query");
            StatusCode::BAD_REQUEST
        })?;
    let hits = query.all(None).map_err(|err| {
        warn!(%err, "query failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let paths: Vec<String> = hits
        .into_iter()
        .map(|hit| hit.path.display().to_string())
        .collect();
    Ok(Json(json!({ "result": paths })))
}

async fn refresh_index(State(indexer): State<Arc<Indexer>>) -> Result<Json<Value>, StatusCode> {
    indexer.refresh_cache().map_err(|err| {
        warn!(%err, "refresh failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(json!({ "result": "ok" })))
}
