//! The HTTP surface.
//!
//! The machine endpoints map straight onto the role engine, plus a status
//! peek for operators. Bodies are JSON on both sides, with expressions
//! carried per the language's JSON mapping (strings are source text).

use std::net::SocketAddr;

use anyhow::Context;
use axum::extract::{Extension, Path};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::daemon::{Daemon, MachineStatus};
use crate::error::Error;
use crate::lang::Value;
use crate::machine::MachineId;

#[derive(Debug, Serialize, Deserialize)]
pub struct NewMachineResponse {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    pub expression: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub expression: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendRequest {
    pub expressions: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendResponse {
    pub results: Vec<serde_json::Value>,
}

pub fn app(daemon: Daemon) -> Router {
    Router::new()
        .route("/v0/machines", post(new_machine))
        .route("/v0/machines/:id", get(status))
        .route("/v0/machines/:id/query", post(query))
        .route("/v0/machines/:id/send", post(send))
        .layer(Extension(daemon))
}

/// Binds the configured port and serves until aborted. Bind failures are
/// startup errors and surface to the caller.
pub fn start(daemon: Daemon) -> anyhow::Result<JoinHandle<()>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], daemon.config().port));
    let server = axum::Server::try_bind(&addr)
        .with_context(|| format!("binding {}", addr))?
        .serve(app(daemon).into_make_service());
    info!("HTTP endpoint listening on {}", server.local_addr());
    Ok(tokio::spawn(async move {
        if let Err(err) = server.await {
            error!("http server exited: {}", err);
        }
    }))
}

#[tracing::instrument(skip_all)]
async fn new_machine(
    Extension(daemon): Extension<Daemon>,
) -> Result<Json<NewMachineResponse>, Error> {
    let id = daemon.new_machine().await?;
    Ok(Json(NewMachineResponse { id: id.to_string() }))
}

#[tracing::instrument(skip_all)]
async fn status(
    Extension(daemon): Extension<Daemon>,
    Path(id): Path<String>,
) -> Result<Json<MachineStatus>, Error> {
    let status = daemon.status(&MachineId::new(id)).await?;
    Ok(Json(status))
}

#[tracing::instrument(skip_all)]
async fn query(
    Extension(daemon): Extension<Daemon>,
    Path(id): Path<String>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, Error> {
    let id = MachineId::new(id);
    let expr = Value::from_json(&request.expression)?;
    let result = daemon.query(&id, &expr).await?;
    Ok(Json(QueryResponse {
        expression: result.to_json(),
    }))
}

#[tracing::instrument(skip_all)]
async fn send(
    Extension(daemon): Extension<Daemon>,
    Path(id): Path<String>,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendResponse>, Error> {
    let id = MachineId::new(id);
    let inputs = request
        .expressions
        .iter()
        .map(Value::from_json)
        .collect::<Result<Vec<_>, _>>()?;
    let results = daemon.send(&id, inputs).await?;
    Ok(Json(SendResponse {
        results: results.iter().map(Value::to_json).collect(),
    }))
}
