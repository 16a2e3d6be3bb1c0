//! HTTP admin API for a member
//!
//! Routes:
//! - `GET /health`: member id, status and view id
//! - `GET /view`: the current view
//! - `GET /stocks`: every local entry
//! - `GET /stocks/:key`: one local entry
//! - `PUT /stocks/:key`: `{"value": f64}`, replicated set
//! - `DELETE /stocks/:key`: replicated remove
//! - `POST /stocks/:key/cas`: `{"expected": f64, "value": f64}`
//!
//! Writes answer with the per-member response set.

use crate::common::{Error, Result};
use crate::member::node::Member;
use crate::store::server::swapped;
use crate::transport::rpc::{Response as MemberResponse, ResponseSet};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug, Serialize, Deserialize)]
pub struct SetRequest {
    pub value: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CasRequest {
    pub expected: f64,
    pub value: f64,
}

/// One member's outcome, as reported to HTTP clients
#[derive(Debug, Serialize, Deserialize)]
pub struct MemberOutcome {
    pub member: String,
    pub outcome: String,
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteReport {
    pub method: String,
    pub complete: bool,
    pub responses: Vec<MemberOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swapped: Option<bool>,
}

impl WriteReport {
    fn from_set(set: &ResponseSet) -> Self {
        Self {
            method: set.method().to_string(),
            complete: set.is_complete(),
            responses: set
                .iter()
                .map(|(member, response)| MemberOutcome {
                    member: member.to_string(),
                    outcome: response.to_string(),
                    ok: matches!(response, MemberResponse::Value(_)),
                })
                .collect(),
            swapped: None,
        }
    }
}

pub fn create_router(member: Arc<Member>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/view", get(view))
        .route("/stocks", get(list_stocks))
        .route(
            "/stocks/:key",
            get(get_stock).put(put_stock).delete(delete_stock),
        )
        .route("/stocks/:key/cas", post(cas_stock))
        .layer(TraceLayer::new_for_http())
        .with_state(member)
}

/// Serve the admin API on `addr` until `shutdown` resolves.
pub async fn serve(
    member: Arc<Member>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP admin API listening on {}", addr);
    axum::serve(listener, create_router(member))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn error_response(e: Error) -> Response {
    (
        e.to_http_status(),
        axum::Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

async fn health(State(member): State<Arc<Member>>) -> impl IntoResponse {
    let status = member.status();
    let code = if status.can_read() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        axum::Json(json!({
            "member": member.id().to_string(),
            "cluster": member.cluster(),
            "status": status,
            "view": member.view().id().0,
            "coordinator": member.is_coordinator(),
            "locks_reconciling": member.locks().is_reconciling(),
        })),
    )
}

async fn view(State(member): State<Arc<Member>>) -> impl IntoResponse {
    let view = member.view();
    axum::Json(json!({
        "id": view.id().0,
        "members": view.members().iter().map(|m| m.to_string()).collect::<Vec<_>>(),
        "coordinator": view.coordinator().map(|m| m.to_string()),
    }))
}

async fn list_stocks(State(member): State<Arc<Member>>) -> Response {
    match member.stocks().all() {
        Ok(stocks) => axum::Json(stocks).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_stock(State(member): State<Arc<Member>>, Path(key): Path<String>) -> Response {
    match member.stocks().get(&key) {
        Ok(Some(value)) => axum::Json(json!({ "key": key, "value": value })).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            axum::Json(json!({ "error": format!("stock {} not found", key) })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn put_stock(
    State(member): State<Arc<Member>>,
    Path(key): Path<String>,
    axum::Json(req): axum::Json<SetRequest>,
) -> Response {
    match member.stocks().set(&key, req.value).await {
        Ok(set) => axum::Json(WriteReport::from_set(&set)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_stock(State(member): State<Arc<Member>>, Path(key): Path<String>) -> Response {
    match member.stocks().remove(&key).await {
        Ok(set) => axum::Json(WriteReport::from_set(&set)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn cas_stock(
    State(member): State<Arc<Member>>,
    Path(key): Path<String>,
    axum::Json(req): axum::Json<CasRequest>,
) -> Response {
    match member
        .stocks()
        .compare_and_swap(&key, req.expected, req.value)
        .await
    {
        Ok(set) => {
            let mut report = WriteReport::from_set(&set);
            report.swapped = Some(swapped(&set));
            axum::Json(report).into_response()
        }
        Err(e) => error_response(e),
    }
}
