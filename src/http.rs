//! Thin HTTP ambient layer (SPEC_FULL.md §1.5): routes requests to
//! [`RelayerCore`] and serializes its responses. No admission, scheduling,
//! wallet, or lifecycle logic lives here, mirroring the teacher's
//! `handlers.rs` being a thin wrapper over `Facilitator`.

use crate::api::RelayerCore;
use crate::intent::RawPaymentIntent;
use crate::kv::KvStore;
use crate::money::Amount;
use crate::queue::Priority;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn router<S: KvStore + 'static>(core: Arc<RelayerCore<S>>) -> Router {
    Router::new()
        .route("/intents", post(submit_intent::<S>))
        .route("/jobs/{job_id}", get(get_job_status::<S>))
        .route("/jobs/{job_id}/rollback", post(force_rollback::<S>))
        .route("/queue", get(get_queue_status::<S>))
        .route("/wallets", get(list_wallets::<S>))
        .route("/prepaid/{client_id}", get(get_prepaid_balance::<S>))
        .route("/prepaid/{client_id}/credit", post(credit_prepaid::<S>))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(core)
}

#[derive(Debug, Deserialize)]
struct SubmitIntentRequest {
    #[serde(flatten)]
    intent: RawPaymentIntent,
    #[serde(default = "default_priority")]
    priority: Priority,
}

fn default_priority() -> Priority {
    Priority::Normal
}

#[derive(Debug, Serialize)]
struct SubmitIntentResponse {
    job_id: String,
}

async fn submit_intent<S: KvStore + 'static>(
    State(core): State<Arc<RelayerCore<S>>>,
    Json(request): Json<SubmitIntentRequest>,
) -> Response {
    match core.submit_intent(request.intent, request.priority).await {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(SubmitIntentResponse { job_id })).into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, Json(err)).into_response(),
    }
}

async fn get_job_status<S: KvStore + 'static>(
    State(core): State<Arc<RelayerCore<S>>>,
    Path(job_id): Path<String>,
) -> Response {
    match core.get_job_status(&job_id).await {
        Some(status) => Json(status).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    client_id: String,
}

#[derive(Debug, Serialize)]
struct RollbackResponse {
    applied: bool,
}

async fn force_rollback<S: KvStore + 'static>(
    State(core): State<Arc<RelayerCore<S>>>,
    Path(job_id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> Response {
    let applied = core.force_rollback(&job_id, &request.client_id).await;
    Json(RollbackResponse { applied }).into_response()
}

async fn get_queue_status<S: KvStore + 'static>(State(core): State<Arc<RelayerCore<S>>>) -> Response {
    Json(core.get_queue_status().await).into_response()
}

async fn list_wallets<S: KvStore + 'static>(State(core): State<Arc<RelayerCore<S>>>) -> Response {
    let wallets: Vec<serde_json::Value> = core
        .list_wallets()
        .await
        .into_iter()
        .map(|w| {
            serde_json::json!({
                "address": format!("{:#x}", w.address),
                "balance_cached": w.balance_cached.to_string(),
                "local_nonce": w.local_nonce,
                "pending_count": w.pending_count,
                "state": format!("{:?}", w.state),
                "success_rate": w.success_rate,
                "in_flight": w.in_flight,
            })
        })
        .collect();
    Json(wallets).into_response()
}

async fn get_prepaid_balance<S: KvStore + 'static>(
    State(core): State<Arc<RelayerCore<S>>>,
    Path(client_id): Path<String>,
) -> Response {
    let balance = core.get_prepaid_balance(&client_id).await;
    Json(serde_json::json!({ "balance": balance.to_string() })).into_response()
}

#[derive(Debug, Deserialize)]
struct CreditRequest {
    amount: String,
}

async fn credit_prepaid<S: KvStore + 'static>(
    State(core): State<Arc<RelayerCore<S>>>,
    Path(client_id): Path<String>,
    Json(request): Json<CreditRequest>,
) -> Response {
    let Ok(amount) = Amount::from_str(&request.amount) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let new_balance = core.credit_prepaid(&client_id, amount).await;
    Json(serde_json::json!({ "new_balance": new_balance.to_string() })).into_response()
}
