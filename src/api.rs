//! HTTP API handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::StrataError;
use crate::orchestrate::MemorySignal;
use crate::retrieve::MemoryBundle;
use crate::store::{Page, TierStats};
use crate::{db_call, AppState};

/// Auth middleware: checks Bearer token if STRATA_API_KEY is configured.
async fn require_auth(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StrataError> {
    let Some(ref expected) = state.api_key else {
        return Ok(next.run(req).await);
    };

    let unauthorized = || StrataError::Unauthorized;

    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(unauthorized)?;

    let token = header.strip_prefix("Bearer ").ok_or_else(unauthorized)?;

    // constant-time comparison to prevent timing attacks
    if token.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(next.run(req).await)
    } else {
        Err(unauthorized())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    // Public routes (no auth)
    let public = Router::new()
        .route("/", get(health))
        .route("/stats", get(stats));

    // Protected routes
    let protected = Router::new()
        .route("/exchanges", post(record_exchange))
        .route("/signal", post(send_signal))
        .route("/retrieve", post(retrieve))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    public.merge(protected).with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let (hits, misses) = state.index.cache_stats();
    Json(serde_json::json!({
        "name": "strata",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "stm_capacity": state.cfg.stm_capacity,
        "workers": state.cfg.workers,
        "embed_cache": { "hits": hits, "misses": misses },
    }))
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<TierStats>, StrataError> {
    let store = state.store.clone();
    let s = db_call(move || store.stats()).await?;
    Ok(Json(s))
}

#[derive(Deserialize)]
struct ExchangeInput {
    user_id: i64,
    #[serde(default)]
    user_input: String,
    #[serde(default)]
    agent_output: String,
}

/// Record one exchange into the hot tier and nudge consolidation.
async fn record_exchange(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ExchangeInput>,
) -> Result<(StatusCode, Json<Page>), StrataError> {
    if input.user_id <= 0 {
        return Err(StrataError::Validation("user_id must be positive".into()));
    }
    if input.user_input.trim().is_empty() && input.agent_output.trim().is_empty() {
        return Err(StrataError::EmptyExchange);
    }

    let user_id = input.user_id;
    let page = {
        let store = state.store.clone();
        db_call(move || {
            let page = store.create_page(user_id, &input.user_input, &input.agent_output)?;
            store.adjust_stm_count(user_id, 1)?;
            store.invalidate_stm_cache(user_id)?;
            Ok(page)
        })
        .await?
    };

    // queue full just means consolidation is behind; the next exchange
    // will signal again
    if state.signals.try_send(MemorySignal { user_id }).is_err() {
        warn!(user_id, "signal queue full, consolidation deferred");
    }
    debug!(user_id, page_id = page.id, "exchange recorded");
    Ok((StatusCode::CREATED, Json(page)))
}

#[derive(Deserialize)]
struct SignalInput {
    user_id: i64,
}

/// Explicitly request a consolidation pass for one user.
async fn send_signal(
    State(state): State<Arc<AppState>>,
    Json(input): Json<SignalInput>,
) -> Result<(StatusCode, Json<serde_json::Value>), StrataError> {
    if input.user_id <= 0 {
        return Err(StrataError::Validation("user_id must be positive".into()));
    }
    let queued = state.signals.try_send(MemorySignal { user_id: input.user_id }).is_ok();
    if !queued {
        warn!(user_id = input.user_id, "signal queue full, request dropped");
    }
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "queued": queued }))))
}

#[derive(Deserialize)]
struct RetrieveInput {
    user_id: i64,
    query: String,
}

async fn retrieve(
    State(state): State<Arc<AppState>>,
    Json(input): Json<RetrieveInput>,
) -> Result<Json<MemoryBundle>, StrataError> {
    if input.user_id <= 0 {
        return Err(StrataError::Validation("user_id must be positive".into()));
    }
    let bundle = state.retriever.retrieve_memory(input.user_id, &input.query).await?;
    Ok(Json(bundle))
}
