// HTTP API routes (battle streaming, leaderboard, entitlements).

use axum::{
    body::{Body, Bytes},
    extract::{Json, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::arena::Arena;
use crate::db::Database;
use crate::entitlements::{generate_access_key, EntitlementCache, Tier};
use crate::metrics;
use crate::rate_limit::RateLimiter;
use crate::streaming::{encode_sse, EventSink, StageEvent};

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RunBattleParams {
    pub prompt: Option<String>,
    /// Optional access key granting a paid tier.
    pub key: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateEntitlementRequest {
    pub email: String,
    pub tier: String,
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub arena: Arc<Arena>,
    pub rate_limiter: RateLimiter,
    pub entitlement_cache: EntitlementCache,
    pub admin_token: Option<String>,
}

// ── Error helpers ─────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": msg })))
}

fn internal_error(e: sqlx::Error) -> impl IntoResponse {
    tracing::error!("Database error: {e}");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

/// Admission denials carry enough structure for the client to render an
/// upgrade prompt without a follow-up call.
fn admission_error(status: StatusCode, msg: &str, limit_reached: bool, tier: Tier) -> Response {
    (
        status,
        Json(json!({
            "error": msg,
            "limitReached": limit_reached,
            "tier": tier.as_str(),
        })),
    )
        .into_response()
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(
    db: Arc<Database>,
    arena: Arc<Arena>,
    rate_limiter: RateLimiter,
    entitlement_cache: EntitlementCache,
    admin_token: Option<String>,
) -> Router {
    let state = AppState {
        db,
        arena,
        rate_limiter,
        entitlement_cache,
        admin_token,
    };

    Router::new()
        .route("/api/run-battle", get(run_battle))
        .route("/api/battles", get(list_battles))
        .route("/api/battles/{id}", get(get_battle))
        .route("/api/leaderboard", get(leaderboard))
        .route("/api/entitlements", post(create_entitlement))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

// ── Battle streaming handler ──────────────────────────────────────────

/// Best-effort caller IP from proxy headers.
fn caller_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn run_battle(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<RunBattleParams>,
) -> Response {
    let ip = caller_ip(&headers);

    // Resolve the tier before anything else: it bounds both prompt length
    // and the daily quota.
    let tier = match &params.key {
        Some(key) => state
            .entitlement_cache
            .validate(&state.db, key)
            .await
            .map(|e| Tier::from_name(&e.tier))
            .unwrap_or(Tier::None),
        None => Tier::None,
    };
    let limits = tier.limits();

    let prompt = match params.prompt.as_deref().map(str::trim) {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => {
            return admission_error(
                StatusCode::BAD_REQUEST,
                "Missing prompt parameter",
                false,
                tier,
            )
        }
    };

    if prompt.len() > limits.max_prompt_length {
        return admission_error(
            StatusCode::BAD_REQUEST,
            &format!(
                "Prompt too long (max {} characters)",
                limits.max_prompt_length
            ),
            false,
            tier,
        );
    }

    // Counting key: the access key when present, else the caller IP.
    let counter_key = params.key.clone().unwrap_or_else(|| ip.clone());
    let admission = state.rate_limiter.check_admission(&counter_key, tier);
    if !admission.allowed {
        return admission_error(
            StatusCode::TOO_MANY_REQUESTS,
            "Daily battle limit reached",
            true,
            tier,
        );
    }

    // Admission granted: open the stream and run the battle. The sink owns
    // the only sender, so the stream closes exactly once when the battle
    // task finishes, success or failure.
    let (tx, rx) = mpsc::channel::<StageEvent>(32);
    let sink = EventSink::new(tx);
    let arena = state.arena.clone();

    tokio::spawn(async move {
        metrics::ACTIVE_BATTLES.inc();
        if let Err(e) = arena.run_battle(&prompt, sink).await {
            tracing::error!("Battle error for {ip}: {e}");
        }
        metrics::ACTIVE_BATTLES.dec();
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|event| (Ok::<_, Infallible>(Bytes::from(encode_sse(&event))), rx))
    });

    let response = Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-ratelimit-remaining", admission.remaining.to_string())
        .header("x-ratelimit-limit", admission.limit.to_string())
        .header("x-arena-tier", admission.tier.as_str())
        .body(Body::from_stream(stream));

    match response {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("Failed to build stream response: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
                .into_response()
        }
    }
}

// ── Battle history handlers ───────────────────────────────────────────

async fn list_battles(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.list_recent_battles(20).await {
        Ok(battles) => (StatusCode::OK, Json(json!({ "battles": battles }))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn get_battle(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.db.get_battle(&id).await {
        Ok(Some(battle)) => (StatusCode::OK, Json(json!(battle))).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Battle not found").into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn leaderboard(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.leaderboard(50).await {
        Ok(entries) => (StatusCode::OK, Json(json!({ "leaderboard": entries }))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

// ── Entitlement handler ───────────────────────────────────────────────

/// Create (or reuse) an entitlement. This is the boundary where the billing
/// collaborator lands: it is guarded by a shared admin token rather than
/// end-user auth, and it refreshes the validation cache so the new tier
/// takes effect promptly.
async fn create_entitlement(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateEntitlementRequest>,
) -> impl IntoResponse {
    let Some(expected) = state.admin_token.as_deref() else {
        return json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Entitlement creation is not configured",
        )
        .into_response();
    };
    let provided = headers.get("x-admin-token").and_then(|v| v.to_str().ok());
    if provided != Some(expected) {
        return json_error(StatusCode::FORBIDDEN, "Invalid admin token").into_response();
    }

    if req.email.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "email is required").into_response();
    }
    if !matches!(req.tier.as_str(), "sponsor" | "pro" | "builder") {
        return json_error(
            StatusCode::BAD_REQUEST,
            "tier must be 'sponsor', 'pro', or 'builder'",
        )
        .into_response();
    }

    let access_key = generate_access_key();
    match state
        .db
        .create_or_reuse_entitlement(&req.email, &req.tier, &access_key)
        .await
    {
        Ok(entitlement) => {
            state.entitlement_cache.clear(Some(&entitlement.access_key));
            (StatusCode::CREATED, Json(json!(entitlement))).into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

// ── Metrics handler ───────────────────────────────────────────────────

async fn metrics_text() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
