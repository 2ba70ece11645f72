use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use arena_backend::api;
use arena_backend::arena::Arena;
use arena_backend::config::Config;
use arena_backend::db::Database;
use arena_backend::entitlements::EntitlementCache;
use arena_backend::llm::OpenAiProvider;
use arena_backend::metrics;
use arena_backend::rate_limit::{self, RateLimiter};

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "arena-backend" }))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::load();
    metrics::register_metrics();

    let db = Database::new(&config.database_url)
        .await
        .expect("Failed to initialize database");
    let db = Arc::new(db);

    let provider = OpenAiProvider::from_config(&config)
        .expect("Failed to initialize completion client (is OPENAI_API_KEY set?)");
    let arena = Arc::new(Arena::new(Arc::new(provider), db.clone()));

    let rate_limiter = RateLimiter::new();
    let entitlement_cache = EntitlementCache::new();

    // Spawn the best-effort counter GC; admission checks never wait on it.
    rate_limit::spawn_cleanup_task(rate_limiter.clone());

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(api::router(
            db,
            arena,
            rate_limiter,
            entitlement_cache,
            config.admin_token.clone(),
        ))
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!("Arena backend listening on port {}", config.port);
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
