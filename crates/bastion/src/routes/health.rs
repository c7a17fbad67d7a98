//! Health check endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::time::Duration;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    /// Which backend holds challenge state
    store: &'static str,
    /// Rules in the currently active policy
    policy_rules: usize,
    /// Thresholds in the currently active policy
    policy_thresholds: usize,
    /// Registered challenge algorithms
    challenge_methods: Vec<String>,
}

/// Readiness check: the gatekeeper is healthy iff the challenge store
/// answers a round-trip. A dead store means no challenge can be issued
/// or spent, so load balancers should stop sending traffic here.
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, StatusCode> {
    if !check_store(&state).await {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let policy = state.policy.current();

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        store: if state.memory_store.is_some() {
            "memory"
        } else {
            "redis"
        },
        policy_rules: policy.bots.len(),
        policy_thresholds: policy.thresholds.len(),
        challenge_methods: crate::challenge::methods(),
    }))
}

async fn check_store(state: &AppState) -> bool {
    let write_ok = state
        .store
        .set_raw("healthz:probe", b"1".to_vec(), Duration::from_secs(5))
        .await
        .is_ok();
    write_ok && state.store.get_raw("healthz:probe").await.is_ok()
}

/// Deny-all robots.txt for deployments that want crawlers told off
/// before they ever hit a challenge.
pub async fn robots_txt() -> ([(&'static str, &'static str); 1], &'static str) {
    (
        [("Content-Type", "text/plain; charset=utf-8")],
        "User-agent: *\nDisallow: /\n",
    )
}
