//! API route definitions.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use crate::report::severity_counts;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/problems", get(list_problems))
        .route("/summary", get(summary))
        .route("/stats", get(stats))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let (healthy, last_check) = state.orchestrator.health().await;
    Json(json!({
        "data": {
            "status": if healthy { "ok" } else { "degraded" },
            "backend": state.backend_url,
            "last_check": last_check,
        },
        "meta": meta()
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ProblemsQuery {
    sort: Option<String>,
}

async fn list_problems(
    State(state): State<AppState>,
    Query(q): Query<ProblemsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let orch = &state.orchestrator;
    let problems = match q.sort.as_deref().unwrap_or("score") {
        "score" => orch.problems().await,
        "recent" => orch.problems_by_recency().await,
        "count" => orch.problems_by_count().await,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": format!("unknown sort {other:?}, expected score, recent or count")
                })),
            ))
        }
    };
    let total = problems.len();
    Ok(Json(json!({
        "data": problems,
        "meta": { "total": total, "timestamp": chrono::Utc::now().to_rfc3339() }
    })))
}

async fn summary(State(state): State<AppState>) -> Json<Value> {
    let counts = severity_counts(&state.orchestrator.summary().await);
    Json(json!({ "data": counts, "meta": meta() }))
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    let orch = &state.orchestrator;
    let health = orch.health_stats().await;
    let rules = orch.registry().count().await;
    let problems = orch.store().len().await;
    Json(json!({
        "data": {
            "health": health,
            "rules": rules,
            "problems": problems,
            "refresh_interval_secs": state.refresh_interval.as_secs(),
        },
        "meta": meta()
    }))
}
