use axum::extract::{Json, State};
use axum::http::StatusCode;
use diesel::prelude::*;
use serde_json::{json, Value};

use crate::index::VectorIndex as _;
use crate::jobs::queued_depth;
use crate::state::AppState;

/// Unauthenticated liveness probe. The database is load-bearing; the vector
/// index and LLM degrade the status without failing it.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let database_ok = match state.db() {
        Ok(mut conn) => diesel::sql_query("SELECT 1").execute(&mut conn).is_ok(),
        Err(_) => false,
    };

    let queue_depth = if database_ok {
        state
            .db()
            .ok()
            .and_then(|mut conn| queued_depth(&mut conn).ok())
    } else {
        None
    };

    let vector_ok = state.index.health_check().await.is_ok();
    let llm_ok = !state.config.llm_api_key.is_empty();

    let status = if !database_ok {
        "unhealthy"
    } else if vector_ok && llm_ok && queue_depth.is_some() {
        "healthy"
    } else {
        "degraded"
    };

    let code = if database_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": status,
            "checks": {
                "database": if database_ok { "ok" } else { "down" },
                "queue": match queue_depth {
                    Some(depth) => json!({ "status": "ok", "queued": depth }),
                    None => json!({ "status": "down" }),
                },
                "vector_index": if vector_ok { "ok" } else { "down" },
                "llm": if llm_ok { "configured" } else { "unconfigured" },
            },
        })),
    )
}
