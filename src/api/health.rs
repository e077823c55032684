use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServingStatus {
    Serving,
    NotServing,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub status: ServingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: ServingStatus,
    pub components: Vec<ComponentHealth>,
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub status: &'static str,
    pub timestamp: chrono::DateTime<Utc>,
}

/// GET /api/health — aggregated component status.
pub async fn check(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut components = Vec::new();

    components.push(ComponentHealth {
        name: "cache",
        status: if state.store.ping() {
            ServingStatus::Serving
        } else {
            ServingStatus::NotServing
        },
        message: None,
    });

    components.push(match state.vectors.health_check().await {
        Ok(()) => ComponentHealth {
            name: "vector_store",
            status: ServingStatus::Serving,
            message: None,
        },
        Err(err) => ComponentHealth {
            name: "vector_store",
            status: ServingStatus::NotServing,
            message: Some(err.to_string()),
        },
    });

    components.push(match state.lexical.health_check().await {
        Ok(()) => ComponentHealth {
            name: "text_search",
            status: ServingStatus::Serving,
            message: None,
        },
        Err(err) => ComponentHealth {
            name: "text_search",
            status: ServingStatus::NotServing,
            message: Some(err.to_string()),
        },
    });

    let status = if components
        .iter()
        .all(|c| c.status == ServingStatus::Serving)
    {
        ServingStatus::Serving
    } else {
        ServingStatus::NotServing
    };

    Json(HealthResponse { status, components })
}

/// GET /api/ping — liveness only.
pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        status: "ok",
        timestamp: Utc::now(),
    })
}
