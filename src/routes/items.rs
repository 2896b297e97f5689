use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::ingest::ItemStatusResponse;
use crate::services::processing;

/// GET /api/v1/photos/{id} — look up one work item.
pub async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ItemStatusResponse>, StatusCode> {
    let item = queries::get_work_item(&state.db, id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(ItemStatusResponse {
        id: item.id,
        status: item.status.to_string(),
        result: item.result,
        image_url: state.storage.public_url(&item.image_key),
        zone: item.zone,
        created_at: item.created_at,
    }))
}

/// POST /api/v1/photos/{id}/retry — operator reset of an item back to
/// pending, from `error` or from a stuck `processing`. 409 otherwise.
pub async fn retry_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let reset = processing::retry_item(&state, id)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    if !reset {
        return Err((
            StatusCode::CONFLICT,
            "item is not in a retryable state".to_string(),
        ));
    }

    Ok(Json(serde_json::json!({
        "id": id,
        "status": "pending",
        "message": "item queued for reprocessing",
    })))
}
