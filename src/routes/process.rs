use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use crate::app_state::AppState;
use crate::models::ingest::ProcessReport;
use crate::services::processing::{self, TriggerOrigin};

/// GET /api/v1/process — pull and process a bounded batch of pending items.
///
/// Entered by the managed-function channel, the dispatcher's HTTP fallback,
/// scheduled jobs and manual operators alike; overlapping invocations are
/// safe because each item is claimed with a conditional update.
pub async fn run_processing(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ProcessReport>, (StatusCode, String)> {
    let origin = TriggerOrigin::from_header(
        headers.get("triggered-by").and_then(|v| v.to_str().ok()),
    );
    let record_count = headers
        .get("record-count")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());

    // The batch runs on its own task: if the caller disconnects (the
    // dispatcher gives up after 15s, recognition may take 60s) the claimed
    // items must still finish instead of being stranded in `processing`.
    let report = tokio::spawn(async move {
        processing::process_pending(&state, origin, record_count).await
    })
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "processing task panicked");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "processing task failed".to_string(),
        )
    })?
    .map_err(|e| {
        tracing::error!(error = %e, "processing invocation failed");
        (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;

    Ok(Json(report))
}
