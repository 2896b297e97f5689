use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use crate::app_state::AppState;
use crate::models::ingest::{IngestMetadata, IngestResponse};
use crate::services::ingest::{self, UploadedFile};
use crate::services::trigger::TriggerContext;

/// POST /api/v1/photos — multipart batch upload.
///
/// Returns 200 with partial-success counts as long as at least one file was
/// stored and enqueued; 4xx only when nothing succeeded. The processing
/// trigger is fired after the response is decided, never awaited.
pub async fn upload_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<IngestResponse>), (StatusCode, Json<serde_json::Value>)> {
    let identifier = client_identifier(&headers);
    if !state.rate_limiter.is_allowed(&identifier) {
        return Err(error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate limit exceeded, try again later",
        ));
    }

    let mut files = Vec::new();
    let mut metadata = IngestMetadata::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "malformed multipart body"))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("photo") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(|_| {
                    error_response(StatusCode::BAD_REQUEST, "failed to read file part")
                })?;
                files.push(UploadedFile {
                    filename,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            Some("zone") => {
                metadata.zone = read_text(field).await?;
            }
            Some("comment") => {
                metadata.comment = Some(read_text(field).await?).filter(|s| !s.is_empty());
            }
            Some("group_label") => {
                metadata.group_label = Some(read_text(field).await?).filter(|s| !s.is_empty());
            }
            _ => {}
        }
    }

    ingest::validate_batch(&files, &metadata)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, &e.to_string()))?;

    let owner_label = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();

    // Uploads and the enqueue run on their own task so a client that hangs
    // up mid-response cannot cancel half a batch after objects were stored.
    let outcome = {
        let state = state.clone();
        let owner = owner_label.clone();
        tokio::spawn(async move { ingest::ingest(&state, files, metadata, &owner).await })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "ingest task panicked");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "ingest task failed")
            })?
            .map_err(|e| {
                tracing::error!(error = %e, "batch ingest failed");
                error_response(StatusCode::SERVICE_UNAVAILABLE, "failed to enqueue batch")
            })?
    };

    let accepted = outcome.item_ids.len();
    if accepted == 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "no files accepted",
                "rejected": outcome.rejected,
            })),
        ));
    }

    // Kick processing out-of-band; the client response never waits on it.
    state.trigger.dispatch(TriggerContext {
        triggered_by: "upload".to_string(),
        user_id: Some(owner_label),
        record_count: accepted,
        request_origin: request_origin(&headers),
    });

    Ok((
        StatusCode::OK,
        Json(IngestResponse {
            accepted,
            rejected: outcome.rejected,
            item_ids: outcome.item_ids,
            message: format!("{accepted} photo(s) queued, recognition runs in the background"),
        }),
    ))
}

async fn read_text(
    field: axum::extract::multipart::Field<'_>,
) -> Result<String, (StatusCode, Json<serde_json::Value>)> {
    field
        .text()
        .await
        .map(|s| s.trim().to_string())
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "failed to read text part"))
}

/// Rate-limit identity: authenticated user when known, else client address.
fn client_identifier(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .or_else(|| headers.get("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

/// Origin of the current request, for the dispatcher's HTTP fallback.
fn request_origin(headers: &HeaderMap) -> Option<String> {
    let host = headers.get("host")?.to_str().ok()?;
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    Some(format!("{scheme}://{host}"))
}

fn error_response(
    status: StatusCode,
    message: &str,
) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message })))
}
