use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use image::ImageFormat;

use crate::app_state::AppState;
use crate::db::queries;
use crate::error::PipelineError;
use crate::models::ingest::ProcessReport;
use crate::models::work_item::{ReasonCode, WorkItem, WorkItemStatus};
use crate::resilience::ExecuteOptions;
use crate::services::trigger::TriggerContext;

/// Items recognized concurrently within one processing invocation.
const PROCESS_CONCURRENCY: usize = 4;

/// Batch bound for scheduled and manual triggers.
const DEFAULT_BATCH_LIMIT: i64 = 10;

/// Upper bound for upload-originated triggers, which may report a larger
/// record count.
const MAX_BATCH_LIMIT: i64 = 25;

/// Maximum length of a stored identifier (17-char VINs plus slack).
const MAX_RESULT_LEN: usize = 32;

const ALLOWED_FORMATS: &[ImageFormat] = &[ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::WebP];

/// Where a processing invocation came from. Only used to size the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOrigin {
    Upload,
    Scheduled,
    Manual,
}

impl TriggerOrigin {
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some("upload") => Self::Upload,
            Some("scheduled") => Self::Scheduled,
            _ => Self::Manual,
        }
    }
}

/// Batch bound per trigger origin: upload-originated triggers size to the
/// reported record count, ad hoc triggers stay small to bound latency and
/// recognition-service load.
pub fn batch_limit(origin: TriggerOrigin, record_count: Option<i64>) -> i64 {
    match origin {
        TriggerOrigin::Upload => record_count
            .unwrap_or(DEFAULT_BATCH_LIMIT)
            .clamp(1, MAX_BATCH_LIMIT),
        TriggerOrigin::Scheduled | TriggerOrigin::Manual => DEFAULT_BATCH_LIMIT,
    }
}

/// Uppercase alphanumerics only, truncated. `None` when nothing survives.
pub fn normalize_identifier(raw: &str) -> Option<String> {
    let normalized: String = raw
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .take(MAX_RESULT_LEN)
        .collect();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// One invocation of the processing endpoint: select a bounded batch of
/// pending items oldest-first, claim each exclusively, and process the
/// claimed ones concurrently.
///
/// Safe to invoke concurrently from any number of trigger paths: the
/// conditional claim guarantees every item is handled by exactly one
/// invocation; losing a claim is a silent skip, not an error.
pub async fn process_pending(
    state: &AppState,
    origin: TriggerOrigin,
    record_count: Option<i64>,
) -> Result<ProcessReport, PipelineError> {
    let limit = batch_limit(origin, record_count);
    let candidates = queries::get_pending_items(&state.db, limit).await?;

    let mut report = ProcessReport {
        selected: candidates.len(),
        ..Default::default()
    };

    let mut claimed = Vec::new();
    for item in candidates {
        if queries::claim_work_item(&state.db, item.id).await? {
            claimed.push(item);
        } else {
            tracing::debug!(item_id = %item.id, "item claimed by concurrent invocation, skipping");
            report.skipped += 1;
        }
    }
    report.claimed = claimed.len();

    let outcomes: Vec<Result<WorkItemStatus, PipelineError>> = stream::iter(
        claimed
            .into_iter()
            .map(|item| process_item(state.clone(), item)),
    )
    .buffer_unordered(PROCESS_CONCURRENCY)
    .collect()
    .await;

    for outcome in outcomes {
        match outcome {
            Ok(WorkItemStatus::Done) => report.done += 1,
            Ok(_) => report.failed += 1,
            Err(e) => {
                // Terminal update itself failed; the item stays in
                // processing and needs an operator reset.
                tracing::error!(error = %e, "failed to record terminal status");
                report.failed += 1;
            }
        }
    }

    if let Ok(backlog) = queries::count_pending(&state.db).await {
        metrics::gauge!("work_items_pending").set(backlog as f64);
    }

    tracing::info!(
        origin = ?origin,
        selected = report.selected,
        claimed = report.claimed,
        skipped = report.skipped,
        done = report.done,
        failed = report.failed,
        "processing batch finished"
    );

    Ok(report)
}

/// Process one claimed item to a terminal state. Every failure path writes
/// `error` plus a reason code; only the final status update can fail.
async fn process_item(
    state: AppState,
    item: WorkItem,
) -> Result<WorkItemStatus, PipelineError> {
    tracing::info!(item_id = %item.id, image_key = %item.image_key, "processing work item");

    let image_bytes = {
        let storage = state.storage.clone();
        let key = item.image_key.clone();
        state
            .executor
            .execute(
                &format!("download_{}", item.id),
                ExecuteOptions {
                    timeout: Some(Duration::from_secs(30)),
                    ..Default::default()
                },
                move || {
                    let storage = storage.clone();
                    let key = key.clone();
                    async move { storage.get(&key).await.map_err(PipelineError::from) }
                },
            )
            .await
    };
    let image_bytes = match image_bytes {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(item_id = %item.id, error = %e, "image download failed");
            return finish(&state, &item, WorkItemStatus::Error, ReasonCode::DownloadError).await;
        }
    };

    let format = match image::guess_format(&image_bytes) {
        Ok(f) if ALLOWED_FORMATS.contains(&f) => f,
        _ => {
            tracing::warn!(item_id = %item.id, "stored object is not an allowed image format");
            return finish(&state, &item, WorkItemStatus::Error, ReasonCode::InvalidFormat).await;
        }
    };

    let started = std::time::Instant::now();
    let recognized = {
        let recognizer = state.recognizer.clone();
        let bytes = Arc::new(image_bytes);
        let mime = format.to_mime_type().to_string();
        state
            .executor
            .execute(
                &format!("recognize_{}", item.id),
                ExecuteOptions {
                    timeout: Some(Duration::from_secs(60)),
                    ..Default::default()
                },
                move || {
                    let recognizer = recognizer.clone();
                    let bytes = bytes.clone();
                    let mime = mime.clone();
                    async move {
                        recognizer
                            .recognize(&bytes, &mime)
                            .await
                            .map_err(PipelineError::from)
                    }
                },
            )
            .await
    };
    metrics::histogram!("recognition_seconds").record(started.elapsed().as_secs_f64());

    match recognized {
        Ok(text) => {
            let result = text.as_deref().and_then(normalize_identifier);
            match result {
                Some(identifier) => {
                    tracing::info!(item_id = %item.id, identifier = %identifier, "identifier extracted");
                    metrics::counter!("work_items_completed_total").increment(1);
                    queries::finish_work_item(
                        &state.db,
                        item.id,
                        WorkItemStatus::Done,
                        Some(&identifier),
                    )
                    .await?;
                    Ok(WorkItemStatus::Done)
                }
                None => {
                    tracing::info!(item_id = %item.id, "no identifier detected");
                    metrics::counter!("work_items_completed_total").increment(1);
                    queries::finish_work_item(
                        &state.db,
                        item.id,
                        WorkItemStatus::Done,
                        Some(&ReasonCode::NoDetection.to_string()),
                    )
                    .await?;
                    Ok(WorkItemStatus::Done)
                }
            }
        }
        Err(e) => {
            tracing::warn!(item_id = %item.id, error = %e, "recognition failed");
            finish(&state, &item, WorkItemStatus::Error, ReasonCode::ProcessingError).await
        }
    }
}

async fn finish(
    state: &AppState,
    item: &WorkItem,
    status: WorkItemStatus,
    reason: ReasonCode,
) -> Result<WorkItemStatus, PipelineError> {
    metrics::counter!("work_items_failed_total").increment(1);
    queries::finish_work_item(&state.db, item.id, status, Some(&reason.to_string())).await?;
    Ok(status)
}

/// Operator retry: reset one item to pending and re-fire the trigger for
/// it. Covers errored items and items stranded in `processing` by a crash.
/// Returns `false` when the item was not in a retryable state.
pub async fn retry_item(state: &AppState, id: uuid::Uuid) -> Result<bool, PipelineError> {
    if !queries::reset_for_retry(&state.db, id).await? {
        return Ok(false);
    }

    tracing::info!(item_id = %id, "item reset to pending for retry");
    state.trigger.dispatch(TriggerContext {
        triggered_by: "retry".to_string(),
        user_id: None,
        record_count: 1,
        request_origin: None,
    });
    Ok(true)
}
