use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata fields accompanying a batch upload.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct IngestMetadata {
    /// Where on the lot the photos were taken. Required, non-empty.
    #[garde(length(min = 1, max = 120))]
    pub zone: String,

    #[garde(length(max = 500))]
    pub comment: Option<String>,

    /// Organizational unit (e.g. dealership) the batch belongs to.
    #[garde(length(max = 120))]
    pub group_label: Option<String>,
}

/// Per-file rejection reported back to the uploading client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedFile {
    pub filename: String,
    pub reason: String,
}

/// Response to a batch upload. Partial success is the normal case: the
/// request succeeds as long as at least one file was accepted.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub rejected: Vec<RejectedFile>,
    pub item_ids: Vec<Uuid>,
    pub message: String,
}

/// Response for querying a single work item.
#[derive(Debug, Serialize)]
pub struct ItemStatusResponse {
    pub id: Uuid,
    pub status: String,
    pub result: Option<String>,
    pub image_url: String,
    pub zone: String,
    pub created_at: DateTime<Utc>,
}

/// Counts returned by the processing endpoint.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProcessReport {
    /// Pending items selected for this invocation.
    pub selected: usize,
    /// Items this invocation claimed exclusively.
    pub claimed: usize,
    /// Items another concurrent invocation claimed first.
    pub skipped: usize,
    pub done: usize,
    pub failed: usize,
}
