use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle of a work item.
///
/// `Pending` → `Processing` happens only through the conditional claim
/// update; `Processing` → `Done`/`Error` is written by the recognition step.
/// An operator retry reset moves `Error` back to `Pending`, and also
/// `Processing` when an invocation died without writing a terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Processing,
    Done,
    Error,
}

/// Reason codes recorded in the `result` column when an item ends in a
/// non-success outcome (or succeeds with nothing readable in the photo).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    NoDetection,
    DownloadError,
    InvalidFormat,
    ProcessingError,
}

/// One vehicle photo awaiting (or having undergone) identifier recognition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub image_key: String,
    pub zone: String,
    pub comment: Option<String>,
    pub owner_label: String,
    pub group_label: Option<String>,
    pub status: WorkItemStatus,
    /// Extracted identifier text, a [`ReasonCode`] sentinel, or `NULL` while
    /// the item has not reached a terminal state.
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload produced by the upload fan-out for each stored photo.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub image_key: String,
    pub zone: String,
    pub comment: Option<String>,
    pub owner_label: String,
    pub group_label: Option<String>,
}
