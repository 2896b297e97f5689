use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::PipelineError;
use crate::models::ingest::{IngestMetadata, RejectedFile};
use crate::models::work_item::NewWorkItem;
use crate::resilience::ExecuteOptions;

pub const MAX_FILES_PER_BATCH: usize = 10;
pub const MIN_FILE_BYTES: usize = 1024;
pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_BATCH_BYTES: usize = 50 * 1024 * 1024;
pub const MAX_FILENAME_LEN: usize = 255;

/// Concurrent uploads in flight per batch.
const UPLOAD_CONCURRENCY: usize = 4;

/// How long a memoized validation verdict stays valid.
const VALIDATION_CACHE_TTL: Duration = Duration::from_secs(60);

const ALLOWED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp"];
const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// One file extracted from the multipart batch by the upload route.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Why a single file was rejected before upload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("unsupported content type `{0}`")]
    UnsupportedMime(String),

    #[error("unsupported file extension")]
    UnsupportedExtension,

    #[error("file is smaller than {MIN_FILE_BYTES} bytes")]
    TooSmall,

    #[error("file exceeds {MAX_FILE_BYTES} bytes")]
    TooLarge,

    #[error("unsafe or overlong filename")]
    UnsafeFilename,
}

/// Whole-batch failures that reject the request outright.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch contains no files")]
    Empty,

    #[error("batch exceeds {MAX_FILES_PER_BATCH} files")]
    TooManyFiles,

    #[error("batch exceeds {MAX_BATCH_BYTES} bytes in total")]
    TooLargeAggregate,

    #[error("invalid metadata: {0}")]
    Metadata(String),
}

/// Result of ingesting one batch: stored items plus per-file rejections.
/// Partial success is a first-class outcome.
#[derive(Debug)]
pub struct IngestOutcome {
    pub item_ids: Vec<Uuid>,
    pub rejected: Vec<RejectedFile>,
}

pub fn validate_file(filename: &str, content_type: &str, size: usize) -> Result<(), RejectReason> {
    if filename.is_empty()
        || filename.len() > MAX_FILENAME_LEN
        || filename.chars().any(|c| c.is_control())
        || filename.contains(['/', '\\'])
        || filename.contains("..")
    {
        return Err(RejectReason::UnsafeFilename);
    }

    if !ALLOWED_MIME_TYPES.contains(&content_type) {
        return Err(RejectReason::UnsupportedMime(content_type.to_string()));
    }

    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(RejectReason::UnsupportedExtension);
    }

    if size < MIN_FILE_BYTES {
        return Err(RejectReason::TooSmall);
    }
    if size > MAX_FILE_BYTES {
        return Err(RejectReason::TooLarge);
    }

    Ok(())
}

/// Batch-level admission checks that reject the whole request.
pub fn validate_batch(files: &[UploadedFile], metadata: &IngestMetadata) -> Result<(), BatchError> {
    if files.is_empty() {
        return Err(BatchError::Empty);
    }
    if files.len() > MAX_FILES_PER_BATCH {
        return Err(BatchError::TooManyFiles);
    }
    let total: usize = files.iter().map(|f| f.bytes.len()).sum();
    if total > MAX_BATCH_BYTES {
        return Err(BatchError::TooLargeAggregate);
    }
    metadata
        .validate()
        .map_err(|e| BatchError::Metadata(e.to_string()))?;
    Ok(())
}

/// Keep only characters safe to embed in an object key.
fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Upload a validated batch: fan out object-storage writes with bounded
/// parallelism, then insert one pending work item per stored photo in a
/// single batched statement.
///
/// One file failing never aborts its siblings; upload failures join the
/// rejected list with a reason. Recognition is never called here.
pub async fn ingest(
    state: &AppState,
    files: Vec<UploadedFile>,
    metadata: IngestMetadata,
    owner_label: &str,
) -> Result<IngestOutcome, PipelineError> {
    let batch_id = Uuid::new_v4();
    let mut rejected = Vec::new();
    let mut accepted = Vec::new();

    for file in files {
        // Memoize verdicts so a client re-sending the same batch after a
        // partial failure skips re-validation.
        let cache_key = format!("{}:{}:{}", file.filename, file.content_type, file.bytes.len());
        let verdict = match state.validation_cache.get(&cache_key) {
            Some(v) => v,
            None => {
                let v = validate_file(&file.filename, &file.content_type, file.bytes.len()).err();
                state
                    .validation_cache
                    .insert(&cache_key, v.clone(), VALIDATION_CACHE_TTL);
                v
            }
        };

        match verdict {
            None => accepted.push(file),
            Some(reason) => {
                metrics::counter!("ingest_files_rejected_total").increment(1);
                rejected.push(RejectedFile {
                    filename: file.filename,
                    reason: reason.to_string(),
                });
            }
        }
    }

    tracing::info!(
        batch_id = %batch_id,
        accepted = accepted.len(),
        rejected = rejected.len(),
        zone = %metadata.zone,
        "starting upload fan-out"
    );

    let uploads = accepted.into_iter().enumerate().map(|(index, file)| {
        let state = state.clone();
        let metadata = metadata.clone();
        let owner = owner_label.to_string();
        async move {
            let object_key = format!(
                "photos/{}/{}_{}",
                batch_id,
                index,
                sanitize_filename(&file.filename)
            );
            let storage = state.storage.clone();
            let bytes = Arc::new(file.bytes);
            let content_type = file.content_type.clone();
            let upload_key = object_key.clone();

            let result = state
                .executor
                .execute(
                    &format!("upload_{}_{}", batch_id, index),
                    ExecuteOptions {
                        max_retries: Some(3),
                        timeout: Some(Duration::from_secs(30)),
                        ..Default::default()
                    },
                    move || {
                        let storage = storage.clone();
                        let bytes = bytes.clone();
                        let content_type = content_type.clone();
                        let key = upload_key.clone();
                        async move {
                            storage
                                .put(&key, &bytes, &content_type)
                                .await
                                .map_err(PipelineError::from)
                        }
                    },
                )
                .await;

            match result {
                Ok(()) => Ok(NewWorkItem {
                    image_key: object_key,
                    zone: metadata.zone.clone(),
                    comment: metadata.comment.clone(),
                    owner_label: owner,
                    group_label: metadata.group_label.clone(),
                }),
                Err(e) => Err((file.filename, e)),
            }
        }
    });

    let results: Vec<Result<NewWorkItem, (String, PipelineError)>> = stream::iter(uploads)
        .buffer_unordered(UPLOAD_CONCURRENCY)
        .collect()
        .await;

    let mut new_items = Vec::new();
    for result in results {
        match result {
            Ok(item) => new_items.push(item),
            Err((filename, e)) => {
                metrics::counter!("ingest_files_rejected_total").increment(1);
                tracing::warn!(batch_id = %batch_id, file = %filename, error = %e, "upload failed");
                rejected.push(RejectedFile {
                    filename,
                    reason: format!("upload failed: {e}"),
                });
            }
        }
    }

    // Single batched insert; a total datastore failure here is the only hard
    // error the caller sees. Objects already stored for this batch would be
    // unreachable without a row, so delete them before surfacing the error.
    let item_ids = match crate::db::queries::insert_work_items(&state.db, &new_items).await {
        Ok(ids) => ids,
        Err(e) => {
            for item in &new_items {
                if let Err(del_err) = state.storage.delete(&item.image_key).await {
                    tracing::warn!(
                        batch_id = %batch_id,
                        key = %item.image_key,
                        error = %del_err,
                        "failed to clean up stored object after insert failure"
                    );
                }
            }
            return Err(e.into());
        }
    };
    metrics::counter!("ingest_files_accepted_total").increment(item_ids.len() as u64);

    tracing::info!(
        batch_id = %batch_id,
        queued = item_ids.len(),
        rejected = rejected.len(),
        "batch enqueued"
    );

    Ok(IngestOutcome { item_ids, rejected })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_normal_jpeg() {
        assert!(validate_file("car.jpg", "image/jpeg", 50_000).is_ok());
    }

    #[test]
    fn rejects_unsupported_mime() {
        assert_eq!(
            validate_file("car.gif", "image/gif", 50_000),
            Err(RejectReason::UnsupportedMime("image/gif".into()))
        );
    }

    #[test]
    fn rejects_extension_mismatch() {
        assert_eq!(
            validate_file("car.tiff", "image/jpeg", 50_000),
            Err(RejectReason::UnsupportedExtension)
        );
    }

    #[test]
    fn rejects_size_bounds() {
        assert_eq!(
            validate_file("car.jpg", "image/jpeg", 512),
            Err(RejectReason::TooSmall)
        );
        assert_eq!(
            validate_file("car.jpg", "image/jpeg", MAX_FILE_BYTES + 1),
            Err(RejectReason::TooLarge)
        );
    }

    #[test]
    fn rejects_path_traversal_names() {
        assert_eq!(
            validate_file("../etc/passwd.jpg", "image/jpeg", 50_000),
            Err(RejectReason::UnsafeFilename)
        );
        assert_eq!(
            validate_file("a\\b.jpg", "image/jpeg", 50_000),
            Err(RejectReason::UnsafeFilename)
        );
        let long_name = format!("{}.jpg", "x".repeat(300));
        assert_eq!(
            validate_file(&long_name, "image/jpeg", 50_000),
            Err(RejectReason::UnsafeFilename)
        );
    }

    #[test]
    fn batch_limits_are_enforced() {
        let file = |n: usize| UploadedFile {
            filename: format!("f{n}.jpg"),
            content_type: "image/jpeg".into(),
            bytes: vec![0; 2048],
        };
        let metadata = IngestMetadata {
            zone: "lot-a".into(),
            ..Default::default()
        };

        assert!(matches!(
            validate_batch(&[], &metadata),
            Err(BatchError::Empty)
        ));

        let too_many: Vec<_> = (0..11).map(file).collect();
        assert!(matches!(
            validate_batch(&too_many, &metadata),
            Err(BatchError::TooManyFiles)
        ));

        let ok: Vec<_> = (0..3).map(file).collect();
        assert!(validate_batch(&ok, &metadata).is_ok());
    }

    #[test]
    fn empty_zone_fails_metadata_validation() {
        let files = vec![UploadedFile {
            filename: "f.jpg".into(),
            content_type: "image/jpeg".into(),
            bytes: vec![0; 2048],
        }];
        let metadata = IngestMetadata {
            zone: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            validate_batch(&files, &metadata),
            Err(BatchError::Metadata(_))
        ));
    }

    #[test]
    fn sanitizes_object_key_characters() {
        assert_eq!(sanitize_filename("my car (1).jpg"), "my_car__1_.jpg");
    }
}
