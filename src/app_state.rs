use sqlx::PgPool;
use std::sync::Arc;

use crate::resilience::{BoundedCache, RateLimiter, ResilientExecutor};
use crate::services::ingest::RejectReason;
use crate::services::{
    recognition::RecognitionClient, storage::ObjectStore, trigger::TriggerDispatcher,
};

/// Shared application state passed to all route handlers.
///
/// Explicitly constructed and injected rather than held in globals, so tests
/// get fresh resilience primitives per instance.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub storage: Arc<ObjectStore>,
    pub recognizer: Arc<RecognitionClient>,
    pub executor: Arc<ResilientExecutor>,
    pub rate_limiter: Arc<RateLimiter>,
    pub validation_cache: Arc<BoundedCache<Option<RejectReason>>>,
    pub trigger: Arc<TriggerDispatcher>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        storage: ObjectStore,
        recognizer: RecognitionClient,
        executor: Arc<ResilientExecutor>,
        rate_limiter: RateLimiter,
        validation_cache: BoundedCache<Option<RejectReason>>,
        trigger: TriggerDispatcher,
    ) -> Self {
        Self {
            db,
            storage: Arc::new(storage),
            recognizer: Arc::new(recognizer),
            executor,
            rate_limiter: Arc::new(rate_limiter),
            validation_cache: Arc::new(validation_cache),
            trigger: Arc::new(trigger),
        }
    }
}
