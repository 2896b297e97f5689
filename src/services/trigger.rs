use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use crate::error::PipelineError;
use crate::resilience::{ExecuteOptions, ResilientExecutor};

/// Per-candidate request timeout.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Primary candidate plus at most one fallback.
const MAX_CANDIDATE_ATTEMPTS: usize = 2;

/// Context describing why processing should run, forwarded as headers so the
/// processing endpoint can size its batch.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub triggered_by: String,
    pub user_id: Option<String>,
    pub record_count: usize,
    /// Origin (scheme + host) of the request that enqueued the batch, used
    /// to derive the HTTP fallback endpoint.
    pub request_origin: Option<String>,
}

/// Fire-and-forget notifier that kicks the processing endpoint after a batch
/// is enqueued.
///
/// Dispatch failure is a latency concern, never a correctness concern:
/// pending items are durable and the next scheduled or manual trigger picks
/// them up, so every failure here is logged and swallowed.
#[derive(Clone)]
pub struct TriggerDispatcher {
    http: Client,
    executor: Arc<ResilientExecutor>,
    /// Managed-function channel URL, when configured.
    function_url: Option<String>,
    environment: String,
    local_port: u16,
}

impl TriggerDispatcher {
    pub fn new(
        executor: Arc<ResilientExecutor>,
        function_url: Option<String>,
        environment: &str,
        local_port: u16,
    ) -> Self {
        Self {
            http: Client::new(),
            executor,
            function_url,
            environment: environment.to_string(),
            local_port,
        }
    }

    /// Notify a processing endpoint on a detached task. Returns immediately;
    /// the spawned work is deliberately not tied to the caller's request
    /// scope, so client disconnects cannot cancel it.
    pub fn dispatch(&self, context: TriggerContext) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.run(context).await;
        });
    }

    async fn run(&self, context: TriggerContext) {
        let candidates = self.candidates(&context);
        if candidates.is_empty() {
            tracing::warn!("no trigger candidates available, relying on scheduled pickup");
            return;
        }

        for (attempt, url) in candidates.iter().take(MAX_CANDIDATE_ATTEMPTS).enumerate() {
            match self.call_candidate(url, &context, attempt).await {
                Ok(()) => {
                    tracing::info!(url = %url, "processing trigger dispatched");
                    return;
                }
                Err(e) => {
                    tracing::warn!(url = %url, attempt, error = %e, "trigger candidate failed");
                }
            }
        }

        tracing::warn!(
            triggered_by = %context.triggered_by,
            "all trigger candidates failed; items stay pending until next trigger"
        );
    }

    /// Ordered candidate endpoints: managed-function channel first, then the
    /// caller's own origin, then localhost outside production.
    fn candidates(&self, context: &TriggerContext) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(url) = &self.function_url {
            urls.push(url.clone());
        }
        if let Some(origin) = &context.request_origin {
            urls.push(format!("{}/api/v1/process", origin.trim_end_matches('/')));
        }
        if self.environment != "production" {
            urls.push(format!("http://127.0.0.1:{}/api/v1/process", self.local_port));
        }
        urls
    }

    async fn call_candidate(
        &self,
        url: &str,
        context: &TriggerContext,
        attempt: usize,
    ) -> Result<(), PipelineError> {
        let http = self.http.clone();
        let url = url.to_string();
        let triggered_by = context.triggered_by.clone();
        let user_id = context.user_id.clone();
        let record_count = context.record_count;

        self.executor
            .execute(
                &format!("trigger_{}_{}", triggered_by, attempt),
                ExecuteOptions {
                    max_retries: Some(1),
                    timeout: Some(DISPATCH_TIMEOUT),
                    ..Default::default()
                },
                move || {
                    let http = http.clone();
                    let url = url.clone();
                    let triggered_by = triggered_by.clone();
                    let user_id = user_id.clone();
                    async move {
                        let mut request = http
                            .get(&url)
                            .header("triggered-by", triggered_by)
                            .header("record-count", record_count.to_string())
                            .timeout(DISPATCH_TIMEOUT);
                        if let Some(user) = &user_id {
                            request = request.header("user-id", user.clone());
                        }
                        request
                            .send()
                            .await
                            .map_err(PipelineError::from)?
                            .error_for_status()
                            .map_err(PipelineError::from)?;
                        Ok(())
                    }
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::ExecutorConfig;

    fn dispatcher(function_url: Option<String>, environment: &str) -> TriggerDispatcher {
        TriggerDispatcher::new(
            Arc::new(ResilientExecutor::new(ExecutorConfig::default())),
            function_url,
            environment,
            3000,
        )
    }

    fn context(origin: Option<&str>) -> TriggerContext {
        TriggerContext {
            triggered_by: "upload".into(),
            user_id: None,
            record_count: 4,
            request_origin: origin.map(str::to_string),
        }
    }

    #[test]
    fn function_channel_comes_first() {
        let d = dispatcher(Some("https://fn.example.com/process".into()), "production");
        let urls = d.candidates(&context(Some("https://app.example.com")));
        assert_eq!(
            urls,
            vec![
                "https://fn.example.com/process".to_string(),
                "https://app.example.com/api/v1/process".to_string(),
            ]
        );
    }

    #[test]
    fn localhost_fallback_only_outside_production() {
        let d = dispatcher(None, "development");
        let urls = d.candidates(&context(None));
        assert_eq!(urls, vec!["http://127.0.0.1:3000/api/v1/process".to_string()]);

        let d = dispatcher(None, "production");
        assert!(d.candidates(&context(None)).is_empty());
    }
}
