use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::PipelineError;

/// Fixed extraction instruction sent with every photo.
const EXTRACTION_PROMPT: &str = concat!(
    "Read the vehicle license plate or VIN visible in this photo. ",
    "Respond with the identifier text only, nothing else. ",
    "If no plate or VIN is readable, respond with exactly NONE."
);

/// Client for the external vision-model recognition service.
///
/// The service is a black box with variable latency; the caller wraps calls
/// in the executor for retry and circuit-breaking. Content-safety rejections
/// come back as [`RecognitionError::Rejected`] and must not be retried.
pub struct RecognitionClient {
    http: Client,
    endpoint: String,
    api_token: String,
}

#[derive(Deserialize)]
struct RecognizeResponse {
    result: RecognizeResult,
}

#[derive(Deserialize)]
struct RecognizeResult {
    text: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

impl RecognitionClient {
    pub fn new(endpoint: &str, api_token: &str) -> Result<Self, RecognitionError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(45))
            .build()
            .map_err(RecognitionError::Http)?;

        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            api_token: api_token.to_string(),
        })
    }

    /// Send one photo for identifier extraction.
    ///
    /// Returns `Ok(None)` when the service reports nothing readable.
    pub async fn recognize(
        &self,
        image_bytes: &[u8],
        mime_type: &str,
    ) -> Result<Option<String>, RecognitionError> {
        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image_bytes),
            "mime_type": mime_type,
            "prompt": EXTRACTION_PROMPT,
            "max_tokens": 64
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await
            .map_err(RecognitionError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body: ApiErrorBody = response.json().await.unwrap_or(ApiErrorBody {
                message: String::new(),
            });
            if status.is_server_error() {
                return Err(RecognitionError::Unavailable {
                    status: status.as_u16(),
                    message: body.message,
                });
            }
            return Err(RecognitionError::Rejected {
                status: status.as_u16(),
                message: body.message,
            });
        }

        let parsed: RecognizeResponse = response.json().await.map_err(RecognitionError::Http)?;
        let text = parsed.result.text.trim().to_string();
        if text.is_empty() || text.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        Ok(Some(text))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// 5xx-class service failure; transient.
    #[error("recognition service unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },

    /// 4xx-class rejection, including content-safety refusals. Terminal.
    #[error("recognition request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl From<RecognitionError> for PipelineError {
    fn from(e: RecognitionError) -> Self {
        match &e {
            RecognitionError::Rejected { .. } => PipelineError::Recognition(e.to_string()),
            RecognitionError::Unavailable { .. } => PipelineError::Transient(e.to_string()),
            RecognitionError::Http(inner) => {
                if inner.is_timeout() || inner.is_connect() {
                    PipelineError::Transient(e.to_string())
                } else {
                    PipelineError::Recognition(e.to_string())
                }
            }
        }
    }
}
