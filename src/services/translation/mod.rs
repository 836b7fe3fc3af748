// Translation capability
//
// The model behind the HTTP endpoint expects every source string tagged with
// its language ("en: hello") and tags its outputs the same way ("vi: xin
// chao"). The tags are protocol noise and never leave this module.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

use crate::core::errors::{CapabilityError, CapabilityResult};

/// Retry configuration
const MAX_RETRIES: u32 = 2;
const INITIAL_RETRY_DELAY_MS: u64 = 500;
const MAX_RETRY_DELAY_MS: u64 = 5000;

/// Sequence-to-sequence translation of a batch of strings
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `texts`, returning one string per input in the same order
    async fn translate(&self, texts: &[String]) -> CapabilityResult<Vec<String>>;
}

/// Remove a leading `"<lang>: "` tag, if present
pub fn strip_protocol_prefix<'a>(text: &'a str, lang: &str) -> &'a str {
    let trimmed = text.trim_start();
    trimmed
        .strip_prefix(lang)
        .and_then(|rest| rest.strip_prefix(':'))
        .map(str::trim_start)
        .unwrap_or(trimmed)
}

/// Translator backed by an HTTP model server taking and returning JSON string lists
pub struct HttpTranslator {
    url: String,
    source_lang: String,
    target_lang: String,
    http_client: reqwest::Client,
}

impl HttpTranslator {
    pub fn new(
        url: impl Into<String>,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
        timeout: Duration,
    ) -> CapabilityResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            url: url.into(),
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
            http_client,
        })
    }

    fn tag_inputs(&self, texts: &[String]) -> Vec<String> {
        texts
            .iter()
            .map(|t| format!("{}: {}", self.source_lang, t))
            .collect()
    }

    async fn post_once(&self, request: &[String]) -> Result<Vec<String>, (CapabilityError, bool)> {
        let response = self
            .http_client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                let retryable = e.is_timeout() || e.is_connect();
                (CapabilityError::RequestFailed(e), retryable)
            })?;

        let status = response.status();
        if !status.is_success() {
            let retryable =
                status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
            let body = response.text().await.unwrap_or_default();
            return Err((
                CapabilityError::BadStatus {
                    status: status.as_u16(),
                    body,
                },
                retryable,
            ));
        }

        response
            .json::<Vec<String>>()
            .await
            .map_err(|e| (CapabilityError::InvalidResponse(e.to_string()), false))
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    #[instrument(skip(self, texts), fields(count = texts.len()))]
    async fn translate(&self, texts: &[String]) -> CapabilityResult<Vec<String>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = self.tag_inputs(texts);
        let start = Instant::now();
        let mut retry_delay_ms = INITIAL_RETRY_DELAY_MS;

        let mut attempt = 0;
        let outputs = loop {
            match self.post_once(&request).await {
                Ok(outputs) => break outputs,
                Err((e, retryable)) if retryable && attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!(
                        "Translator: {} (retry {} after {}ms)",
                        e, attempt, retry_delay_ms
                    );
                    tokio::time::sleep(Duration::from_millis(retry_delay_ms)).await;
                    // Exponential backoff with cap
                    retry_delay_ms = (retry_delay_ms * 2).min(MAX_RETRY_DELAY_MS);
                }
                Err((e, _)) => {
                    error!("Translator: request failed after {} attempt(s): {}", attempt + 1, e);
                    return Err(e);
                }
            }
        };

        debug!(
            "Translated {} texts in {:.0}ms",
            texts.len(),
            start.elapsed().as_millis()
        );

        Ok(outputs
            .iter()
            .map(|t| strip_protocol_prefix(t, &self.target_lang).to_string())
            .collect())
    }
}
