use crate::config::QStashConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Body the delayed-delivery service posts back to `/v1/chat/flush`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushRequest {
    pub chat_id: String,
    pub flush_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub body: FlushRequest,
    /// Zero means "as soon as possible".
    pub delay: Duration,
    pub deduplication_id: String,
    pub retries: u32,
}

/// External service that invokes the flush callback after a delay, at least once,
/// collapsing requests that share a deduplication id.
#[async_trait]
pub trait DelayedDelivery: Send + Sync {
    async fn schedule(&self, request: &DeliveryRequest) -> AppResult<()>;
}

/// QStash publish API client.
pub struct QStashClient {
    http: Client,
    publish_url: String,
    token: String,
}

impl QStashClient {
    pub fn new(config: &QStashConfig) -> AppResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Config(format!("http client: {e}")))?;

        Ok(Self {
            http,
            publish_url: publish_url(&config.url, &config.backend_url),
            token: config.token.clone(),
        })
    }
}

fn publish_url(qstash_url: &str, backend_url: &str) -> String {
    format!(
        "{}/v2/publish/{}/v1/chat/flush",
        qstash_url.trim_end_matches('/'),
        backend_url.trim_end_matches('/')
    )
}

#[async_trait]
impl DelayedDelivery for QStashClient {
    async fn schedule(&self, request: &DeliveryRequest) -> AppResult<()> {
        let mut builder = self
            .http
            .post(&self.publish_url)
            .bearer_auth(&self.token)
            .header("Upstash-Deduplication-Id", &request.deduplication_id)
            .header("Upstash-Retries", request.retries.to_string())
            .json(&request.body);

        let delay_secs = request.delay.as_secs();
        if delay_secs > 0 {
            builder = builder.header("Upstash-Delay", format!("{delay_secs}s"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AppError::Scheduling(format!("qstash request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Scheduling(format!(
                "qstash responded {status}: {body}"
            )));
        }

        tracing::debug!(
            chat_id = %request.body.chat_id,
            dedup_id = %request.deduplication_id,
            delay_secs,
            "flush scheduled"
        );
        Ok(())
    }
}

/// In-memory stand-in that records every request. Can be told to fail.
#[derive(Default)]
pub struct RecordingDelivery {
    requests: Mutex<Vec<DeliveryRequest>>,
    failing: AtomicBool,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn requests(&self) -> Vec<DeliveryRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn last(&self) -> Option<DeliveryRequest> {
        self.requests.lock().await.last().cloned()
    }
}

#[async_trait]
impl DelayedDelivery for RecordingDelivery {
    async fn schedule(&self, request: &DeliveryRequest) -> AppResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Scheduling("delivery service unavailable".into()));
        }
        self.requests.lock().await.push(request.clone());
        Ok(())
    }
}
