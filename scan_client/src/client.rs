use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use reqwest::{header::CONTENT_TYPE, Client};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    config::ClientConfig,
    encoder::MultipartPayload,
    error::{ClientError, Result},
    projection::HeatmapReference,
    AnalyzeResponse,
};

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn analyze(&self, payload: &MultipartPayload) -> Result<AnalyzeResponse>;
}

pub struct AnalysisClient {
    client: Client,
    config: ClientConfig,
}

impl AnalysisClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(config.timeout).build()?,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// `POST /analyze`, retrying connection failures inside the configured
    /// retry window.
    pub async fn submit(&self, payload: &MultipartPayload) -> Result<AnalyzeResponse> {
        if self.config.retry_window.is_zero() {
            return self.submit_once(payload).await;
        }

        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.config.retry_window),
            ..ExponentialBackoff::default()
        };
        retry(backoff, || async move {
            self.submit_once(payload).await.map_err(|e| {
                if e.is_retryable() {
                    warn!(error = %e, "backend unreachable, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    async fn submit_once(&self, payload: &MultipartPayload) -> Result<AnalyzeResponse> {
        let url = self.config.analyze_url();
        debug!(%url, file = payload.file_name(), bytes = payload.bytes().len(), "submitting scan");

        let res = self
            .client
            .post(url)
            .multipart(payload.to_form()?)
            .send()
            .await
            .map_err(ClientError::from_transport)?;

        let status = res.status();
        if !status.is_success() {
            let detail = res
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| body["error"].as_str().map(str::to_string));
            warn!(%status, detail = detail.as_deref().unwrap_or("-"), "analysis rejected");
            return Err(ClientError::Status { status, detail });
        }

        let body = res.bytes().await.map_err(ClientError::from_transport)?;
        let value: Value =
            serde_json::from_slice(&body).map_err(|e| ClientError::Decode(e.to_string()))?;
        let response = AnalyzeResponse::from_value(&value);
        info!(
            prediction = response.prediction.as_deref().unwrap_or("-"),
            artifact = response.artifact_name().as_deref().unwrap_or("-"),
            "analysis received"
        );
        Ok(response)
    }

    /// `GET /files/{artifact}?t=..`. Anything but a 2xx image is an error.
    pub async fn fetch_heatmap(&self, heatmap: &HeatmapReference) -> Result<Vec<u8>> {
        let res = self
            .client
            .get(heatmap.url().clone())
            .send()
            .await
            .map_err(ClientError::from_transport)?;

        let status = res.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status,
                detail: None,
            });
        }

        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("image/") {
            return Err(ClientError::NotAnImage(content_type));
        }

        let bytes = res.bytes().await.map_err(ClientError::from_transport)?;
        debug!(artifact = heatmap.artifact_name(), bytes = bytes.len(), "heatmap fetched");
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl InferenceBackend for AnalysisClient {
    async fn analyze(&self, payload: &MultipartPayload) -> Result<AnalyzeResponse> {
        self.submit(payload).await
    }
}
