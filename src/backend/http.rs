use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use super::{
    ClassifierBackend, GenerationBackend, ImageRequest, ImageResult, ImageToImageRequest,
    LabelScore, TextGenRequest, ZeroShotRequest,
};
use crate::config::BackendConfig;
use crate::error::GenerationError;

/// JSON-over-HTTP client for a generation service.
///
/// Endpoints live under the configured base URL:
/// `text-gen`, `make-image`, `image-to-image`, `depth-map`,
/// `classify-emotion`, `zero-shot`.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Deserialize)]
struct TextResponse {
    #[serde(default)]
    result: Option<String>,
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct EmotionResponse {
    labels: Vec<LabelScore>,
}

#[derive(Deserialize)]
struct ZeroShotResponse {
    labels: Vec<String>,
    scores: Vec<f32>,
}

impl HttpBackend {
    pub fn new(cfg: &BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("failed to build HTTP client")?;
        let api_key = match &cfg.api_key_env {
            Some(var) => Some(
                std::env::var(var)
                    .with_context(|| format!("environment variable {var} is not set"))?,
            ),
            None => None,
        };
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout: cfg.timeout,
        })
    }

    async fn post<B, R>(&self, endpoint: &str, body: &B) -> Result<R, GenerationError>
    where
        B: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        let status = response.status();
        debug!(endpoint, status = status.as_u16(), "backend responded");
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, text));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| self.transport_error(err))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| GenerationError::MalformedResponse(format!("{endpoint}: {err}")))
    }

    fn transport_error(&self, err: reqwest::Error) -> GenerationError {
        if err.is_timeout() {
            GenerationError::Timeout(self.timeout)
        } else {
            GenerationError::BackendUnavailable(err.to_string())
        }
    }

    async fn image<B>(&self, endpoint: &str, body: &B) -> Result<ImageResult, GenerationError>
    where
        B: Serialize + Sync + ?Sized,
    {
        let response: ImageResponse = self.post(endpoint, body).await?;
        match response.url {
            Some(url) if !url.trim().is_empty() => Ok(ImageResult { url }),
            _ => Err(GenerationError::NoResult),
        }
    }
}

fn status_error(status: StatusCode, body: String) -> GenerationError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };
    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::UNPROCESSABLE_ENTITY
        | StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS => GenerationError::ContentRejected(detail),
        _ => GenerationError::BackendUnavailable(detail),
    }
}

fn zip_scores(response: ZeroShotResponse) -> Result<Vec<LabelScore>, GenerationError> {
    if response.labels.len() != response.scores.len() {
        return Err(GenerationError::MalformedResponse(format!(
            "zero-shot returned {} labels but {} scores",
            response.labels.len(),
            response.scores.len()
        )));
    }
    Ok(response
        .labels
        .into_iter()
        .zip(response.scores)
        .map(|(label, score)| LabelScore { label, score })
        .collect())
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    async fn text_gen(&self, request: TextGenRequest) -> Result<String, GenerationError> {
        let response: TextResponse = self.post("text-gen", &request).await?;
        match response.result {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(GenerationError::NoResult),
        }
    }

    async fn make_image(&self, request: ImageRequest) -> Result<ImageResult, GenerationError> {
        self.image("make-image", &request).await
    }

    async fn image_to_image(
        &self,
        request: ImageToImageRequest,
    ) -> Result<ImageResult, GenerationError> {
        self.image("image-to-image", &request).await
    }

    async fn depth_map(&self, image_url: &str) -> Result<ImageResult, GenerationError> {
        self.image("depth-map", &json!({ "image": image_url })).await
    }
}

#[async_trait]
impl ClassifierBackend for HttpBackend {
    async fn classify_emotion(&self, text: &str) -> Result<Vec<LabelScore>, GenerationError> {
        let response: EmotionResponse = self
            .post("classify-emotion", &json!({ "text": text }))
            .await?;
        Ok(response.labels)
    }

    async fn zero_shot(
        &self,
        request: ZeroShotRequest,
    ) -> Result<Vec<LabelScore>, GenerationError> {
        let response: ZeroShotResponse = self.post("zero-shot", &request).await?;
        zip_scores(response)
    }
}
