//! Generation and classification backends.
//!
//! The stage never talks to a service directly; it goes through these traits
//! so the scheduler, background director and classifier can be driven by the
//! HTTP client in production and by scripted backends in tests.

pub mod http;
pub mod testkit;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

pub use http::HttpBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AspectRatio {
    Square,
    /// 9:16, used for standing character portraits.
    WidescreenVertical,
    /// 16:9, used for backgrounds.
    WidescreenHorizontal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextGenRequest {
    pub prompt: String,
    pub min_tokens: u32,
    pub max_tokens: u32,
    pub include_history: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub aspect_ratio: AspectRatio,
    pub remove_background: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageToImageRequest {
    /// URL of the base image being edited.
    pub image: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub strength: f32,
    pub aspect_ratio: AspectRatio,
    pub remove_background: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageResult {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LabelScore {
    pub label: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZeroShotRequest {
    pub sequence: String,
    pub candidate_labels: Vec<String>,
    pub hypothesis_template: String,
}

/// Text and image generation service.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn text_gen(&self, request: TextGenRequest) -> Result<String, GenerationError>;

    async fn make_image(&self, request: ImageRequest) -> Result<ImageResult, GenerationError>;

    async fn image_to_image(
        &self,
        request: ImageToImageRequest,
    ) -> Result<ImageResult, GenerationError>;

    /// Estimate a depth map for an existing image.
    async fn depth_map(&self, _image_url: &str) -> Result<ImageResult, GenerationError> {
        Err(GenerationError::Unsupported("depth estimation"))
    }
}

/// Emotion and zero-shot text classification service.
#[async_trait]
pub trait ClassifierBackend: Send + Sync {
    /// Confidence-scored emotion labels, in any order.
    async fn classify_emotion(&self, text: &str) -> Result<Vec<LabelScore>, GenerationError>;

    /// Candidate labels scored against the sequence, in any order.
    async fn zero_shot(&self, request: ZeroShotRequest)
    -> Result<Vec<LabelScore>, GenerationError>;
}

/// Bound a backend call; elapsed calls become [`GenerationError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, GenerationError>
where
    F: Future<Output = Result<T, GenerationError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(GenerationError::Timeout(limit)),
    }
}

/// Sort scored labels by descending confidence; NaN scores sink to the end.
pub fn ranked(mut labels: Vec<LabelScore>) -> Vec<LabelScore> {
    labels.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or_else(|| a.score.is_nan().cmp(&b.score.is_nan()))
    });
    labels
}
