//! Scripted in-process backend for tests and offline previews.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ClassifierBackend, GenerationBackend, ImageRequest, ImageResult, ImageToImageRequest,
    LabelScore, TextGenRequest, ZeroShotRequest,
};
use crate::error::GenerationError;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    TextGen(TextGenRequest),
    MakeImage(ImageRequest),
    ImageToImage(ImageToImageRequest),
    DepthMap(String),
    ClassifyEmotion(String),
    ZeroShot(ZeroShotRequest),
}

impl BackendCall {
    pub fn is_image(&self) -> bool {
        matches!(self, Self::MakeImage(_) | Self::ImageToImage(_))
    }
}

/// Queue of one-shot replies in front of a sticky default.
#[derive(Debug)]
struct Script<T> {
    queued: VecDeque<Result<T, GenerationError>>,
    default: Option<Result<T, GenerationError>>,
}

impl<T: Clone> Script<T> {
    fn new(default: Option<Result<T, GenerationError>>) -> Self {
        Self {
            queued: VecDeque::new(),
            default,
        }
    }

    fn next(&mut self) -> Option<Result<T, GenerationError>> {
        self.queued.pop_front().or_else(|| self.default.clone())
    }
}

/// Backend whose answers are scripted up front and whose calls are recorded.
///
/// Without scripting, text generation returns a fixed description and image
/// calls mint unique `scripted://` URLs.
#[derive(Debug)]
pub struct ScriptedBackend {
    calls: Mutex<Vec<BackendCall>>,
    text: Mutex<Script<String>>,
    make_image: Mutex<Script<ImageResult>>,
    image_to_image: Mutex<Script<ImageResult>>,
    depth: Mutex<Script<ImageResult>>,
    emotion: Mutex<Script<Vec<LabelScore>>>,
    zero_shot: Mutex<Script<Vec<LabelScore>>>,
    latency: Mutex<Duration>,
    minted: AtomicUsize,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub const DEFAULT_DESCRIPTION: &'static str =
        "tall woman with silver hair in a long navy coat";

    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            text: Mutex::new(Script::new(Some(Ok(Self::DEFAULT_DESCRIPTION.to_string())))),
            make_image: Mutex::new(Script::new(None)),
            image_to_image: Mutex::new(Script::new(None)),
            depth: Mutex::new(Script::new(None)),
            emotion: Mutex::new(Script::new(Some(Ok(Vec::new())))),
            zero_shot: Mutex::new(Script::new(Some(Ok(Vec::new())))),
            latency: Mutex::new(Duration::ZERO),
            minted: AtomicUsize::new(0),
        }
    }

    /// Delay applied to every call before it answers.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn set_text(&self, reply: Result<String, GenerationError>) {
        self.text.lock().default = Some(reply);
    }

    pub fn queue_text(&self, reply: Result<String, GenerationError>) {
        self.text.lock().queued.push_back(reply);
    }

    pub fn fail_make_image(&self, err: GenerationError) {
        self.make_image.lock().default = Some(Err(err));
    }

    pub fn queue_make_image(&self, reply: Result<String, GenerationError>) {
        self.make_image
            .lock()
            .queued
            .push_back(reply.map(|url| ImageResult { url }));
    }

    pub fn fail_image_to_image(&self, err: GenerationError) {
        self.image_to_image.lock().default = Some(Err(err));
    }

    pub fn fail_depth(&self, err: GenerationError) {
        self.depth.lock().default = Some(Err(err));
    }

    pub fn set_emotion_scores(&self, reply: Result<Vec<LabelScore>, GenerationError>) {
        self.emotion.lock().default = Some(reply);
    }

    pub fn set_zero_shot(&self, reply: Result<Vec<LabelScore>, GenerationError>) {
        self.zero_shot.lock().default = Some(reply);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    pub fn image_calls(&self) -> Vec<BackendCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.is_image())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    async fn record(&self, call: BackendCall) {
        self.calls.lock().push(call);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn mint(&self, kind: &str) -> ImageResult {
        let n = self.minted.fetch_add(1, Ordering::Relaxed);
        ImageResult {
            url: format!("scripted://{kind}/{n}"),
        }
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn text_gen(&self, request: TextGenRequest) -> Result<String, GenerationError> {
        self.record(BackendCall::TextGen(request)).await;
        self.text.lock().next().unwrap_or(Err(GenerationError::NoResult))
    }

    async fn make_image(&self, request: ImageRequest) -> Result<ImageResult, GenerationError> {
        self.record(BackendCall::MakeImage(request)).await;
        let scripted = self.make_image.lock().next();
        scripted.unwrap_or_else(|| Ok(self.mint("image")))
    }

    async fn image_to_image(
        &self,
        request: ImageToImageRequest,
    ) -> Result<ImageResult, GenerationError> {
        self.record(BackendCall::ImageToImage(request)).await;
        let scripted = self.image_to_image.lock().next();
        scripted.unwrap_or_else(|| Ok(self.mint("derived")))
    }

    async fn depth_map(&self, image_url: &str) -> Result<ImageResult, GenerationError> {
        self.record(BackendCall::DepthMap(image_url.to_string())).await;
        let scripted = self.depth.lock().next();
        scripted.unwrap_or_else(|| Ok(self.mint("depth")))
    }
}

#[async_trait]
impl ClassifierBackend for ScriptedBackend {
    async fn classify_emotion(&self, text: &str) -> Result<Vec<LabelScore>, GenerationError> {
        self.record(BackendCall::ClassifyEmotion(text.to_string()))
            .await;
        self.emotion.lock().next().unwrap_or(Ok(Vec::new()))
    }

    async fn zero_shot(
        &self,
        request: ZeroShotRequest,
    ) -> Result<Vec<LabelScore>, GenerationError> {
        self.record(BackendCall::ZeroShot(request)).await;
        self.zero_shot.lock().next().unwrap_or(Ok(Vec::new()))
    }
}
