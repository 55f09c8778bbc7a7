use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use stage_model::{Background, BackgroundState, ChatMessage};
use tokio::select;
use tokio::sync::{broadcast, mpsc::Receiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{
    AspectRatio, ClassifierBackend, GenerationBackend, ImageRequest, TextGenRequest,
    ZeroShotRequest, ranked, with_timeout,
};
use crate::config::{BackgroundConfig, Configuration};
use crate::error::{BackgroundError, GenerationError, StoreError};
use crate::events::StageEvent;
use crate::prompts;
use crate::store::{ImageLookup, StageStore};

const SCENE_MIN_TOKENS: u32 = 30;
const SCENE_MAX_TOKENS: u32 = 150;
const MAX_NAME_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum BackgroundRequest {
    /// A new message arrived; decide whether the scene moved.
    Message {
        text: String,
        history: Vec<ChatMessage>,
    },
    Regenerate(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SceneDecision {
    /// Cooldown was running; it has been decremented.
    CoolingDown { remaining: u32 },
    EmptyMessage,
    SameLocation,
    /// The classifier could not answer; the scene is left alone.
    ClassifierFailed,
    Generate,
}

/// Detects scene changes and produces new backgrounds.
pub struct BackgroundDirector {
    store: Arc<StageStore>,
    generator: Arc<dyn GenerationBackend>,
    classifier: Option<Arc<dyn ClassifierBackend>>,
    events: Option<broadcast::Sender<StageEvent>>,
    config: BackgroundConfig,
    art_style: String,
    call_timeout: Duration,
}

impl BackgroundDirector {
    pub fn new(
        store: Arc<StageStore>,
        generator: Arc<dyn GenerationBackend>,
        classifier: Option<Arc<dyn ClassifierBackend>>,
        config: &Configuration,
    ) -> Self {
        Self {
            store,
            generator,
            classifier,
            events: None,
            config: config.background.clone(),
            art_style: config.art_style.clone(),
            call_timeout: config.backend.timeout,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<StageEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Decide whether this message warrants a new background.
    pub async fn decide(&self, text: &str) -> SceneDecision {
        let before = self.store.tick_cooldown();
        if before > 0 {
            debug!(remaining = before - 1, "background cooldown running");
            return SceneDecision::CoolingDown {
                remaining: before - 1,
            };
        }
        if text.trim().is_empty() {
            return SceneDecision::EmptyMessage;
        }
        if self.store.background_state().url.is_none() {
            return SceneDecision::Generate;
        }
        let Some(classifier) = &self.classifier else {
            return SceneDecision::ClassifierFailed;
        };

        let request = ZeroShotRequest {
            sequence: text.to_string(),
            candidate_labels: vec![
                prompts::LABEL_REMAINS.to_string(),
                prompts::LABEL_TRANSITIONS.to_string(),
            ],
            hypothesis_template: prompts::TRANSITION_HYPOTHESIS.to_string(),
        };
        let scores = match with_timeout(self.call_timeout, classifier.zero_shot(request)).await {
            Ok(scores) => ranked(scores),
            Err(err) => {
                warn!(error = %err, "scene classifier failed; keeping background");
                return SceneDecision::ClassifierFailed;
            }
        };
        match scores.first() {
            Some(top)
                if top.label == prompts::LABEL_TRANSITIONS
                    && top.score >= self.config.transition_threshold =>
            {
                info!(score = top.score, "scene transition detected");
                SceneDecision::Generate
            }
            Some(top) => {
                debug!(label = %top.label, score = top.score, "scene unchanged");
                SceneDecision::SameLocation
            }
            None => SceneDecision::ClassifierFailed,
        }
    }

    /// Handle one message. Returns the new background state when one was made.
    pub async fn on_message(
        &self,
        text: &str,
        history: &[ChatMessage],
    ) -> Option<BackgroundState> {
        if self.decide(text).await != SceneDecision::Generate {
            return None;
        }
        self.store.set_cooldown(self.config.cooldown_turns);
        let recent = &history[history.len().saturating_sub(self.config.history_messages)..];
        match self.generate_from_history(recent).await {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(error = %err, "background generation failed; keeping current background");
                None
            }
        }
    }

    async fn generate_from_history(
        &self,
        history: &[ChatMessage],
    ) -> Result<BackgroundState, BackgroundError> {
        let request = TextGenRequest {
            prompt: prompts::scene_prompt(history),
            min_tokens: SCENE_MIN_TOKENS,
            max_tokens: SCENE_MAX_TOKENS,
            include_history: true,
        };
        let scene = with_timeout(self.call_timeout, self.generator.text_gen(request)).await?;
        let scene = scene.trim().to_string();
        if scene.is_empty() {
            return Err(GenerationError::NoResult.into());
        }
        let name = self.unique_name(&scene);
        let mut background = Background {
            art_prompt: scene,
            ..Background::default()
        };
        self.render(&mut background).await?;
        self.store.record_background(&name, background);
        self.store.select_background(&name)?;
        Ok(self.announce())
    }

    /// Re-render a named background from its stored prompt.
    pub async fn regenerate_background(&self, name: &str) -> Result<Background, BackgroundError> {
        let mut background = self
            .store
            .background(name)
            .ok_or_else(|| StoreError::UnknownBackground(name.to_string()))?;
        if let Err(err) = self.render(&mut background).await {
            background.errored = true;
            self.store.record_background(name, background);
            return Err(err.into());
        }
        self.store.record_background(name, background.clone());
        let selected = self.store.chat_state().selected_background;
        if selected.as_deref() == Some(name) {
            self.store.select_background(name)?;
            self.announce();
        }
        Ok(background)
    }

    /// Generate the image (and depth map, when enabled) for a background.
    async fn render(&self, background: &mut Background) -> Result<(), GenerationError> {
        let (prompt, _) = prompts::substitute(&prompts::background_art_prompt(
            &self.art_style,
            &background.art_prompt,
            &background.trigger_words,
        ));
        let request = ImageRequest {
            prompt,
            negative_prompt: prompts::BACKGROUND_NEGATIVE_PROMPT.to_string(),
            aspect_ratio: AspectRatio::WidescreenHorizontal,
            remove_background: false,
        };
        let image = with_timeout(self.call_timeout, self.generator.make_image(request)).await?;
        info!(url = %image.url, "background generated");

        let depth_url = if self.config.generate_depth {
            match with_timeout(self.call_timeout, self.generator.depth_map(&image.url)).await {
                Ok(depth) => Some(depth.url),
                Err(err) => {
                    warn!(error = %err, "depth map unavailable; background will render flat");
                    None
                }
            }
        } else {
            None
        };
        background.url = Some(image.url);
        background.depth_url = depth_url;
        background.errored = false;
        Ok(())
    }

    fn announce(&self) -> BackgroundState {
        let state = self.store.background_state();
        if let Some(events) = &self.events {
            let _ = events.send(StageEvent::BackgroundChanged(state.clone()));
        }
        state
    }

    fn unique_name(&self, scene: &str) -> String {
        let base = scene_name(scene);
        let taken = self.store.background_names();
        if !taken.contains(&base) {
            return base;
        }
        (2..)
            .map(|n| format!("{base} {n}"))
            .find(|candidate| !taken.contains(candidate))
            .unwrap_or(base)
    }
}

/// Short display name: the first tag of the scene description.
fn scene_name(scene: &str) -> String {
    let first = scene
        .split([',', '.', '\n'])
        .map(str::trim)
        .find(|part| !part.is_empty())
        .unwrap_or("scene");
    let mut name: String = first.chars().take(MAX_NAME_LEN).collect();
    name = name.trim_end().to_string();
    if name.is_empty() { "scene".to_string() } else { name }
}

/// Background task: one request at a time, newest message wins.
pub async fn run(
    director: BackgroundDirector,
    mut requests: Receiver<BackgroundRequest>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        select! {
            _ = cancel.cancelled() => break,
            req = requests.recv() => {
                let Some(req) = req else { break };
                match req {
                    BackgroundRequest::Message { text, history } => {
                        select! {
                            _ = cancel.cancelled() => break,
                            _ = director.on_message(&text, &history) => {}
                        }
                    }
                    BackgroundRequest::Regenerate(name) => {
                        if let Err(err) = director.regenerate_background(&name).await {
                            warn!(background = %name, error = %err, "background regeneration failed");
                        }
                    }
                }
            }
        }
    }
    debug!("background task exiting");
    Ok(())
}
