//! Host-facing lifecycle.
//!
//! A [`Stage`] owns the store and the background tasks (pack scheduler and
//! background director). Lifecycle calls never wait on image generation; they
//! enqueue work and return the current state.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stage_model::{
    CharacterId, CharacterProfile, ChatMessage, ChatState, Emotion, MessageState, PersistedState,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{ClassifierBackend, GenerationBackend};
use crate::config::Configuration;
use crate::error::StoreError;
use crate::events::{SchedulerCommand, StageEvent};
use crate::pointer::PointerSample;
use crate::processing::layout::{self, SpeakerPlacement};
use crate::store::{ImageLookup, PackKey, StageStore};
use crate::tasks::background::{self, BackgroundDirector, BackgroundRequest};
use crate::tasks::emotion::EmotionClassifier;
use crate::tasks::scheduler::{self, PackScheduler};

const COMMAND_QUEUE: usize = 16;
const EVENT_QUEUE: usize = 64;

/// What the host hands the stage when it is mounted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct InitialData {
    pub characters: Vec<CharacterProfile>,
    pub state: PersistedState,
}

#[derive(Clone)]
pub struct Backends {
    pub generator: Arc<dyn GenerationBackend>,
    pub classifier: Option<Arc<dyn ClassifierBackend>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadResponse {
    pub success: bool,
    pub error: Option<String>,
    pub chat_state: ChatState,
    pub message_state: MessageState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResponse {
    pub chat_state: ChatState,
    pub message_state: MessageState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackgroundLayer {
    pub color_url: String,
    pub depth_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerPose {
    pub character: CharacterId,
    pub name: String,
    pub emotion: Emotion,
    pub outfit: String,
    pub image_url: String,
    pub placement: SpeakerPlacement,
}

/// Everything needed to draw one frame of the stage.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneFrame {
    pub background: Option<BackgroundLayer>,
    pub speakers: Vec<SpeakerPose>,
}

pub struct Stage {
    config: Configuration,
    store: Arc<StageStore>,
    classifier: EmotionClassifier,
    events: broadcast::Sender<StageEvent>,
    scheduler_tx: mpsc::Sender<SchedulerCommand>,
    background_tx: mpsc::Sender<BackgroundRequest>,
    pointer: watch::Receiver<PointerSample>,
    history: Mutex<VecDeque<ChatMessage>>,
    cancel: CancellationToken,
    tasks: JoinSet<Result<()>>,
}

impl Stage {
    /// Build the stage and spawn its worker tasks on the current runtime.
    pub fn new(config: Configuration, initial: InitialData, backends: Backends) -> Self {
        let store = Arc::new(StageStore::with_state(
            config.placeholder_url.clone(),
            initial.characters,
            initial.state,
        ));
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let (scheduler_tx, scheduler_rx) = mpsc::channel(COMMAND_QUEUE);
        let pack_scheduler = PackScheduler::new(store.clone(), backends.generator.clone(), &config)
            .with_events(events.clone());
        tasks.spawn(scheduler::run(pack_scheduler, scheduler_rx, cancel.child_token()));

        let (background_tx, background_rx) = mpsc::channel(COMMAND_QUEUE);
        let director = BackgroundDirector::new(
            store.clone(),
            backends.generator.clone(),
            backends.classifier.clone(),
            &config,
        )
        .with_events(events.clone());
        tasks.spawn(background::run(director, background_rx, cancel.child_token()));

        let classifier = EmotionClassifier::new(
            backends.classifier,
            config.emotion.threshold,
            config.backend.timeout,
        );
        let (_, pointer) = watch::channel(PointerSample::CENTER);

        Self {
            config,
            store,
            classifier,
            events,
            scheduler_tx,
            background_tx,
            pointer,
            history: Mutex::new(VecDeque::new()),
            cancel,
            tasks,
        }
    }

    /// Drive speaker pans from a pointer service.
    pub fn with_pointer(mut self, pointer: watch::Receiver<PointerSample>) -> Self {
        self.pointer = pointer;
        self
    }

    pub fn store(&self) -> &Arc<StageStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.events.subscribe()
    }

    /// Start filling image packs and report the restored state.
    pub fn load(&self) -> LoadResponse {
        if self.config.auto_generate {
            self.request_fill();
        }
        let state = self.store.snapshot();
        info!(
            characters = self.store.roster().len(),
            backgrounds = state.chat.backgrounds.len(),
            "stage loaded"
        );
        LoadResponse {
            success: true,
            error: None,
            chat_state: state.chat,
            message_state: state.message,
        }
    }

    /// The host swapped message state (e.g. a swipe or jump in history).
    pub fn set_state(&self, state: MessageState) {
        let previous = self.store.background_state();
        self.store.set_message_state(state);
        let current = self.store.background_state();
        if previous.url != current.url || previous.depth_url != current.depth_url {
            let _ = self.events.send(StageEvent::BackgroundChanged(current));
        }
    }

    pub fn before_prompt(&self, message: &ChatMessage) -> StageResponse {
        self.remember(message);
        self.response()
    }

    /// Classify the reply, make its author the active speaker and let the
    /// background director look for a scene change.
    pub async fn after_response(&self, message: &ChatMessage) -> StageResponse {
        let history = self.remember(message);
        let emotion = self.classifier.classify(&message.content).await;
        info!(character = %message.author, %emotion, "new emotion");
        self.store.set_emotion(&message.author, emotion);
        self.store.set_active_speaker(Some(message.author.clone()));
        let _ = self.events.send(StageEvent::EmotionChanged {
            character: message.author.clone(),
            emotion,
        });

        let request = BackgroundRequest::Message {
            text: message.content.clone(),
            history,
        };
        if let Err(err) = self.background_tx.try_send(request) {
            warn!(error = %err, "background director busy; skipping scene check");
        }
        self.response()
    }

    pub fn render(&self) -> SceneFrame {
        let state = self.store.background_state();
        let background = state.url.map(|color_url| BackgroundLayer {
            color_url,
            depth_url: state.depth_url,
        });

        let roster = self.store.roster();
        let active = self.store.active_speaker();
        let active_index = roster.iter().position(|p| Some(&p.id) == active.as_ref());
        let pointer = *self.pointer.borrow();
        let placements = layout::arrange(roster.len(), active_index, pointer, &self.config.motion);

        let speakers = roster
            .into_iter()
            .zip(placements)
            .map(|(profile, placement)| {
                let visual = self.store.visual_state(&profile.id);
                let image_url =
                    self.store
                        .character_image(&profile.id, &visual.outfit, visual.emotion);
                SpeakerPose {
                    character: profile.id,
                    name: profile.name,
                    emotion: visual.emotion,
                    outfit: visual.outfit,
                    image_url,
                    placement,
                }
            })
            .collect();
        SceneFrame {
            background,
            speakers,
        }
    }

    pub fn add_character(&self, profile: CharacterProfile) {
        self.store.ensure_character(profile);
        self.request_fill();
    }

    pub fn remove_character(&self, character: &CharacterId) -> Result<(), StoreError> {
        self.store.remove_character(character)
    }

    pub fn add_outfit(
        &self,
        character: &CharacterId,
        name: &str,
        art_prompt: &str,
        trigger_words: &str,
        global: bool,
    ) -> Result<(), StoreError> {
        self.store
            .add_outfit(character, name, art_prompt, trigger_words, global)?;
        self.request_fill();
        Ok(())
    }

    pub fn remove_outfit(&self, character: &CharacterId, name: &str) -> Result<(), StoreError> {
        self.store.remove_outfit(character, name)
    }

    pub fn rename_outfit(
        &self,
        character: &CharacterId,
        from: &str,
        to: &str,
    ) -> Result<(), StoreError> {
        self.store.rename_outfit(character, from, to)?;
        self.request_fill();
        Ok(())
    }

    pub fn select_outfit(&self, character: &CharacterId, outfit: &str) -> Result<(), StoreError> {
        self.store.select_outfit(character, outfit)
    }

    /// Import an authored outfit. Malformed JSON is logged and discarded.
    pub fn import_outfit_json(&self, character: &CharacterId, name: &str, json: &str) -> bool {
        match self.store.import_outfit_json(character, name, json) {
            Ok(()) => true,
            Err(err) => {
                warn!(%character, outfit = name, error = %err, "outfit import discarded");
                false
            }
        }
    }

    /// Import a named background. Malformed JSON is logged and discarded.
    pub fn import_background_json(&self, name: &str, json: &str) -> bool {
        match self.store.import_background_json(name, json) {
            Ok(()) => true,
            Err(err) => {
                warn!(background = name, error = %err, "background import discarded");
                false
            }
        }
    }

    pub fn select_background(&self, name: &str) -> Result<(), StoreError> {
        self.store.select_background(name)?;
        let _ = self
            .events
            .send(StageEvent::BackgroundChanged(self.store.background_state()));
        Ok(())
    }

    pub fn regenerate_image(&self, character: &CharacterId, outfit: &str, emotion: Emotion) {
        let command = SchedulerCommand::Regenerate {
            key: PackKey::new(character.clone(), outfit),
            emotion,
        };
        if let Err(err) = self.scheduler_tx.try_send(command) {
            warn!(%character, outfit, %emotion, error = %err, "regeneration not queued");
        }
    }

    pub fn regenerate_background(&self, name: &str) {
        if let Err(err) = self
            .background_tx
            .try_send(BackgroundRequest::Regenerate(name.to_string()))
        {
            warn!(background = name, error = %err, "background regeneration not queued");
        }
    }

    pub fn snapshot(&self) -> PersistedState {
        self.store.snapshot()
    }

    /// Cancel the worker tasks and wait for them to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            joined??;
        }
        debug!("stage shut down");
        Ok(())
    }

    fn request_fill(&self) {
        if let Err(err) = self.scheduler_tx.try_send(SchedulerCommand::Fill) {
            debug!(error = %err, "fill already queued");
        }
    }

    fn remember(&self, message: &ChatMessage) -> Vec<ChatMessage> {
        let limit = self.config.background.history_messages.max(1);
        let mut history = self.history.lock();
        history.push_back(message.clone());
        while history.len() > limit {
            history.pop_front();
        }
        history.iter().cloned().collect()
    }

    fn response(&self) -> StageResponse {
        let state = self.store.snapshot();
        StageResponse {
            chat_state: state.chat,
            message_state: state.message,
        }
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LabelScore;
    use crate::backend::testkit::ScriptedBackend;
    use std::time::Duration;

    fn profile(id: &str) -> CharacterProfile {
        CharacterProfile {
            id: CharacterId::new(id),
            name: id.to_uppercase(),
            description: format!("{id} description"),
            ..CharacterProfile::default()
        }
    }

    fn config() -> Configuration {
        let mut config = Configuration::default();
        config.auto_generate = false;
        config.scheduler.retry_backoff = Duration::ZERO;
        config
    }

    fn stage(ids: &[&str]) -> (Stage, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::new());
        let initial = InitialData {
            characters: ids.iter().map(|id| profile(id)).collect(),
            state: PersistedState::default(),
        };
        let backends = Backends {
            generator: backend.clone(),
            classifier: Some(backend.clone()),
        };
        (Stage::new(config(), initial, backends), backend)
    }

    fn reply(author: &str, content: &str) -> ChatMessage {
        ChatMessage {
            author: CharacterId::new(author),
            content: content.to_string(),
            is_bot: true,
        }
    }

    #[tokio::test]
    async fn load_reports_restored_state() {
        let (stage, backend) = stage(&["a", "b"]);
        let response = stage.load();
        assert!(response.success);
        assert_eq!(response.chat_state.wardrobes.len(), 2);
        assert!(backend.calls().is_empty());
        stage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn after_response_sets_emotion_and_speaker() {
        let (stage, backend) = stage(&["a", "b"]);
        backend.set_emotion_scores(Ok(vec![
            LabelScore {
                label: "neutral".into(),
                score: 0.9,
            },
            LabelScore {
                label: "joy".into(),
                score: 0.6,
            },
        ]));
        let mut events = stage.subscribe();

        let response = stage.after_response(&reply("b", "What a lovely day!")).await;
        let b = CharacterId::new("b");
        assert_eq!(response.message_state.character_emotion[&b], Emotion::Joy);
        assert_eq!(response.message_state.active_speaker, Some(b.clone()));
        assert_eq!(
            events.recv().await.unwrap(),
            StageEvent::EmotionChanged {
                character: b,
                emotion: Emotion::Joy
            }
        );
        stage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn classifier_failure_falls_back_to_keywords() {
        let (stage, backend) = stage(&["a"]);
        backend.set_emotion_scores(Err(crate::error::GenerationError::BackendUnavailable(
            "down".into(),
        )));
        let response = stage
            .after_response(&reply("a", "I feel such grief today"))
            .await;
        assert_eq!(
            response.message_state.character_emotion[&CharacterId::new("a")],
            Emotion::Grief
        );
        stage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn render_places_speakers_with_placeholder_images() {
        let (stage, _backend) = stage(&["a", "b"]);
        stage.store().set_active_speaker(Some(CharacterId::new("b")));

        let frame = stage.render();
        assert!(frame.background.is_none());
        assert_eq!(frame.speakers.len(), 2);
        let a = &frame.speakers[0];
        let b = &frame.speakers[1];
        assert_eq!(a.image_url, stage.store().placeholder());
        assert!(!a.placement.speaking);
        assert_eq!(a.placement.x_vw, 25.0);
        assert!(b.placement.speaking);
        assert_eq!(b.placement.x_vw, 50.0);
        assert_eq!(b.outfit, "default");
        stage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn render_follows_pointer() {
        let (stage, _backend) = stage(&["a"]);
        let (tx, rx) = watch::channel(PointerSample::CENTER);
        let stage = stage.with_pointer(rx);
        tx.send(PointerSample::new(1.0, 0.0)).unwrap();
        let pose = &stage.render().speakers[0];
        assert!(pose.placement.pan[0] > 0.0);
        stage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_imports_are_discarded() {
        let (stage, _backend) = stage(&["a"]);
        let a = CharacterId::new("a");
        let before = stage.snapshot();
        assert!(!stage.import_outfit_json(&a, "casual", "{not json"));
        assert!(!stage.import_background_json("beach", "[1, 2"));
        assert_eq!(stage.snapshot(), before);

        assert!(stage.import_background_json("beach", r#"{"url":"beach.png"}"#));
        let mut events = stage.subscribe();
        stage.select_background("beach").unwrap();
        assert_eq!(
            stage.render().background,
            Some(BackgroundLayer {
                color_url: "beach.png".into(),
                depth_url: None
            })
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            StageEvent::BackgroundChanged(_)
        ));
        stage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn removed_characters_leave_the_scene() {
        let (stage, _backend) = stage(&["a", "b"]);
        stage.remove_character(&CharacterId::new("a")).unwrap();
        let frame = stage.render();
        assert_eq!(frame.speakers.len(), 1);
        assert_eq!(frame.speakers[0].placement.x_vw, 50.0);
        stage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn set_state_announces_background_changes() {
        let (stage, _backend) = stage(&["a"]);
        let mut events = stage.subscribe();
        let mut state = MessageState::default();
        state.background.url = Some("forest.png".into());
        stage.set_state(state);
        match events.recv().await.unwrap() {
            StageEvent::BackgroundChanged(bg) => assert_eq!(bg.url.as_deref(), Some("forest.png")),
            other => panic!("unexpected event {other:?}"),
        }
        stage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn load_fills_packs_when_enabled() {
        let backend = Arc::new(ScriptedBackend::new());
        let mut config = config();
        config.auto_generate = true;
        let stage = Stage::new(
            config,
            InitialData {
                characters: vec![profile("a")],
                state: PersistedState::default(),
            },
            Backends {
                generator: backend.clone(),
                classifier: None,
            },
        );
        let mut events = stage.subscribe();
        stage.load();
        let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match first {
            StageEvent::PackUpdated { emotion, .. } => assert_eq!(emotion, Emotion::Neutral),
            other => panic!("unexpected event {other:?}"),
        }
        stage.shutdown().await.unwrap();
    }
}
