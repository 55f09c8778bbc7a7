use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use stage_model::Emotion;
use tokio::select;
use tokio::sync::{broadcast, mpsc::Receiver};
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{
    AspectRatio, GenerationBackend, ImageRequest, ImageToImageRequest, TextGenRequest,
    with_timeout,
};
use crate::config::{Configuration, SchedulerConfig};
use crate::error::{GenerationError, PackError};
use crate::events::{SchedulerCommand, StageEvent};
use crate::prompts;
use crate::store::{InFlightGuard, PackKey, StageStore};

/// How failed image requests are retried before the fallback is stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &SchedulerConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_backoff: cfg.retry_backoff,
            max_backoff: cfg.max_backoff,
        }
    }

    /// Delay after the given failed attempt (1-based): exponential, capped,
    /// plus up to 25% jitter.
    pub fn backoff<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let jitter = rng.random_range(0.0..=0.25);
        delay + delay.mul_f64(jitter)
    }

    /// Rejected prompts fail the same way every time.
    fn is_retryable(err: &GenerationError) -> bool {
        !matches!(
            err,
            GenerationError::ContentRejected(_) | GenerationError::Unsupported(_)
        )
    }
}

/// One missing image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub key: PackKey,
    pub emotion: Emotion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    Generated(String),
    /// Generation failed; the placeholder (neutral) or the neutral image
    /// (derived emotions) was stored instead.
    Fallback(String),
}

impl ImageOutcome {
    pub fn url(&self) -> &str {
        match self {
            Self::Generated(url) | Self::Fallback(url) => url,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionReport {
    pub generated: usize,
    pub fallbacks: usize,
    pub skipped: usize,
    /// Packs abandoned for this pass (no description, neutral failed, removed).
    pub dropped: Vec<PackKey>,
}

/// Fills missing emotion images, one backend call at a time.
#[derive(Clone)]
pub struct PackScheduler {
    store: Arc<StageStore>,
    backend: Arc<dyn GenerationBackend>,
    events: Option<broadcast::Sender<StageEvent>>,
    emotions: Vec<Emotion>,
    art_style: String,
    call_timeout: Duration,
    retry: RetryPolicy,
    derive_strength: f32,
}

impl PackScheduler {
    pub fn new(
        store: Arc<StageStore>,
        backend: Arc<dyn GenerationBackend>,
        config: &Configuration,
    ) -> Self {
        Self {
            store,
            backend,
            events: None,
            emotions: Emotion::ALL.to_vec(),
            art_style: config.art_style.clone(),
            call_timeout: config.backend.timeout,
            retry: RetryPolicy::from_config(&config.scheduler),
            derive_strength: config.scheduler.derive_strength,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<StageEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Restrict the emotions a pack is completed with. Neutral is always
    /// included and always first.
    pub fn with_emotions(mut self, emotions: impl IntoIterator<Item = Emotion>) -> Self {
        let set: BTreeSet<Emotion> = emotions
            .into_iter()
            .chain(std::iter::once(Emotion::Neutral))
            .collect();
        self.emotions = set.into_iter().collect();
        self
    }

    pub fn store(&self) -> &Arc<StageStore> {
        &self.store
    }

    /// Cached visual description for a pack, generating it on first use.
    pub async fn ensure_description(&self, key: &PackKey) -> Result<String, PackError> {
        if let Some(description) = self.store.description(key) {
            return Ok(description);
        }
        let profile = self
            .store
            .character(&key.character)
            .ok_or_else(|| PackError::UnknownCharacter(key.character.clone()))?;
        let outfit = self.store.outfit(key).ok_or_else(|| PackError::UnknownOutfit {
            character: key.character.clone(),
            outfit: key.outfit.clone(),
        })?;

        info!(character = %key.character, outfit = %key.outfit, "requesting visual description");
        let request = TextGenRequest {
            prompt: prompts::description_prompt(&profile, &key.outfit, &outfit.art_prompt),
            min_tokens: prompts::DESCRIPTION_MIN_TOKENS,
            max_tokens: prompts::DESCRIPTION_MAX_TOKENS,
            include_history: true,
        };
        let no_description = || PackError::NoDescription {
            character: key.character.clone(),
            outfit: key.outfit.clone(),
        };
        match with_timeout(self.call_timeout, self.backend.text_gen(request)).await {
            Ok(text) if !text.trim().is_empty() => {
                let text = text.trim().to_string();
                debug!(character = %key.character, outfit = %key.outfit, description = %text, "description cached");
                self.store.set_description(key, text.clone());
                Ok(text)
            }
            Ok(_) | Err(GenerationError::NoResult) => Err(no_description()),
            Err(err) => Err(err.into()),
        }
    }

    /// Produce and store one image for a pack.
    ///
    /// Neutral is generated from text; every other emotion is an
    /// image-to-image edit of neutral and fails with
    /// [`PackError::MissingNeutralBase`] when neutral does not exist yet.
    pub async fn generate_image(
        &self,
        key: &PackKey,
        emotion: Emotion,
    ) -> Result<ImageOutcome, PackError> {
        let guard = self.store.try_begin(key)?;
        self.generate_claimed(&guard, emotion).await
    }

    /// Manually replace one image. Regenerating neutral discards the cached
    /// description and every image of the pack first.
    pub async fn regenerate(
        &self,
        key: &PackKey,
        emotion: Emotion,
    ) -> Result<ImageOutcome, PackError> {
        let guard = self.store.try_begin(key)?;
        if emotion.is_neutral() {
            info!(character = %key.character, outfit = %key.outfit, "regenerating pack from scratch");
            self.store.clear_description(key);
            self.store.clear_pack(key);
        }
        self.generate_claimed(&guard, emotion).await
    }

    /// Missing images of every generated pack: character-major, outfits in
    /// name order, emotions in vocabulary order with neutral first.
    pub fn pending_work(&self) -> VecDeque<WorkItem> {
        let mut queue = VecDeque::new();
        for (key, pack) in self.store.generated_packs() {
            let errored = self.store.outfit(&key).is_some_and(|outfit| outfit.errored);
            for emotion in &self.emotions {
                let missing = !pack.contains(*emotion) || (errored && emotion.is_neutral());
                if missing {
                    queue.push_back(WorkItem {
                        key: key.clone(),
                        emotion: *emotion,
                    });
                }
            }
        }
        queue
    }

    /// Produce the first missing image, if any. `None` means every pack is
    /// complete.
    pub async fn generate_next_image(&self) -> Option<Result<ImageOutcome, PackError>> {
        let item = self.pending_work().pop_front()?;
        Some(self.generate_image(&item.key, item.emotion).await)
    }

    /// Work through every missing image until the queue is empty.
    ///
    /// The queue is built once; items are processed strictly one at a time.
    /// Calling this with nothing missing performs no backend calls.
    pub async fn run_until_complete(&self, cancel: &CancellationToken) -> CompletionReport {
        let mut queue = self.pending_work();
        let mut report = CompletionReport::default();
        if queue.is_empty() {
            debug!("all packs complete");
            return report;
        }
        info!(items = queue.len(), "filling missing pack images");

        while let Some(item) = queue.pop_front() {
            if cancel.is_cancelled() {
                report.skipped += queue.len() + 1;
                break;
            }
            if report.dropped.contains(&item.key) {
                report.skipped += 1;
                continue;
            }
            if self.is_filled(&item) {
                report.skipped += 1;
                continue;
            }
            match self.generate_image(&item.key, item.emotion).await {
                Ok(ImageOutcome::Generated(_)) => report.generated += 1,
                Ok(ImageOutcome::Fallback(_)) => {
                    report.fallbacks += 1;
                    if item.emotion.is_neutral() {
                        report.dropped.push(item.key);
                    }
                }
                Err(PackError::InFlight { .. }) => {
                    debug!(character = %item.key.character, outfit = %item.key.outfit, "pack busy; skipping");
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(character = %item.key.character, outfit = %item.key.outfit, emotion = %item.emotion, error = %err, "dropping pack for this pass");
                    report.skipped += 1;
                    report.dropped.push(item.key);
                }
            }
        }
        info!(
            generated = report.generated,
            fallbacks = report.fallbacks,
            skipped = report.skipped,
            "fill pass finished"
        );
        report
    }

    fn is_filled(&self, item: &WorkItem) -> bool {
        match self.store.outfit(&item.key) {
            Some(outfit) => {
                outfit.pack.contains(item.emotion) && !(outfit.errored && item.emotion.is_neutral())
            }
            None => false,
        }
    }

    fn neutral_base(&self, key: &PackKey) -> Option<String> {
        self.store
            .outfit(key)
            .filter(|outfit| !outfit.errored)
            .and_then(|outfit| outfit.pack.get(Emotion::Neutral).map(str::to_string))
    }

    async fn generate_claimed(
        &self,
        guard: &InFlightGuard,
        emotion: Emotion,
    ) -> Result<ImageOutcome, PackError> {
        let key = guard.key();
        let cancelled = || PackError::Cancelled {
            character: key.character.clone(),
            outfit: key.outfit.clone(),
        };
        select! {
            _ = guard.token().cancelled() => {
                info!(character = %key.character, outfit = %key.outfit, %emotion, "generation cancelled");
                Err(cancelled())
            }
            res = self.produce(guard, emotion) => res,
        }
    }

    async fn produce(
        &self,
        guard: &InFlightGuard,
        emotion: Emotion,
    ) -> Result<ImageOutcome, PackError> {
        let key = guard.key();
        let base = if emotion.is_neutral() {
            None
        } else {
            Some(
                self.neutral_base(key)
                    .ok_or_else(|| PackError::MissingNeutralBase {
                        character: key.character.clone(),
                        outfit: key.outfit.clone(),
                        emotion,
                    })?,
            )
        };

        let description = self.ensure_description(key).await?;
        let trigger_words = self
            .store
            .outfit(key)
            .map(|outfit| outfit.trigger_words)
            .unwrap_or_default();
        let (prompt, altered) = prompts::substitute(&prompts::character_art_prompt(
            &self.art_style,
            &description,
            &trigger_words,
            emotion,
        ));
        if altered {
            debug!(character = %key.character, outfit = %key.outfit, "art prompt altered by substitution");
        }

        let mut last_error = None;
        for attempt in 1..=self.retry.max_attempts {
            info!(character = %key.character, outfit = %key.outfit, %emotion, attempt, "requesting image");
            match self.request(&prompt, base.as_deref()).await {
                Ok(url) => {
                    self.store_result(guard, emotion, &url)?;
                    if emotion.is_neutral() {
                        self.store.set_errored(key, false);
                    }
                    return Ok(ImageOutcome::Generated(url));
                }
                Err(err) => {
                    warn!(character = %key.character, outfit = %key.outfit, %emotion, attempt, error = %err, "image request failed");
                    let retry = RetryPolicy::is_retryable(&err) && attempt < self.retry.max_attempts;
                    last_error = Some(err);
                    if !retry {
                        break;
                    }
                    let delay = self.retry.backoff(attempt, &mut rand::rng());
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let fallback = match base {
            Some(neutral) => neutral,
            None => self.store.placeholder().to_string(),
        };
        warn!(
            character = %key.character,
            outfit = %key.outfit,
            %emotion,
            error = ?last_error,
            fallback = %fallback,
            "storing fallback image"
        );
        self.store_result(guard, emotion, &fallback)?;
        if emotion.is_neutral() {
            self.store.set_errored(key, true);
        }
        Ok(ImageOutcome::Fallback(fallback))
    }

    async fn request(&self, prompt: &str, base: Option<&str>) -> Result<String, GenerationError> {
        let result = match base {
            None => {
                let request = ImageRequest {
                    prompt: prompt.to_string(),
                    negative_prompt: prompts::CHARACTER_NEGATIVE_PROMPT.to_string(),
                    aspect_ratio: AspectRatio::WidescreenVertical,
                    remove_background: true,
                };
                with_timeout(self.call_timeout, self.backend.make_image(request)).await
            }
            Some(image) => {
                let request = ImageToImageRequest {
                    image: image.to_string(),
                    prompt: prompt.to_string(),
                    negative_prompt: prompts::CHARACTER_NEGATIVE_PROMPT.to_string(),
                    strength: self.derive_strength,
                    aspect_ratio: AspectRatio::WidescreenVertical,
                    remove_background: true,
                };
                with_timeout(self.call_timeout, self.backend.image_to_image(request)).await
            }
        };
        result.map(|image| image.url)
    }

    /// Write back unless the pack was removed while the request ran.
    fn store_result(
        &self,
        guard: &InFlightGuard,
        emotion: Emotion,
        url: &str,
    ) -> Result<(), PackError> {
        let key = guard.key();
        if guard.is_cancelled() {
            info!(character = %key.character, outfit = %key.outfit, %emotion, "discarding result for removed pack");
            return Err(PackError::Cancelled {
                character: key.character.clone(),
                outfit: key.outfit.clone(),
            });
        }
        self.store.write_image(key, emotion, url)?;
        if let Some(events) = &self.events {
            let _ = events.send(StageEvent::PackUpdated {
                key: key.clone(),
                emotion,
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

/// Finished unit of scheduler work.
enum Finished {
    Filled(CompletionReport),
    Regenerated {
        key: PackKey,
        emotion: Emotion,
        result: Result<ImageOutcome, PackError>,
    },
}

fn spawn_fill(
    work: &mut JoinSet<Finished>,
    scheduler: &PackScheduler,
    cancel: &CancellationToken,
) -> task::Id {
    let scheduler = scheduler.clone();
    let cancel = cancel.child_token();
    work.spawn(async move { Finished::Filled(scheduler.run_until_complete(&cancel).await) })
        .id()
}

/// Scheduler task: fills packs on request and handles manual regeneration.
///
/// At most one fill pass runs at a time; a `Fill` arriving mid-pass schedules
/// one more pass. Manual regenerations run alongside the pass and are kept
/// apart from it by the per-pack in-flight markers.
pub async fn run(
    scheduler: PackScheduler,
    mut commands: Receiver<SchedulerCommand>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut work: JoinSet<Finished> = JoinSet::new();
    let mut fill: Option<task::Id> = None;
    let mut refill = false;

    loop {
        select! {
            _ = cancel.cancelled() => break,

            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    SchedulerCommand::Fill => {
                        if fill.is_some() {
                            refill = true;
                        } else {
                            fill = Some(spawn_fill(&mut work, &scheduler, &cancel));
                        }
                    }
                    SchedulerCommand::Regenerate { key, emotion } => {
                        let scheduler = scheduler.clone();
                        work.spawn(async move {
                            let result = scheduler.regenerate(&key, emotion).await;
                            Finished::Regenerated { key, emotion, result }
                        });
                    }
                }
            }

            Some(joined) = work.join_next_with_id() => {
                let wants_fill = match joined {
                    Ok((id, Finished::Filled(report))) => {
                        if fill == Some(id) {
                            fill = None;
                        }
                        debug!(generated = report.generated, dropped = report.dropped.len(), "fill pass joined");
                        std::mem::take(&mut refill)
                    }
                    Ok((_, Finished::Regenerated { key, emotion, result })) => match result {
                        Ok(outcome) => {
                            info!(character = %key.character, outfit = %key.outfit, %emotion, url = outcome.url(), "regenerated");
                            emotion.is_neutral()
                        }
                        Err(err) => {
                            warn!(character = %key.character, outfit = %key.outfit, %emotion, error = %err, "regeneration failed");
                            false
                        }
                    },
                    Err(err) => {
                        if fill == Some(err.id()) {
                            fill = None;
                        }
                        warn!(error = %err, "scheduler work aborted");
                        false
                    }
                };
                if wants_fill {
                    if fill.is_some() {
                        refill = true;
                    } else {
                        fill = Some(spawn_fill(&mut work, &scheduler, &cancel));
                    }
                }
            }
        }
    }
    work.shutdown().await;
    debug!("scheduler task exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testkit::{BackendCall, ScriptedBackend};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use stage_model::{CharacterId, CharacterProfile, PersistedState};

    fn config() -> Configuration {
        let mut config = Configuration::default();
        config.scheduler.retry_backoff = Duration::ZERO;
        config.scheduler.max_attempts = 2;
        config
    }

    fn setup(ids: &[&str]) -> (Arc<StageStore>, Arc<ScriptedBackend>, PackScheduler) {
        let store = Arc::new(StageStore::with_state(
            "silhouette.png",
            ids.iter().map(|id| CharacterProfile {
                id: CharacterId::new(*id),
                name: id.to_string(),
                description: "a wandering knight".into(),
                ..CharacterProfile::default()
            }),
            PersistedState::default(),
        ));
        let backend = Arc::new(ScriptedBackend::new());
        let scheduler = PackScheduler::new(store.clone(), backend.clone(), &config());
        (store, backend, scheduler)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3),
        };
        let mut rng = StdRng::seed_from_u64(7);
        let first = policy.backoff(1, &mut rng);
        assert!(first >= Duration::from_secs(1) && first <= Duration::from_millis(1250));
        let second = policy.backoff(2, &mut rng);
        assert!(second >= Duration::from_secs(2) && second <= Duration::from_millis(2500));
        let capped = policy.backoff(9, &mut rng);
        assert!(capped >= Duration::from_secs(3) && capped <= Duration::from_millis(3750));
    }

    #[test]
    fn emotion_subset_always_starts_with_neutral() {
        let (_, _, scheduler) = setup(&["a"]);
        let scheduler = scheduler.with_emotions([Emotion::Joy, Emotion::Anger]);
        assert_eq!(
            scheduler.emotions,
            vec![Emotion::Neutral, Emotion::Anger, Emotion::Joy]
        );
    }

    #[tokio::test]
    async fn next_image_walks_neutral_first_then_stops() {
        let (store, backend, scheduler) = setup(&["a"]);
        let scheduler = scheduler.with_emotions([Emotion::Neutral, Emotion::Joy]);
        let key = PackKey::new("a", "default");

        let first = scheduler.generate_next_image().await.unwrap().unwrap();
        assert_eq!(store.image(&key, Emotion::Neutral).as_deref(), Some(first.url()));
        scheduler.generate_next_image().await.unwrap().unwrap();
        assert!(store.image(&key, Emotion::Joy).is_some());

        backend.clear_calls();
        assert!(scheduler.generate_next_image().await.is_none());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn derived_emotion_requires_neutral_base() {
        let (_, backend, scheduler) = setup(&["a"]);
        let key = PackKey::new("a", "default");
        let err = scheduler.generate_image(&key, Emotion::Joy).await.unwrap_err();
        assert!(matches!(err, PackError::MissingNeutralBase { emotion: Emotion::Joy, .. }));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn neutral_failure_stores_placeholder_and_flags_outfit() {
        let (store, backend, scheduler) = setup(&["a"]);
        backend.fail_make_image(GenerationError::BackendUnavailable("down".into()));
        let scheduler = scheduler.with_emotions([Emotion::Joy]);
        let report = scheduler.run_until_complete(&CancellationToken::new()).await;

        let key = PackKey::new("a", "default");
        assert_eq!(store.image(&key, Emotion::Neutral).as_deref(), Some("silhouette.png"));
        assert!(store.outfit(&key).unwrap().errored);
        assert_eq!(report.fallbacks, 1);
        assert_eq!(report.dropped, vec![key.clone()]);
        // two attempts at neutral, nothing derived from the placeholder
        assert_eq!(backend.image_calls().len(), 2);

        // a later pass retries neutral and then derives from it
        backend.clear_calls();
        backend.queue_make_image(Ok("neutral.png".into()));
        let report = scheduler.run_until_complete(&CancellationToken::new()).await;
        assert_eq!(report.generated, 2);
        assert!(!store.outfit(&key).unwrap().errored);
        match &backend.image_calls()[1] {
            BackendCall::ImageToImage(req) => assert_eq!(req.image, "neutral.png"),
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let (store, backend, scheduler) = setup(&["a"]);
        backend.queue_make_image(Err(GenerationError::Timeout(Duration::from_secs(1))));
        let key = PackKey::new("a", "default");
        let outcome = scheduler.generate_image(&key, Emotion::Neutral).await.unwrap();
        assert!(matches!(outcome, ImageOutcome::Generated(_)));
        assert_eq!(backend.image_calls().len(), 2);
        assert!(!store.outfit(&key).unwrap().errored);
    }

    #[tokio::test]
    async fn rejected_prompt_is_not_retried() {
        let (_, backend, scheduler) = setup(&["a"]);
        backend.fail_make_image(GenerationError::ContentRejected("filtered".into()));
        let key = PackKey::new("a", "default");
        let outcome = scheduler.generate_image(&key, Emotion::Neutral).await.unwrap();
        assert_eq!(outcome, ImageOutcome::Fallback("silhouette.png".into()));
        assert_eq!(backend.image_calls().len(), 1);
    }

    #[tokio::test]
    async fn busy_pack_is_refused() {
        let (store, backend, scheduler) = setup(&["a"]);
        let key = PackKey::new("a", "default");
        let _guard = store.try_begin(&key).unwrap();
        let err = scheduler.generate_image(&key, Emotion::Neutral).await.unwrap_err();
        assert!(matches!(err, PackError::InFlight { .. }));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removal_discards_late_result() {
        let (store, backend, scheduler) = setup(&["a"]);
        backend.set_latency(Duration::from_secs(10));
        let scheduler = Arc::new(scheduler);
        let key = PackKey::new("a", "default");

        let task = tokio::spawn({
            let scheduler = scheduler.clone();
            let key = key.clone();
            async move { scheduler.generate_image(&key, Emotion::Neutral).await }
        });
        while backend.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        store.remove_character(&CharacterId::new("a")).unwrap();

        let res = task.await.unwrap();
        assert!(matches!(res, Err(PackError::Cancelled { .. })));
        assert!(store.image(&key, Emotion::Neutral).is_none());
        assert!(!store.is_in_flight(&key));
    }

    #[tokio::test]
    async fn regenerating_neutral_resets_the_pack() {
        let (store, backend, scheduler) = setup(&["a"]);
        let key = PackKey::new("a", "default");
        store.set_description(&key, "old description");
        store.write_image(&key, Emotion::Neutral, "old-neutral.png").unwrap();
        store.write_image(&key, Emotion::Joy, "old-joy.png").unwrap();

        scheduler.regenerate(&key, Emotion::Neutral).await.unwrap();

        assert!(matches!(backend.calls()[0], BackendCall::TextGen(_)));
        assert_eq!(store.image(&key, Emotion::Joy), None);
        assert_ne!(store.image(&key, Emotion::Neutral).as_deref(), Some("old-neutral.png"));
        assert_eq!(
            store.description(&key).as_deref(),
            Some(ScriptedBackend::DEFAULT_DESCRIPTION)
        );
    }

    #[tokio::test]
    async fn manual_regeneration_does_not_wait_for_fill_pass() {
        let (store, backend, scheduler) = setup(&["a", "b", "c", "d"]);
        let scheduler = scheduler.with_emotions([Emotion::Joy, Emotion::Sadness, Emotion::Anger]);
        let a = PackKey::new("a", "default");
        store.set_description(&a, "a wandering knight");
        store.write_image(&a, Emotion::Neutral, "a-neutral.png").unwrap();
        for emotion in [Emotion::Joy, Emotion::Sadness, Emotion::Anger] {
            store.write_image(&a, emotion, "a-old.png").unwrap();
        }
        backend.set_latency(Duration::from_millis(20));

        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(scheduler, rx, cancel.clone()));
        tx.send(SchedulerCommand::Fill).await.unwrap();
        while backend.image_calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tx.send(SchedulerCommand::Regenerate {
            key: a.clone(),
            emotion: Emotion::Joy,
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.image(&a, Emotion::Joy).as_deref() == Some("a-old.png") {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        // b, c and d need 12 images between them; the pass is still going
        assert!(backend.image_calls().len() < 12);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_running_call() {
        let (_store, backend, scheduler) = setup(&["a"]);
        backend.set_latency(Duration::from_secs(60));
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(scheduler, rx, cancel.clone()));
        tx.send(SchedulerCommand::Fill).await.unwrap();
        while backend.calls().is_empty() {
            tokio::task::yield_now().await;
        }

        let started = tokio::time::Instant::now();
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn pack_updates_are_broadcast() {
        let (_, _, scheduler) = setup(&["a"]);
        let (tx, mut rx) = broadcast::channel(8);
        let scheduler = scheduler.with_events(tx).with_emotions(Vec::new());
        scheduler.run_until_complete(&CancellationToken::new()).await;
        match rx.try_recv().unwrap() {
            StageEvent::PackUpdated { key, emotion, .. } => {
                assert_eq!(key, PackKey::new("a", "default"));
                assert_eq!(emotion, Emotion::Neutral);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
