use std::sync::Arc;
use std::time::Duration;

use stage_model::Emotion;
use tracing::{debug, warn};

use crate::backend::{ClassifierBackend, LabelScore, ranked, with_timeout};

/// Picks an emotion for a message: classifier first, keyword scan as fallback.
#[derive(Clone)]
pub struct EmotionClassifier {
    backend: Option<Arc<dyn ClassifierBackend>>,
    threshold: f32,
    call_timeout: Duration,
}

impl EmotionClassifier {
    pub fn new(
        backend: Option<Arc<dyn ClassifierBackend>>,
        threshold: f32,
        call_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            threshold,
            call_timeout,
        }
    }

    pub async fn classify(&self, text: &str) -> Emotion {
        let Some(backend) = &self.backend else {
            return keyword_emotion(text);
        };
        match with_timeout(self.call_timeout, backend.classify_emotion(text)).await {
            Ok(scores) => {
                let emotion = best_label(scores, self.threshold);
                debug!(%emotion, "classified message");
                emotion
            }
            Err(err) => {
                warn!(error = %err, "emotion classifier failed; using keyword scan");
                keyword_emotion(text)
            }
        }
    }
}

/// Highest-confidence non-neutral label strictly above `threshold`.
/// Unknown labels are ignored; nothing qualifying yields neutral.
pub fn best_label(scores: Vec<LabelScore>, threshold: f32) -> Emotion {
    ranked(scores)
        .into_iter()
        .filter(|score| score.score > threshold)
        .filter_map(|score| score.label.parse::<Emotion>().ok())
        .find(|emotion| !emotion.is_neutral())
        .unwrap_or_default()
}

/// Substring scan over the emotion labels; the last label in vocabulary
/// order that appears wins.
pub fn keyword_emotion(text: &str) -> Emotion {
    let lowered = text.to_lowercase();
    Emotion::ALL
        .iter()
        .rev()
        .copied()
        .find(|emotion| lowered.contains(emotion.as_str()))
        .unwrap_or_default()
}
