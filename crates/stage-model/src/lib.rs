//! Persisted state shared between the stage runtime and its host.
//!
//! Everything here is plain data: the emotion vocabulary, per-character
//! wardrobes with their emotion packs, backgrounds, and the chat/message
//! scoped state the host stores on our behalf.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use emotion::{Emotion, UnknownEmotion};
pub use pack::EmotionPack;
pub use state::{
    Background, BackgroundState, CharacterVisualState, ChatMessage, ChatState, MessageState,
    PersistedState,
};
pub use wardrobe::{CharacterProfile, DEFAULT_OUTFIT_NAME, Outfit, Wardrobe};

/// Anonymised character identifier handed out by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterId(String);

impl CharacterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CharacterId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CharacterId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

mod emotion {
    use super::*;

    /// Closed emotion vocabulary, in generation order. `Neutral` is first
    /// because every other image is derived from it.
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    #[serde(rename_all = "lowercase")]
    pub enum Emotion {
        Neutral,
        Admiration,
        Amusement,
        Anger,
        Annoyance,
        Approval,
        Caring,
        Confusion,
        Curiosity,
        Desire,
        Disappointment,
        Disapproval,
        Disgust,
        Embarrassment,
        Excitement,
        Fear,
        Gratitude,
        Grief,
        Joy,
        Love,
        Nervousness,
        Optimism,
        Pride,
        Realization,
        Relief,
        Remorse,
        Sadness,
        Surprise,
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("unknown emotion label: {0:?}")]
    pub struct UnknownEmotion(pub String);

    impl Emotion {
        pub const ALL: [Emotion; 28] = [
            Emotion::Neutral,
            Emotion::Admiration,
            Emotion::Amusement,
            Emotion::Anger,
            Emotion::Annoyance,
            Emotion::Approval,
            Emotion::Caring,
            Emotion::Confusion,
            Emotion::Curiosity,
            Emotion::Desire,
            Emotion::Disappointment,
            Emotion::Disapproval,
            Emotion::Disgust,
            Emotion::Embarrassment,
            Emotion::Excitement,
            Emotion::Fear,
            Emotion::Gratitude,
            Emotion::Grief,
            Emotion::Joy,
            Emotion::Love,
            Emotion::Nervousness,
            Emotion::Optimism,
            Emotion::Pride,
            Emotion::Realization,
            Emotion::Relief,
            Emotion::Remorse,
            Emotion::Sadness,
            Emotion::Surprise,
        ];

        pub fn as_str(&self) -> &'static str {
            match self {
                Self::Neutral => "neutral",
                Self::Admiration => "admiration",
                Self::Amusement => "amusement",
                Self::Anger => "anger",
                Self::Annoyance => "annoyance",
                Self::Approval => "approval",
                Self::Caring => "caring",
                Self::Confusion => "confusion",
                Self::Curiosity => "curiosity",
                Self::Desire => "desire",
                Self::Disappointment => "disappointment",
                Self::Disapproval => "disapproval",
                Self::Disgust => "disgust",
                Self::Embarrassment => "embarrassment",
                Self::Excitement => "excitement",
                Self::Fear => "fear",
                Self::Gratitude => "gratitude",
                Self::Grief => "grief",
                Self::Joy => "joy",
                Self::Love => "love",
                Self::Nervousness => "nervousness",
                Self::Optimism => "optimism",
                Self::Pride => "pride",
                Self::Realization => "realization",
                Self::Relief => "relief",
                Self::Remorse => "remorse",
                Self::Sadness => "sadness",
                Self::Surprise => "surprise",
            }
        }

        /// Expression fragment appended to the art prompt for this emotion.
        pub fn prompt(&self) -> &'static str {
            match self {
                Self::Neutral => "calm expression",
                Self::Admiration => "admiring expression",
                Self::Amusement => "amused expression",
                Self::Anger => "angry expression",
                Self::Annoyance => "annoyed, dismayed expression",
                Self::Approval => "approving expression",
                Self::Caring => "thoughtful, caring expression",
                Self::Confusion => "stunned, confused expression",
                Self::Curiosity => "curious, interested expression",
                Self::Desire => "sultry, longing expression",
                Self::Disappointment => "unhappy, disappointed expression",
                Self::Disapproval => "disapproving expression",
                Self::Disgust => "disgusted expression",
                Self::Embarrassment => "embarrassed, blushing",
                Self::Excitement => "excited expression",
                Self::Fear => "terrified expression",
                Self::Gratitude => "thankful expression",
                Self::Grief => "depressed, sobbing expression",
                Self::Joy => "happy, smiling",
                Self::Love => "adorable, grinning, blushing, lovestruck expression",
                Self::Nervousness => "nervous, uneasy expression",
                Self::Optimism => "hopeful expression",
                Self::Pride => "proud, haughty expression",
                Self::Realization => "epiphany",
                Self::Relief => "relieved expression",
                Self::Remorse => "guilty expression",
                Self::Sadness => "sad, upset expression, teary",
                Self::Surprise => "pleasantly surprised expression",
            }
        }

        /// Closest related emotion, consulted when this emotion has no image.
        /// Core emotions (joy, anger, sadness, ...) map to themselves.
        pub fn fallback(&self) -> Emotion {
            match self {
                Self::Admiration => Self::Approval,
                Self::Amusement
                | Self::Approval
                | Self::Excitement
                | Self::Gratitude
                | Self::Optimism
                | Self::Pride
                | Self::Relief => Self::Joy,
                Self::Annoyance | Self::Disapproval | Self::Disgust => Self::Anger,
                Self::Caring | Self::Desire => Self::Love,
                Self::Confusion | Self::Curiosity | Self::Realization => Self::Surprise,
                Self::Disappointment | Self::Grief | Self::Remorse => Self::Sadness,
                Self::Embarrassment => Self::Nervousness,
                Self::Nervousness => Self::Fear,
                other => *other,
            }
        }

        pub fn is_neutral(&self) -> bool {
            matches!(self, Self::Neutral)
        }
    }

    impl Default for Emotion {
        fn default() -> Self {
            Self::Neutral
        }
    }

    impl fmt::Display for Emotion {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl FromStr for Emotion {
        type Err = UnknownEmotion;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let lowered = s.trim().to_ascii_lowercase();
            Self::ALL
                .iter()
                .copied()
                .find(|emotion| emotion.as_str() == lowered)
                .ok_or_else(|| UnknownEmotion(s.to_string()))
        }
    }
}

mod pack {
    use super::*;

    /// Emotion → image URL for one (character, outfit) pair.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct EmotionPack(BTreeMap<Emotion, String>);

    impl EmotionPack {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn get(&self, emotion: Emotion) -> Option<&str> {
            self.0
                .get(&emotion)
                .map(String::as_str)
                .filter(|url| !url.is_empty())
        }

        pub fn insert(&mut self, emotion: Emotion, url: impl Into<String>) -> Option<String> {
            self.0.insert(emotion, url.into())
        }

        pub fn remove(&mut self, emotion: Emotion) -> Option<String> {
            self.0.remove(&emotion)
        }

        pub fn clear(&mut self) {
            self.0.clear();
        }

        pub fn contains(&self, emotion: Emotion) -> bool {
            self.get(emotion).is_some()
        }

        pub fn len(&self) -> usize {
            self.0.len()
        }

        pub fn is_empty(&self) -> bool {
            self.0.is_empty()
        }

        /// A pack can be displayed once its neutral image exists.
        pub fn is_usable(&self) -> bool {
            self.contains(Emotion::Neutral)
        }

        pub fn is_complete(&self) -> bool {
            self.missing().next().is_none()
        }

        /// Emotions without an image, in generation order.
        pub fn missing(&self) -> impl Iterator<Item = Emotion> + '_ {
            Emotion::ALL
                .into_iter()
                .filter(move |emotion| !self.contains(*emotion))
        }

        /// Resolve the image for `emotion`: the emotion itself, then its
        /// fallback family, then neutral. A pack without neutral resolves
        /// nothing.
        pub fn resolve(&self, emotion: Emotion) -> Option<&str> {
            if !self.is_usable() {
                return None;
            }
            self.get(emotion)
                .or_else(|| self.get(emotion.fallback()))
                .or_else(|| self.get(Emotion::Neutral))
        }

        pub fn iter(&self) -> impl Iterator<Item = (Emotion, &str)> {
            self.0.iter().map(|(emotion, url)| (*emotion, url.as_str()))
        }
    }

    impl FromIterator<(Emotion, String)> for EmotionPack {
        fn from_iter<T: IntoIterator<Item = (Emotion, String)>>(iter: T) -> Self {
            Self(iter.into_iter().collect())
        }
    }
}

mod wardrobe {
    use super::*;

    pub const DEFAULT_OUTFIT_NAME: &str = "default";

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Outfit {
        pub pack: EmotionPack,
        /// Produced by the generation pipeline rather than authored.
        pub generated: bool,
        /// Visible across chats rather than only in this one.
        pub global: bool,
        pub art_prompt: String,
        pub trigger_words: String,
        /// Neutral generation failed and the placeholder is in use.
        pub errored: bool,
    }

    impl Outfit {
        pub fn generated() -> Self {
            Self {
                generated: true,
                ..Self::default()
            }
        }

        pub fn authored(pack: EmotionPack) -> Self {
            Self {
                pack,
                generated: false,
                ..Self::default()
            }
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Wardrobe(BTreeMap<String, Outfit>);

    impl Wardrobe {
        /// Wardrobe holding a single empty generated default outfit.
        pub fn with_default() -> Self {
            let mut outfits = BTreeMap::new();
            outfits.insert(DEFAULT_OUTFIT_NAME.to_string(), Outfit::generated());
            Self(outfits)
        }

        pub fn get(&self, name: &str) -> Option<&Outfit> {
            self.0.get(name)
        }

        pub fn get_mut(&mut self, name: &str) -> Option<&mut Outfit> {
            self.0.get_mut(name)
        }

        pub fn insert(&mut self, name: impl Into<String>, outfit: Outfit) -> Option<Outfit> {
            self.0.insert(name.into(), outfit)
        }

        pub fn remove(&mut self, name: &str) -> Option<Outfit> {
            self.0.remove(name)
        }

        pub fn contains(&self, name: &str) -> bool {
            self.0.contains_key(name)
        }

        pub fn len(&self) -> usize {
            self.0.len()
        }

        pub fn is_empty(&self) -> bool {
            self.0.is_empty()
        }

        pub fn names(&self) -> impl Iterator<Item = &str> {
            self.0.keys().map(String::as_str)
        }

        pub fn iter(&self) -> impl Iterator<Item = (&str, &Outfit)> {
            self.0.iter().map(|(name, outfit)| (name.as_str(), outfit))
        }
    }

    /// Character data supplied by the host.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct CharacterProfile {
        pub id: CharacterId,
        pub name: String,
        pub description: String,
        pub personality: String,
        pub removed: bool,
        /// Hand-authored expressions shipped with the character card.
        pub authored_pack: Option<EmotionPack>,
        /// Hand-authored alternate outfits shipped with the character card.
        pub authored_outfits: BTreeMap<String, EmotionPack>,
    }
}

mod state {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Background {
        pub url: Option<String>,
        pub depth_url: Option<String>,
        pub art_prompt: String,
        pub trigger_words: String,
        pub global: bool,
        /// The last generation attempt for this prompt failed.
        pub errored: bool,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct BackgroundState {
        pub url: Option<String>,
        pub depth_url: Option<String>,
        /// Turns remaining before another background may be generated.
        pub cooldown: u32,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct CharacterVisualState {
        pub emotion: Emotion,
        pub outfit: String,
        pub speaking: bool,
    }

    /// Chat-scoped state: survives across messages and swipes.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ChatState {
        pub wardrobes: BTreeMap<CharacterId, Wardrobe>,
        /// Visual descriptions keyed by character, then outfit name.
        pub descriptions: BTreeMap<CharacterId, BTreeMap<String, String>>,
        pub selected_outfit: BTreeMap<CharacterId, String>,
        pub backgrounds: BTreeMap<String, Background>,
        pub selected_background: Option<String>,
    }

    /// Message-scoped state: travels with each message.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct MessageState {
        pub background: BackgroundState,
        pub character_emotion: BTreeMap<CharacterId, Emotion>,
        pub active_speaker: Option<CharacterId>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct PersistedState {
        pub chat: ChatState,
        pub message: MessageState,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ChatMessage {
        pub author: CharacterId,
        pub content: String,
        #[serde(default)]
        pub is_bot: bool,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emotion_order_starts_with_neutral() {
        assert_eq!(Emotion::ALL[0], Emotion::Neutral);
        let mut sorted = Emotion::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, Emotion::ALL.to_vec());
    }

    #[test]
    fn emotion_parses_case_insensitively() {
        assert_eq!("JOY".parse::<Emotion>().unwrap(), Emotion::Joy);
        assert_eq!(" grief ".parse::<Emotion>().unwrap(), Emotion::Grief);
        assert!("smug".parse::<Emotion>().is_err());
    }

    #[test]
    fn fallbacks_point_at_primary_emotions() {
        for emotion in Emotion::ALL {
            let fallback = emotion.fallback();
            assert_eq!(
                fallback.fallback().fallback(),
                fallback.fallback(),
                "{emotion} fallback chain must settle"
            );
        }
        assert_eq!(Emotion::Annoyance.fallback(), Emotion::Anger);
        assert_eq!(Emotion::Neutral.fallback(), Emotion::Neutral);
    }

    #[test]
    fn pack_resolves_through_fallback_then_neutral() {
        let mut pack = EmotionPack::new();
        assert_eq!(pack.resolve(Emotion::Joy), None);
        pack.insert(Emotion::Neutral, "neutral.png");
        assert_eq!(pack.resolve(Emotion::Amusement), Some("neutral.png"));
        pack.insert(Emotion::Joy, "joy.png");
        assert_eq!(pack.resolve(Emotion::Amusement), Some("joy.png"));
        pack.insert(Emotion::Amusement, "amused.png");
        assert_eq!(pack.resolve(Emotion::Amusement), Some("amused.png"));
    }

    #[test]
    fn pack_without_neutral_is_not_displayed() {
        let pack: EmotionPack = serde_json::from_str(r#"{"joy":"joy.png"}"#).unwrap();
        assert!(!pack.is_usable());
        assert_eq!(pack.resolve(Emotion::Joy), None);
        assert_eq!(pack.resolve(Emotion::Neutral), None);
    }

    #[test]
    fn empty_urls_count_as_missing() {
        let mut pack = EmotionPack::new();
        pack.insert(Emotion::Neutral, "");
        assert!(!pack.is_usable());
        assert_eq!(pack.missing().next(), Some(Emotion::Neutral));
    }

    #[test]
    fn persisted_state_round_trips_through_json() {
        let mut chat = ChatState::default();
        let id = CharacterId::new("anon-1");
        let mut wardrobe = Wardrobe::with_default();
        wardrobe
            .get_mut(DEFAULT_OUTFIT_NAME)
            .unwrap()
            .pack
            .insert(Emotion::Neutral, "https://img/neutral.png");
        chat.wardrobes.insert(id.clone(), wardrobe);
        let mut message = MessageState::default();
        message.character_emotion.insert(id.clone(), Emotion::Joy);

        let state = PersistedState { chat, message };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"neutral\":\"https://img/neutral.png\""));
        assert!(json.contains("\"anon-1\":\"joy\""));
        let back: PersistedState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
