//! Shared stage state: roster, wardrobes, backgrounds and message state.
//!
//! All access goes through typed methods; the lock is never exposed and never
//! held across an `.await`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use stage_model::{
    Background, BackgroundState, CharacterId, CharacterProfile, CharacterVisualState, ChatState,
    DEFAULT_OUTFIT_NAME, Emotion, EmotionPack, MessageState, Outfit, PersistedState, Wardrobe,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{PackError, StoreError};

/// Identifies one emotion pack: a character wearing a named outfit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackKey {
    pub character: CharacterId,
    pub outfit: String,
}

impl PackKey {
    pub fn new(character: impl Into<CharacterId>, outfit: impl Into<String>) -> Self {
        Self {
            character: character.into(),
            outfit: outfit.into(),
        }
    }
}

impl fmt::Display for PackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.character, self.outfit)
    }
}

/// Read-only image resolution used by rendering and layout.
pub trait ImageLookup {
    /// URL to display for a character; never empty.
    fn character_image(&self, character: &CharacterId, outfit: &str, emotion: Emotion) -> String;

    fn background_state(&self) -> BackgroundState;
}

#[derive(Debug)]
struct InFlightEntry {
    ticket: u64,
    token: CancellationToken,
}

type InFlightMap = Arc<Mutex<BTreeMap<PackKey, InFlightEntry>>>;

/// Exclusive right to write one pack while generation runs.
///
/// Dropping the guard releases the key; removal of the character or outfit
/// cancels [`InFlightGuard::token`] instead.
#[derive(Debug)]
pub struct InFlightGuard {
    key: PackKey,
    ticket: u64,
    token: CancellationToken,
    map: InFlightMap,
}

impl InFlightGuard {
    pub fn key(&self) -> &PackKey {
        &self.key
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        if map.get(&self.key).is_some_and(|entry| entry.ticket == self.ticket) {
            map.remove(&self.key);
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    roster: BTreeMap<CharacterId, CharacterProfile>,
    chat: ChatState,
    message: MessageState,
}

impl StoreInner {
    fn wardrobe(&self, character: &CharacterId) -> Option<&Wardrobe> {
        self.chat.wardrobes.get(character)
    }

    fn outfit_mut(&mut self, key: &PackKey) -> Option<&mut Outfit> {
        self.chat
            .wardrobes
            .get_mut(&key.character)
            .and_then(|wardrobe| wardrobe.get_mut(&key.outfit))
    }

    fn is_active(&self, character: &CharacterId) -> bool {
        self.roster
            .get(character)
            .is_some_and(|profile| !profile.removed)
    }
}

#[derive(Debug)]
pub struct StageStore {
    inner: RwLock<StoreInner>,
    in_flight: InFlightMap,
    tickets: AtomicU64,
    placeholder: String,
}

impl StageStore {
    pub fn new(placeholder: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            in_flight: Arc::new(Mutex::new(BTreeMap::new())),
            tickets: AtomicU64::new(0),
            placeholder: placeholder.into(),
        }
    }

    /// Seed the store from host-provided characters and previously persisted state.
    pub fn with_state(
        placeholder: impl Into<String>,
        roster: impl IntoIterator<Item = CharacterProfile>,
        state: PersistedState,
    ) -> Self {
        let store = Self::new(placeholder);
        {
            let mut inner = store.inner.write();
            inner.chat = state.chat;
            inner.message = state.message;
        }
        for profile in roster {
            store.ensure_character(profile);
        }
        store
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Register a character, creating its wardrobe on first reference.
    ///
    /// Authored packs become non-generated outfits; characters without one
    /// get an empty generated default outfit.
    pub fn ensure_character(&self, profile: CharacterProfile) {
        let mut inner = self.inner.write();
        let id = profile.id.clone();
        if profile.removed {
            debug!(character = %id, "skipping removed character");
            inner.roster.insert(id, profile);
            return;
        }
        let wardrobe = inner.chat.wardrobes.entry(id.clone()).or_insert_with(|| {
            match &profile.authored_pack {
                Some(pack) => {
                    let mut wardrobe = Wardrobe::default();
                    wardrobe.insert(DEFAULT_OUTFIT_NAME, Outfit::authored(pack.clone()));
                    wardrobe
                }
                None => Wardrobe::with_default(),
            }
        });
        for (name, pack) in &profile.authored_outfits {
            if !wardrobe.contains(name) {
                wardrobe.insert(name.clone(), Outfit::authored(pack.clone()));
            }
        }
        inner.roster.insert(id, profile);
    }

    /// Active characters in id order.
    pub fn roster(&self) -> Vec<CharacterProfile> {
        self.inner
            .read()
            .roster
            .values()
            .filter(|profile| !profile.removed)
            .cloned()
            .collect()
    }

    pub fn character(&self, id: &CharacterId) -> Option<CharacterProfile> {
        let inner = self.inner.read();
        inner
            .roster
            .get(id)
            .filter(|profile| !profile.removed)
            .cloned()
    }

    pub fn contains_character(&self, id: &CharacterId) -> bool {
        self.inner.read().is_active(id)
    }

    pub fn outfit(&self, key: &PackKey) -> Option<Outfit> {
        self.inner
            .read()
            .wardrobe(&key.character)
            .and_then(|wardrobe| wardrobe.get(&key.outfit))
            .cloned()
    }

    pub fn outfit_names(&self, character: &CharacterId) -> Vec<String> {
        self.inner
            .read()
            .wardrobe(character)
            .map(|wardrobe| wardrobe.names().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Generated packs of active characters, character-major then by outfit name.
    pub fn generated_packs(&self) -> Vec<(PackKey, EmotionPack)> {
        let inner = self.inner.read();
        let mut packs = Vec::new();
        for (id, wardrobe) in &inner.chat.wardrobes {
            if !inner.is_active(id) {
                continue;
            }
            for (name, outfit) in wardrobe.iter() {
                if outfit.generated {
                    packs.push((PackKey::new(id.clone(), name), outfit.pack.clone()));
                }
            }
        }
        packs
    }

    pub fn image(&self, key: &PackKey, emotion: Emotion) -> Option<String> {
        self.inner
            .read()
            .wardrobe(&key.character)
            .and_then(|wardrobe| wardrobe.get(&key.outfit))
            .and_then(|outfit| outfit.pack.get(emotion))
            .map(str::to_string)
    }

    pub fn description(&self, key: &PackKey) -> Option<String> {
        self.inner
            .read()
            .chat
            .descriptions
            .get(&key.character)
            .and_then(|by_outfit| by_outfit.get(&key.outfit))
            .filter(|text| !text.trim().is_empty())
            .cloned()
    }

    pub fn set_description(&self, key: &PackKey, description: impl Into<String>) {
        self.inner
            .write()
            .chat
            .descriptions
            .entry(key.character.clone())
            .or_default()
            .insert(key.outfit.clone(), description.into());
    }

    pub fn clear_description(&self, key: &PackKey) {
        if let Some(by_outfit) = self.inner.write().chat.descriptions.get_mut(&key.character) {
            by_outfit.remove(&key.outfit);
        }
    }

    /// Store a generated image. Fails if the pack disappeared meanwhile.
    pub fn write_image(
        &self,
        key: &PackKey,
        emotion: Emotion,
        url: impl Into<String>,
    ) -> Result<(), PackError> {
        let mut inner = self.inner.write();
        if !inner.is_active(&key.character) {
            return Err(PackError::UnknownCharacter(key.character.clone()));
        }
        let outfit = inner.outfit_mut(key).ok_or_else(|| PackError::UnknownOutfit {
            character: key.character.clone(),
            outfit: key.outfit.clone(),
        })?;
        outfit.pack.insert(emotion, url);
        Ok(())
    }

    pub fn set_errored(&self, key: &PackKey, errored: bool) {
        if let Some(outfit) = self.inner.write().outfit_mut(key) {
            outfit.errored = errored;
        }
    }

    /// Drop every image of a pack so it is regenerated from scratch.
    pub fn clear_pack(&self, key: &PackKey) {
        if let Some(outfit) = self.inner.write().outfit_mut(key) {
            outfit.pack.clear();
            outfit.errored = false;
        }
    }

    /// Claim a pack for generation; refused while another claim is live.
    pub fn try_begin(&self, key: &PackKey) -> Result<InFlightGuard, PackError> {
        let mut map = self.in_flight.lock();
        if map.contains_key(key) {
            return Err(PackError::InFlight {
                character: key.character.clone(),
                outfit: key.outfit.clone(),
            });
        }
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        map.insert(
            key.clone(),
            InFlightEntry {
                ticket,
                token: token.clone(),
            },
        );
        Ok(InFlightGuard {
            key: key.clone(),
            ticket,
            token,
            map: Arc::clone(&self.in_flight),
        })
    }

    pub fn is_in_flight(&self, key: &PackKey) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    fn cancel_where(&self, matches: impl Fn(&PackKey) -> bool) {
        let mut map = self.in_flight.lock();
        map.retain(|key, entry| {
            if matches(key) {
                debug!(%key, "cancelling in-flight generation");
                entry.token.cancel();
                false
            } else {
                true
            }
        });
    }

    pub fn selected_outfit(&self, character: &CharacterId) -> String {
        let inner = self.inner.read();
        inner
            .chat
            .selected_outfit
            .get(character)
            .filter(|name| {
                inner
                    .wardrobe(character)
                    .is_some_and(|wardrobe| wardrobe.contains(name))
            })
            .cloned()
            .unwrap_or_else(|| DEFAULT_OUTFIT_NAME.to_string())
    }

    pub fn select_outfit(&self, character: &CharacterId, outfit: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let wardrobe = inner
            .wardrobe(character)
            .ok_or_else(|| StoreError::UnknownCharacter(character.clone()))?;
        if !wardrobe.contains(outfit) {
            return Err(StoreError::UnknownOutfit {
                character: character.clone(),
                outfit: outfit.to_string(),
            });
        }
        inner
            .chat
            .selected_outfit
            .insert(character.clone(), outfit.to_string());
        Ok(())
    }

    pub fn add_outfit(
        &self,
        character: &CharacterId,
        name: &str,
        art_prompt: &str,
        trigger_words: &str,
        global: bool,
    ) -> Result<(), StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidOutfitName(name.to_string()));
        }
        let mut inner = self.inner.write();
        let wardrobe = inner
            .chat
            .wardrobes
            .get_mut(character)
            .ok_or_else(|| StoreError::UnknownCharacter(character.clone()))?;
        if wardrobe.contains(name) {
            return Err(StoreError::DuplicateOutfit {
                character: character.clone(),
                outfit: name.to_string(),
            });
        }
        wardrobe.insert(
            name,
            Outfit {
                art_prompt: art_prompt.to_string(),
                trigger_words: trigger_words.to_string(),
                global,
                ..Outfit::generated()
            },
        );
        info!(%character, outfit = name, "outfit added");
        Ok(())
    }

    /// Insert an authored outfit from a JSON emotion → URL map.
    ///
    /// Importing over an existing outfit replaces it and cancels any
    /// generation still running for the old pack.
    pub fn import_outfit_json(
        &self,
        character: &CharacterId,
        name: &str,
        json: &str,
    ) -> Result<(), StoreError> {
        let pack: EmotionPack = serde_json::from_str(json)?;
        let name = name.trim();
        if name.is_empty() || name == DEFAULT_OUTFIT_NAME {
            return Err(StoreError::InvalidOutfitName(name.to_string()));
        }
        let replaced = {
            let mut inner = self.inner.write();
            let wardrobe = inner
                .chat
                .wardrobes
                .get_mut(character)
                .ok_or_else(|| StoreError::UnknownCharacter(character.clone()))?;
            let replaced = wardrobe.insert(name, Outfit::authored(pack)).is_some();
            if replaced {
                if let Some(by_outfit) = inner.chat.descriptions.get_mut(character) {
                    by_outfit.remove(name);
                }
            }
            replaced
        };
        if replaced {
            self.cancel_where(|key| &key.character == character && key.outfit == name);
            info!(%character, outfit = name, "outfit replaced by import");
        }
        Ok(())
    }

    pub fn remove_outfit(&self, character: &CharacterId, name: &str) -> Result<(), StoreError> {
        if name == DEFAULT_OUTFIT_NAME {
            return Err(StoreError::InvalidOutfitName(name.to_string()));
        }
        {
            let mut inner = self.inner.write();
            let wardrobe = inner
                .chat
                .wardrobes
                .get_mut(character)
                .ok_or_else(|| StoreError::UnknownCharacter(character.clone()))?;
            if !wardrobe.contains(name) {
                return Err(StoreError::UnknownOutfit {
                    character: character.clone(),
                    outfit: name.to_string(),
                });
            }
            if wardrobe.len() == 1 {
                return Err(StoreError::LastOutfit(character.clone()));
            }
            wardrobe.remove(name);
            if let Some(by_outfit) = inner.chat.descriptions.get_mut(character) {
                by_outfit.remove(name);
            }
            if inner.chat.selected_outfit.get(character).map(String::as_str) == Some(name) {
                inner.chat.selected_outfit.remove(character);
            }
        }
        self.cancel_where(|key| &key.character == character && key.outfit == name);
        info!(%character, outfit = name, "outfit removed");
        Ok(())
    }

    pub fn rename_outfit(
        &self,
        character: &CharacterId,
        from: &str,
        to: &str,
    ) -> Result<(), StoreError> {
        let to = to.trim();
        if from == DEFAULT_OUTFIT_NAME {
            return Err(StoreError::InvalidOutfitName(from.to_string()));
        }
        if to == DEFAULT_OUTFIT_NAME || to.is_empty() {
            return Err(StoreError::InvalidOutfitName(to.to_string()));
        }
        {
            let mut inner = self.inner.write();
            let wardrobe = inner
                .chat
                .wardrobes
                .get_mut(character)
                .ok_or_else(|| StoreError::UnknownCharacter(character.clone()))?;
            if wardrobe.contains(to) {
                return Err(StoreError::DuplicateOutfit {
                    character: character.clone(),
                    outfit: to.to_string(),
                });
            }
            let outfit = wardrobe.remove(from).ok_or_else(|| StoreError::UnknownOutfit {
                character: character.clone(),
                outfit: from.to_string(),
            })?;
            wardrobe.insert(to, outfit);
            if let Some(by_outfit) = inner.chat.descriptions.get_mut(character) {
                if let Some(description) = by_outfit.remove(from) {
                    by_outfit.insert(to.to_string(), description);
                }
            }
            if let Some(selected) = inner.chat.selected_outfit.get_mut(character) {
                if selected == from {
                    *selected = to.to_string();
                }
            }
        }
        self.cancel_where(|key| &key.character == character && key.outfit == from);
        Ok(())
    }

    /// Forget a character entirely and cancel its pending generation.
    pub fn remove_character(&self, character: &CharacterId) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write();
            let profile = inner
                .roster
                .get_mut(character)
                .ok_or_else(|| StoreError::UnknownCharacter(character.clone()))?;
            profile.removed = true;
            inner.chat.wardrobes.remove(character);
            inner.chat.descriptions.remove(character);
            inner.chat.selected_outfit.remove(character);
            inner.message.character_emotion.remove(character);
            if inner.message.active_speaker.as_ref() == Some(character) {
                inner.message.active_speaker = None;
            }
        }
        self.cancel_where(|key| &key.character == character);
        info!(%character, "character removed");
        Ok(())
    }

    pub fn visual_state(&self, character: &CharacterId) -> CharacterVisualState {
        let emotion = self
            .inner
            .read()
            .message
            .character_emotion
            .get(character)
            .copied()
            .unwrap_or_default();
        let speaking = self.active_speaker().as_ref() == Some(character);
        CharacterVisualState {
            emotion,
            outfit: self.selected_outfit(character),
            speaking,
        }
    }

    pub fn set_emotion(&self, character: &CharacterId, emotion: Emotion) {
        self.inner
            .write()
            .message
            .character_emotion
            .insert(character.clone(), emotion);
    }

    pub fn active_speaker(&self) -> Option<CharacterId> {
        self.inner.read().message.active_speaker.clone()
    }

    pub fn set_active_speaker(&self, character: Option<CharacterId>) {
        self.inner.write().message.active_speaker = character;
    }

    pub fn message_state(&self) -> MessageState {
        self.inner.read().message.clone()
    }

    pub fn set_message_state(&self, message: MessageState) {
        self.inner.write().message = message;
    }

    pub fn chat_state(&self) -> ChatState {
        self.inner.read().chat.clone()
    }

    pub fn snapshot(&self) -> PersistedState {
        let inner = self.inner.read();
        PersistedState {
            chat: inner.chat.clone(),
            message: inner.message.clone(),
        }
    }

    pub fn set_background_state(&self, background: BackgroundState) {
        self.inner.write().message.background = background;
    }

    /// Decrement the cooldown if it is running; returns the value before.
    pub fn tick_cooldown(&self) -> u32 {
        let mut inner = self.inner.write();
        let before = inner.message.background.cooldown;
        inner.message.background.cooldown = before.saturating_sub(1);
        before
    }

    pub fn set_cooldown(&self, turns: u32) {
        self.inner.write().message.background.cooldown = turns;
    }

    pub fn background(&self, name: &str) -> Option<Background> {
        self.inner.read().chat.backgrounds.get(name).cloned()
    }

    pub fn background_names(&self) -> Vec<String> {
        self.inner.read().chat.backgrounds.keys().cloned().collect()
    }

    pub fn record_background(&self, name: &str, background: Background) {
        self.inner
            .write()
            .chat
            .backgrounds
            .insert(name.to_string(), background);
    }

    /// Show a named background; its URLs replace the current background state.
    pub fn select_background(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let background = inner
            .chat
            .backgrounds
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownBackground(name.to_string()))?;
        inner.chat.selected_background = Some(name.to_string());
        inner.message.background.url = background.url;
        inner.message.background.depth_url = background.depth_url;
        Ok(())
    }

    pub fn import_background_json(&self, name: &str, json: &str) -> Result<(), StoreError> {
        let background: Background = serde_json::from_str(json)?;
        self.record_background(name, background);
        Ok(())
    }
}

impl ImageLookup for StageStore {
    fn character_image(&self, character: &CharacterId, outfit: &str, emotion: Emotion) -> String {
        let inner = self.inner.read();
        inner
            .wardrobe(character)
            .and_then(|wardrobe| {
                wardrobe
                    .get(outfit)
                    .filter(|found| found.pack.is_usable())
                    .or_else(|| wardrobe.get(DEFAULT_OUTFIT_NAME))
            })
            .and_then(|outfit| outfit.pack.resolve(emotion))
            .map(str::to_string)
            .unwrap_or_else(|| self.placeholder.clone())
    }

    fn background_state(&self) -> BackgroundState {
        self.inner.read().message.background.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str) -> CharacterProfile {
        CharacterProfile {
            id: CharacterId::new(id),
            name: id.to_uppercase(),
            description: format!("{id} description"),
            ..CharacterProfile::default()
        }
    }

    fn store_with(ids: &[&str]) -> StageStore {
        StageStore::with_state(
            "placeholder.png",
            ids.iter().map(|id| profile(id)),
            PersistedState::default(),
        )
    }

    #[test]
    fn image_lookup_is_never_empty() {
        let store = store_with(&["a"]);
        let a = CharacterId::new("a");
        for emotion in Emotion::ALL {
            assert_eq!(store.character_image(&a, "default", emotion), "placeholder.png");
        }
        assert_eq!(
            store.character_image(&CharacterId::new("ghost"), "default", Emotion::Joy),
            "placeholder.png"
        );

        let key = PackKey::new("a", "default");
        store.write_image(&key, Emotion::Neutral, "n.png").unwrap();
        assert_eq!(store.character_image(&a, "default", Emotion::Grief), "n.png");
        store.write_image(&key, Emotion::Sadness, "s.png").unwrap();
        assert_eq!(store.character_image(&a, "default", Emotion::Grief), "s.png");
        assert_eq!(store.character_image(&a, "missing-outfit", Emotion::Grief), "s.png");

        // an imported pack without neutral is not shown
        store
            .import_outfit_json(&a, "sketch", r#"{"joy":"sketch-joy.png"}"#)
            .unwrap();
        assert_eq!(store.character_image(&a, "sketch", Emotion::Joy), "n.png");
    }

    #[test]
    fn authored_packs_are_not_generated() {
        let mut authored = profile("b");
        authored.authored_pack = Some(EmotionPack::from_iter([(
            Emotion::Neutral,
            "authored.png".to_string(),
        )]));
        authored
            .authored_outfits
            .insert("formal".into(), EmotionPack::new());
        let store = StageStore::with_state("p.png", [authored, profile("a")], PersistedState::default());

        let keys: Vec<_> = store.generated_packs().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![PackKey::new("a", "default")]);
        assert_eq!(store.outfit_names(&CharacterId::new("b")), vec!["default", "formal"]);
    }

    #[test]
    fn in_flight_claims_are_exclusive() {
        let store = store_with(&["a"]);
        let key = PackKey::new("a", "default");
        let guard = store.try_begin(&key).unwrap();
        assert!(matches!(store.try_begin(&key), Err(PackError::InFlight { .. })));
        drop(guard);
        assert!(store.try_begin(&key).is_ok());
    }

    #[test]
    fn removing_character_cancels_its_claims() {
        let store = store_with(&["a", "b"]);
        let a = store.try_begin(&PackKey::new("a", "default")).unwrap();
        let b = store.try_begin(&PackKey::new("b", "default")).unwrap();
        store.remove_character(&CharacterId::new("a")).unwrap();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(store.write_image(a.key(), Emotion::Neutral, "late.png").is_err());
        assert!(store.character(&CharacterId::new("a")).is_none());

        // a stale guard must not release a fresh claim on the same key
        let fresh = store.try_begin(&PackKey::new("a", "default")).unwrap();
        drop(a);
        assert!(store.is_in_flight(fresh.key()));
    }

    #[test]
    fn outfit_management_rules() {
        let store = store_with(&["a"]);
        let a = CharacterId::new("a");
        store.add_outfit(&a, "swimwear", "blue swimsuit", "", false).unwrap();
        assert!(matches!(
            store.add_outfit(&a, "swimwear", "", "", false),
            Err(StoreError::DuplicateOutfit { .. })
        ));
        assert!(matches!(
            store.remove_outfit(&a, DEFAULT_OUTFIT_NAME),
            Err(StoreError::InvalidOutfitName(_))
        ));

        store.set_description(&PackKey::new("a", "swimwear"), "wet hair");
        store.select_outfit(&a, "swimwear").unwrap();
        store.rename_outfit(&a, "swimwear", "beach").unwrap();
        assert_eq!(store.selected_outfit(&a), "beach");
        assert_eq!(
            store.description(&PackKey::new("a", "beach")).as_deref(),
            Some("wet hair")
        );

        store.remove_outfit(&a, "beach").unwrap();
        assert_eq!(store.selected_outfit(&a), DEFAULT_OUTFIT_NAME);
        assert_eq!(store.outfit_names(&a), vec![DEFAULT_OUTFIT_NAME]);
    }

    #[test]
    fn import_over_generating_outfit_discards_late_result() {
        let store = store_with(&["a"]);
        let a = CharacterId::new("a");
        store.add_outfit(&a, "casual", "", "", false).unwrap();
        let key = PackKey::new("a", "casual");
        store.set_description(&key, "hoodie");
        let guard = store.try_begin(&key).unwrap();

        store
            .import_outfit_json(&a, "casual", r#"{"neutral":"authored.png"}"#)
            .unwrap();
        assert!(guard.is_cancelled());
        assert!(store.description(&key).is_none());
        assert_eq!(store.image(&key, Emotion::Neutral).as_deref(), Some("authored.png"));
        assert!(!store.outfit(&key).unwrap().generated);
    }

    #[test]
    fn renaming_default_names_the_source_outfit() {
        let store = store_with(&["a"]);
        let a = CharacterId::new("a");
        match store.rename_outfit(&a, DEFAULT_OUTFIT_NAME, "evening") {
            Err(StoreError::InvalidOutfitName(name)) => assert_eq!(name, DEFAULT_OUTFIT_NAME),
            other => panic!("unexpected {other:?}"),
        }
        match store.rename_outfit(&a, "evening", "") {
            Err(StoreError::InvalidOutfitName(name)) => assert_eq!(name, ""),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_imports_are_rejected() {
        let store = store_with(&["a"]);
        let a = CharacterId::new("a");
        assert!(matches!(
            store.import_outfit_json(&a, "x", "{not json"),
            Err(StoreError::MalformedJson(_))
        ));
        store
            .import_outfit_json(&a, "x", r#"{"neutral":"x.png","joy":"xj.png"}"#)
            .unwrap();
        assert_eq!(store.character_image(&a, "x", Emotion::Joy), "xj.png");

        store
            .import_background_json("beach", r#"{"url":"beach.png"}"#)
            .unwrap();
        store.select_background("beach").unwrap();
        assert_eq!(store.background_state().url.as_deref(), Some("beach.png"));
    }

    #[test]
    fn cooldown_ticks_down_to_zero() {
        let store = store_with(&[]);
        store.set_cooldown(2);
        assert_eq!(store.tick_cooldown(), 2);
        assert_eq!(store.tick_cooldown(), 1);
        assert_eq!(store.tick_cooldown(), 0);
        assert_eq!(store.background_state().cooldown, 0);
    }
}
