use stage_model::{CharacterId, Emotion};
use thiserror::Error;

/// Failure reported by a generation or classification backend.
///
/// Backends signal "no result" by absence; [`GenerationError::NoResult`]
/// captures that case separately from transport and policy failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    /// The backend could not be reached or returned a server error.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The prompt was refused, usually by a content filter.
    #[error("request rejected by backend: {0}")]
    ContentRejected(String),

    /// The backend answered with something we could not interpret.
    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("backend call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The call completed but produced no text or image.
    #[error("backend returned no result")]
    NoResult,

    /// The backend does not offer this capability.
    #[error("backend does not support {0}")]
    Unsupported(&'static str),
}

/// Failure while producing or updating an emotion pack entry.
#[derive(Debug, Error)]
pub enum PackError {
    /// Derived emotions are image-to-image edits of neutral; it must exist first.
    #[error("no neutral image for {character}/{outfit}; cannot derive {emotion}")]
    MissingNeutralBase {
        character: CharacterId,
        outfit: String,
        emotion: Emotion,
    },

    #[error("no visual description could be generated for {character}/{outfit}")]
    NoDescription { character: CharacterId, outfit: String },

    #[error("unknown character {0}")]
    UnknownCharacter(CharacterId),

    #[error("unknown outfit {outfit} for {character}")]
    UnknownOutfit { character: CharacterId, outfit: String },

    /// Another task is already generating for this (character, outfit).
    #[error("generation already in flight for {character}/{outfit}")]
    InFlight { character: CharacterId, outfit: String },

    /// The character or outfit was removed while the request was running.
    #[error("generation for {character}/{outfit} was cancelled")]
    Cancelled { character: CharacterId, outfit: String },

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

#[derive(Debug, Error)]
pub enum BackgroundError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

/// Failure while mutating the stage store directly (manual edits, imports).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("unknown character {0}")]
    UnknownCharacter(CharacterId),

    #[error("unknown outfit {outfit} for {character}")]
    UnknownOutfit { character: CharacterId, outfit: String },

    #[error("outfit {outfit} already exists for {character}")]
    DuplicateOutfit { character: CharacterId, outfit: String },

    /// Every character keeps at least one outfit.
    #[error("cannot remove the last outfit of {0}")]
    LastOutfit(CharacterId),

    /// The default outfit cannot be removed, renamed, or shadowed.
    #[error("outfit name {0:?} is reserved or empty")]
    InvalidOutfitName(String),

    #[error("unknown background {0}")]
    UnknownBackground(String),
}
