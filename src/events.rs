use stage_model::{BackgroundState, CharacterId, Emotion};

use crate::store::PackKey;

/// Broadcast to observers whenever visible state changes.
#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    PackUpdated {
        key: PackKey,
        emotion: Emotion,
        url: String,
    },
    BackgroundChanged(BackgroundState),
    EmotionChanged {
        character: CharacterId,
        emotion: Emotion,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerCommand {
    /// Walk every generated pack and fill what is missing.
    Fill,
    /// Manually replace one image.
    Regenerate { key: PackKey, emotion: Emotion },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBackground {
    pub color_url: String,
    pub depth_url: Option<String>,
}

impl LoadBackground {
    /// Load request for the current background, if one is set.
    pub fn from_state(state: &BackgroundState) -> Option<Self> {
        state.url.as_ref().map(|url| Self {
            color_url: url.clone(),
            depth_url: state.depth_url.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PreparedImageCpu {
    pub source: String,
    pub width: u32,
    pub height: u32,
    /// RGBA8, row-major.
    pub pixels: Vec<u8>,
}

/// Single-channel depth map, one byte per texel.
#[derive(Debug, Clone)]
pub struct PreparedDepthCpu {
    pub width: u32,
    pub height: u32,
    pub samples: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct BackgroundLoaded {
    pub color: PreparedImageCpu,
    /// `None` renders a flat layer.
    pub depth: Option<PreparedDepthCpu>,
}

#[derive(Debug)]
pub struct InvalidImage(pub String);
