use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

pub const DEFAULT_ART_STYLE: &str = "Bold, visual novel style illustration, clean lines";
pub const DEFAULT_PLACEHOLDER_URL: &str = "assets/silhouette.png";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Base URL of the generation/classification service.
    pub base_url: String,
    /// Upper bound for any single backend call.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Environment variable holding a bearer token, if the service needs one.
    pub api_key_env: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7860".to_string(),
            timeout: Duration::from_secs(90),
            api_key_env: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct EmotionConfig {
    /// Minimum classifier confidence for a non-neutral label to win.
    pub threshold: f32,
}

impl Default for EmotionConfig {
    fn default() -> Self {
        Self { threshold: 0.2 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Attempts per missing image before the documented fallback is stored.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Image-to-image strength used to derive emotions from neutral.
    pub derive_strength: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            retry_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            derive_strength: 0.05,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct BackgroundConfig {
    /// Turns to wait after a new background before another may be generated.
    pub cooldown_turns: u32,
    /// Minimum zero-shot confidence that the scene moved.
    pub transition_threshold: f32,
    /// Number of recent messages used to describe the scene.
    pub history_messages: usize,
    /// Request a depth map alongside each new background.
    pub generate_depth: bool,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            cooldown_turns: 2,
            transition_threshold: 0.3,
            history_messages: 6,
            generate_depth: true,
        }
    }
}

/// How depth drives the parallax effect.
///
/// The two strengths are different units: `uv-offset` shifts texture
/// coordinates, `vertex-displacement` moves mesh vertices in view space.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ParallaxStrategy {
    UvOffset {
        #[serde(default = "ParallaxStrategy::default_uv_strength")]
        strength: f32,
    },
    VertexDisplacement {
        #[serde(default = "ParallaxStrategy::default_displacement_strength")]
        strength: f32,
        #[serde(default = "ParallaxStrategy::default_subdivisions")]
        subdivisions: u32,
    },
}

impl ParallaxStrategy {
    const fn default_uv_strength() -> f32 {
        0.03
    }

    const fn default_displacement_strength() -> f32 {
        0.3
    }

    const fn default_subdivisions() -> u32 {
        256
    }

    pub fn strength(&self) -> f32 {
        match self {
            Self::UvOffset { strength } | Self::VertexDisplacement { strength, .. } => *strength,
        }
    }

    /// Grid cells per axis for the plane mesh.
    pub fn subdivisions(&self) -> u32 {
        match self {
            Self::UvOffset { .. } => 1,
            Self::VertexDisplacement { subdivisions, .. } => (*subdivisions).max(1),
        }
    }
}

impl Default for ParallaxStrategy {
    fn default() -> Self {
        Self::UvOffset {
            strength: Self::default_uv_strength(),
        }
    }
}

/// Which end of the depth map is closest to the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DepthConvention {
    /// Bright pixels are near (MiDaS / Depth-Anything style output).
    #[default]
    NearIsBright,
    NearIsDark,
}

impl DepthConvention {
    /// Map a normalised depth sample to nearness in [0, 1] (1 = nearest).
    pub fn nearness(&self, sample: f32) -> f32 {
        let sample = sample.clamp(0.0, 1.0);
        match self {
            Self::NearIsBright => sample,
            Self::NearIsDark => 1.0 - sample,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ParallaxConfig {
    pub strategy: ParallaxStrategy,
    /// Extra zoom beyond cover-fit that hides displaced edges.
    pub crop_factor: f32,
    pub depth_convention: DepthConvention,
    /// Distance of the virtual camera from the plane (vertex displacement).
    pub camera_distance: f32,
    /// How far the camera travels per unit of pointer offset.
    pub camera_travel: f32,
    pub field_of_view_degrees: f32,
}

impl Default for ParallaxConfig {
    fn default() -> Self {
        Self {
            strategy: ParallaxStrategy::default(),
            crop_factor: 1.2,
            depth_convention: DepthConvention::default(),
            camera_distance: 3.0,
            camera_travel: 0.25,
            field_of_view_degrees: 50.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct PointerConfig {
    /// Fraction of the remaining distance covered each frame.
    pub lerp_factor: f32,
    /// Per-frame multiplier pulling the target back to centre once the
    /// pointer leaves the window.
    pub decay_factor: f32,
    /// Width / height the pointer space is normalised against (9:16).
    pub reference_aspect: f32,
}

impl Default for PointerConfig {
    fn default() -> Self {
        Self {
            lerp_factor: 0.3,
            decay_factor: 0.95,
            reference_aspect: 9.0 / 16.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct MotionProfile {
    pub idle_height_vh: f32,
    pub speaking_height_vh: f32,
    pub idle_brightness: f32,
    /// Pointer-to-offset multiplier for speaker pan.
    pub pan_factor: f32,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            idle_height_vh: 70.0,
            speaking_height_vh: 80.0,
            idle_brightness: 0.8,
            pan_factor: 1.8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Configuration {
    /// Style prefix for every generated image prompt.
    pub art_style: String,
    /// Fill missing emotion images in the background after load.
    pub auto_generate: bool,
    /// Image shown when no generated neutral image exists.
    pub placeholder_url: String,
    pub backend: BackendConfig,
    pub emotion: EmotionConfig,
    pub scheduler: SchedulerConfig,
    pub background: BackgroundConfig,
    pub parallax: ParallaxConfig,
    pub pointer: PointerConfig,
    pub motion: MotionProfile,
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(
            !self.placeholder_url.trim().is_empty(),
            "placeholder-url must not be empty"
        );
        ensure!(
            !self.backend.base_url.trim().is_empty(),
            "backend.base-url must not be empty"
        );
        ensure!(
            self.backend.timeout > Duration::ZERO,
            "backend.timeout must be positive"
        );
        ensure!(
            (0.0..=1.0).contains(&self.emotion.threshold),
            "emotion.threshold must be within [0, 1]"
        );
        ensure!(
            self.scheduler.max_attempts >= 1,
            "scheduler.max-attempts must be >= 1"
        );
        ensure!(
            self.scheduler.derive_strength > 0.0 && self.scheduler.derive_strength <= 0.1,
            "scheduler.derive-strength must be within (0, 0.1]"
        );
        ensure!(
            (0.0..=1.0).contains(&self.background.transition_threshold),
            "background.transition-threshold must be within [0, 1]"
        );
        self.validate_parallax()
            .context("invalid parallax configuration")?;
        ensure!(
            self.pointer.lerp_factor > 0.0 && self.pointer.lerp_factor <= 1.0,
            "pointer.lerp-factor must be within (0, 1]"
        );
        ensure!(
            (0.0..1.0).contains(&self.pointer.decay_factor),
            "pointer.decay-factor must be within [0, 1)"
        );
        ensure!(
            self.pointer.reference_aspect > 0.0,
            "pointer.reference-aspect must be positive"
        );
        ensure!(
            self.motion.idle_height_vh > 0.0 && self.motion.speaking_height_vh > 0.0,
            "motion heights must be positive"
        );
        Ok(self)
    }

    fn validate_parallax(&self) -> Result<()> {
        let parallax = &self.parallax;
        ensure!(parallax.crop_factor >= 1.0, "crop-factor must be >= 1.0");
        ensure!(
            parallax.strategy.strength().is_finite() && parallax.strategy.strength() >= 0.0,
            "strategy strength must be non-negative"
        );
        if let ParallaxStrategy::VertexDisplacement { subdivisions, .. } = parallax.strategy {
            ensure!(
                (1..=1024).contains(&subdivisions),
                "subdivisions must be within 1..=1024"
            );
        }
        ensure!(
            parallax.camera_distance > 0.0,
            "camera-distance must be positive"
        );
        ensure!(
            parallax.field_of_view_degrees > 1.0 && parallax.field_of_view_degrees < 179.0,
            "field-of-view-degrees must be within (1, 179)"
        );
        Ok(())
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            art_style: DEFAULT_ART_STYLE.to_string(),
            auto_generate: true,
            placeholder_url: DEFAULT_PLACEHOLDER_URL.to_string(),
            backend: BackendConfig::default(),
            emotion: EmotionConfig::default(),
            scheduler: SchedulerConfig::default(),
            background: BackgroundConfig::default(),
            parallax: ParallaxConfig::default(),
            pointer: PointerConfig::default(),
            motion: MotionProfile::default(),
        }
    }
}
