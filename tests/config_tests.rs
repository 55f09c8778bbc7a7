use std::io::Write;
use std::time::Duration;

use portrait_stage::config::{Configuration, DepthConvention, ParallaxStrategy};

#[test]
fn empty_document_uses_defaults() {
    let cfg: Configuration = serde_yaml::from_str("{}").unwrap();
    let cfg = cfg.validated().unwrap();
    assert!(cfg.auto_generate);
    assert_eq!(cfg.emotion.threshold, 0.2);
    assert_eq!(cfg.background.cooldown_turns, 2);
    assert_eq!(cfg.parallax.crop_factor, 1.2);
    assert_eq!(cfg.parallax.depth_convention, DepthConvention::NearIsBright);
    assert_eq!(cfg.parallax.strategy, ParallaxStrategy::UvOffset { strength: 0.03 });
    assert_eq!(cfg.pointer.lerp_factor, 0.3);
    assert_eq!(cfg.pointer.decay_factor, 0.95);
}

#[test]
fn parse_kebab_case_sections() {
    let yaml = r#"
art-style: "Watercolour"
auto-generate: false
backend:
  base-url: "https://gen.example"
  timeout: 45s
scheduler:
  retry-backoff: 500ms
  derive-strength: 0.08
parallax:
  strategy:
    type: vertex-displacement
    strength: 0.25
  depth-convention: near-is-dark
motion:
  pan-factor: 1.2
"#;
    let cfg: Configuration = serde_yaml::from_str(yaml).unwrap();
    let cfg = cfg.validated().unwrap();
    assert_eq!(cfg.art_style, "Watercolour");
    assert!(!cfg.auto_generate);
    assert_eq!(cfg.backend.timeout, Duration::from_secs(45));
    assert_eq!(cfg.scheduler.retry_backoff, Duration::from_millis(500));
    assert_eq!(
        cfg.parallax.strategy,
        ParallaxStrategy::VertexDisplacement {
            strength: 0.25,
            subdivisions: 256
        }
    );
    assert_eq!(cfg.parallax.depth_convention, DepthConvention::NearIsDark);
    assert_eq!(cfg.motion.pan_factor, 1.2);
    assert_eq!(cfg.motion.speaking_height_vh, 80.0);
}

#[test]
fn unknown_fields_are_rejected() {
    let yaml = r#"
parallax:
  crop: 1.4
"#;
    assert!(serde_yaml::from_str::<Configuration>(yaml).is_err());
}

#[test]
fn motion_profile_has_no_animation_timing() {
    let yaml = r#"
motion:
  transition-secs: 0.3
"#;
    assert!(serde_yaml::from_str::<Configuration>(yaml).is_err());
}

#[test]
fn derive_strength_must_stay_low() {
    let yaml = r#"
scheduler:
  derive-strength: 0.5
"#;
    let cfg: Configuration = serde_yaml::from_str(yaml).unwrap();
    let err = cfg.validated().unwrap_err();
    assert!(err.to_string().contains("derive-strength"));
}

#[test]
fn crop_factor_below_one_is_invalid() {
    let yaml = r#"
parallax:
  crop-factor: 0.9
"#;
    let cfg: Configuration = serde_yaml::from_str(yaml).unwrap();
    assert!(cfg.validated().is_err());
}

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "placeholder-url: \"assets/blank.png\"").unwrap();
    let cfg = Configuration::from_yaml_file(file.path())
        .unwrap()
        .validated()
        .unwrap();
    assert_eq!(cfg.placeholder_url, "assets/blank.png");
}

#[test]
fn demo_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/config.yaml");
    let cfg = Configuration::from_yaml_file(&path)
        .unwrap()
        .validated()
        .unwrap();
    assert!(matches!(
        cfg.parallax.strategy,
        ParallaxStrategy::VertexDisplacement { subdivisions: 256, .. }
    ));
}
