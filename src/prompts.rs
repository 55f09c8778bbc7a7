//! Prompt text sent to the generation backend.

use stage_model::{CharacterProfile, ChatMessage, Emotion};

pub const CHARACTER_ART_PROMPT: &str = "plain flat background, standing, full body";
pub const CHARACTER_NEGATIVE_PROMPT: &str = "border, ((close-up)), background elements, special effects, scene, dynamic angle, action, cut-off";
pub const BACKGROUND_ART_PROMPT: &str = "unpopulated, empty scenery, wide establishing shot, no characters";
pub const BACKGROUND_NEGATIVE_PROMPT: &str =
    "person, people, character, figure, crowd, border, text, watermark, close-up";

/// Hypothesis used when asking whether the scene moved.
pub const TRANSITION_HYPOTHESIS: &str = "This passage {}.";
pub const LABEL_REMAINS: &str = "remains in the same location";
pub const LABEL_TRANSITIONS: &str = "transitions to a new location";

pub const DESCRIPTION_MIN_TOKENS: u32 = 50;
pub const DESCRIPTION_MAX_TOKENS: u32 = 200;

/// Words swapped before a prompt reaches the image generator.
const SUBSTITUTIONS: &[(&str, &str)] = &[
    ("child", "adult"),
    ("children", "adults"),
    ("kid", "adult"),
    ("kids", "adults"),
    ("teen", "adult"),
    ("teenage", "adult"),
    ("teenager", "adult"),
    ("underage", "adult"),
    ("young", "youthful"),
    ("loli", "petite"),
    ("shota", "slender"),
    ("nude", "clothed"),
    ("naked", "clothed"),
    ("topless", "clothed"),
];

/// Ask the text generator for a tag-style visual description of a character
/// wearing the given outfit.
pub fn description_prompt(profile: &CharacterProfile, outfit: &str, art_prompt: &str) -> String {
    let mut prompt = format!("Character Information: {}\n\n", profile.description.trim());
    if !profile.personality.trim().is_empty() {
        prompt.push_str(&format!("Personality: {}\n\n", profile.personality.trim()));
    }
    if outfit != stage_model::DEFAULT_OUTFIT_NAME {
        prompt.push_str(&format!("Outfit: {outfit}\n"));
    }
    if !art_prompt.trim().is_empty() {
        prompt.push_str(&format!("Outfit details: {}\n", art_prompt.trim()));
    }
    prompt.push_str(
        "Instruction: Digest the character information and construct a comprehensive and \
         concise visual description of this character. This response is fed directly into an \
         image generator which is unfamiliar with the character; use tags and keywords to convey \
         all essential details, presenting ample appearance notes even when they seem obvious: \
         gender, skin tone, hair style and color, physique, outfit.",
    );
    prompt
}

/// Full text-to-image prompt for one emotion of one outfit.
pub fn character_art_prompt(
    art_style: &str,
    description: &str,
    trigger_words: &str,
    emotion: Emotion,
) -> String {
    let mut prompt = format!("(Art style: {art_style}), ({})", description.trim());
    if !trigger_words.trim().is_empty() {
        prompt.push_str(&format!(", ({})", trigger_words.trim()));
    }
    prompt.push_str(&format!(", ({CHARACTER_ART_PROMPT}), ({})", emotion.prompt()));
    prompt
}

/// Ask the text generator to describe the current location from recent chat.
pub fn scene_prompt(history: &[ChatMessage]) -> String {
    let mut prompt = String::from("Recent events:\n");
    for message in history {
        prompt.push_str(message.content.trim());
        prompt.push('\n');
    }
    prompt.push_str(
        "\nInstruction: Describe the location where the most recent events take place as a \
         concise list of visual tags for an image generator: setting, architecture or terrain, \
         lighting, time of day, weather, mood. Do not describe any people.",
    );
    prompt
}

pub fn background_art_prompt(art_style: &str, scene: &str, trigger_words: &str) -> String {
    let mut prompt = format!("(Art style: {art_style}), ({})", scene.trim());
    if !trigger_words.trim().is_empty() {
        prompt.push_str(&format!(", ({})", trigger_words.trim()));
    }
    prompt.push_str(&format!(", ({BACKGROUND_ART_PROMPT})"));
    prompt
}

/// Swap flagged words for neutral ones, preserving everything else.
///
/// Returns the rewritten prompt and whether anything changed. This is a
/// keyword heuristic, not moderation.
pub fn substitute(prompt: &str) -> (String, bool) {
    let mut out = String::with_capacity(prompt.len());
    let mut altered = false;
    let mut word = String::new();

    let mut flush = |word: &mut String, out: &mut String| {
        if word.is_empty() {
            return;
        }
        let lowered = word.to_lowercase();
        match SUBSTITUTIONS.iter().find(|(from, _)| *from == lowered) {
            Some((_, to)) => {
                altered = true;
                out.push_str(&match_case(word, to));
            }
            None => out.push_str(word),
        }
        word.clear();
    };

    for ch in prompt.chars() {
        if ch.is_alphanumeric() {
            word.push(ch);
        } else {
            flush(&mut word, &mut out);
            out.push(ch);
        }
    }
    flush(&mut word, &mut out);
    (out, altered)
}

fn match_case(original: &str, replacement: &str) -> String {
    let mut chars = original.chars();
    if original.chars().all(|c| !c.is_lowercase()) && original.chars().count() > 1 {
        return replacement.to_uppercase();
    }
    match chars.next() {
        Some(first) if first.is_uppercase() => {
            let mut rest = replacement.chars();
            rest.next()
                .map(|c| c.to_uppercase().chain(rest).collect())
                .unwrap_or_default()
        }
        _ => replacement.to_string(),
    }
}
