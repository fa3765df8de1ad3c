//! Voice profiles: `StyleTag → VoiceProfile` lookup.
//!
//! The table is static and covers every [`StyleTag`]; the match below is
//! exhaustive, so a tag without a row is a compile error rather than a
//! runtime failure.  Deployments may swap the speaker behind a style through
//! [`VoiceTable::with_overrides`] without touching pace, pitch or emphasis.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::style::StyleTag;

/// Default speaker for the neutral/fallback profile.
pub const DEFAULT_VOICE: &str = "Jasper";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emphasis {
    Low,
    #[default]
    Normal,
    High,
}

/// Concrete synthesis parameters for one style.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceProfile {
    pub style: StyleTag,
    /// Speaker/voice name understood by the backend.
    pub voice_identity: String,
    /// Speaking-rate multiplier (1.0 = backend default).
    pub pace: f32,
    /// Pitch shift in semitones.
    pub pitch_shift: f32,
    pub emphasis: Emphasis,
}

impl VoiceProfile {
    /// The plain narrator delivery, also used for fallback synthesis.
    pub fn neutral() -> Self {
        base_profile(StyleTag::Narrator)
    }

    /// Free-form delivery hint for backends that accept instructions.
    pub fn instructions(&self) -> String {
        let tone = match self.style {
            StyleTag::Narrator => "a calm, clear storyteller",
            StyleTag::Excited => "an excited, energetic storyteller",
            StyleTag::Gentle => "a gentle, warm storyteller",
            StyleTag::Dramatic => "a dramatic, suspenseful storyteller",
            StyleTag::Whisper => "a soft whisper, quiet and secretive",
            StyleTag::Joyful => "a joyful, cheerful storyteller",
            StyleTag::Sad => "a sad, slow and tender storyteller",
        };
        let emphasis = match self.emphasis {
            Emphasis::Low => "light",
            Emphasis::Normal => "natural",
            Emphasis::High => "strong",
        };
        format!(
            "Speak as {tone}, with {emphasis} emphasis and a pitch shift of {:+.1} semitones.",
            self.pitch_shift
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Static table
// ─────────────────────────────────────────────────────────────────────────────

fn base_profile(style: StyleTag) -> VoiceProfile {
    let (voice, pace, pitch_shift, emphasis) = match style {
        StyleTag::Narrator => (DEFAULT_VOICE, 1.00, 0.0, Emphasis::Normal),
        StyleTag::Excited => ("Luna", 1.12, 2.0, Emphasis::High),
        StyleTag::Gentle => ("Bella", 0.92, -1.0, Emphasis::Low),
        StyleTag::Dramatic => ("Bruno", 0.88, -2.0, Emphasis::High),
        StyleTag::Whisper => ("Rosie", 0.85, 0.0, Emphasis::Low),
        StyleTag::Joyful => ("Kiki", 1.08, 1.5, Emphasis::Normal),
        StyleTag::Sad => ("Hugo", 0.85, -2.5, Emphasis::Low),
    };
    VoiceProfile { style, voice_identity: voice.to_string(), pace, pitch_shift, emphasis }
}

/// One row of the style catalogue shown to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StyleDescription {
    pub style: StyleTag,
    pub voice_identity: String,
    pub instructions: String,
}

/// Resolver from style to profile.
#[derive(Debug, Clone, Default)]
pub struct VoiceTable {
    overrides: BTreeMap<StyleTag, String>,
}

impl VoiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the voice identity for some styles.
    pub fn with_overrides(overrides: BTreeMap<StyleTag, String>) -> Self {
        Self { overrides }
    }

    pub fn resolve(&self, style: StyleTag) -> VoiceProfile {
        let mut profile = base_profile(style);
        if let Some(voice) = self.overrides.get(&style) {
            profile.voice_identity = voice.clone();
        }
        profile
    }

    /// Every style with its resolved voice, in `StyleTag::ALL` order.
    pub fn describe(&self) -> Vec<StyleDescription> {
        StyleTag::ALL
            .into_iter()
            .map(|style| {
                let profile = self.resolve(style);
                StyleDescription { style, instructions: profile.instructions(), voice_identity: profile.voice_identity }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_lists_every_style() {
        let mut overrides = BTreeMap::new();
        overrides.insert(StyleTag::Whisper, "Leo".to_string());
        let rows = VoiceTable::with_overrides(overrides).describe();
        assert_eq!(rows.len(), StyleTag::ALL.len());
        assert_eq!(rows.iter().map(|r| r.style).collect::<Vec<_>>(), StyleTag::ALL.to_vec());
        let whisper = rows.iter().find(|r| r.style == StyleTag::Whisper).unwrap();
        assert_eq!(whisper.voice_identity, "Leo");
        assert!(whisper.instructions.contains("whisper"), "got {}", whisper.instructions);
    }

    #[test]
    fn test_every_style_has_a_row() {
        let table = VoiceTable::new();
        for style in StyleTag::ALL {
            let p = table.resolve(style);
            assert_eq!(p.style, style);
            assert!(!p.voice_identity.is_empty());
            assert!(p.pace > 0.5 && p.pace < 1.5, "{style}: pace {}", p.pace);
        }
    }

    #[test]
    fn test_resolve_is_pure() {
        let table = VoiceTable::new();
        assert_eq!(table.resolve(StyleTag::Whisper), table.resolve(StyleTag::Whisper));
        assert_eq!(table.resolve(StyleTag::Whisper).emphasis, Emphasis::Low);
    }

    #[test]
    fn test_overrides_only_change_identity() {
        let table = VoiceTable::with_overrides(BTreeMap::from([(StyleTag::Sad, "Leo".to_string())]));
        let p = table.resolve(StyleTag::Sad);
        assert_eq!(p.voice_identity, "Leo");
        assert_eq!(p.pace, VoiceTable::new().resolve(StyleTag::Sad).pace);
        assert_eq!(table.resolve(StyleTag::Joyful).voice_identity, "Kiki");
    }

    #[test]
    fn test_neutral_is_narrator() {
        assert_eq!(VoiceProfile::neutral(), VoiceTable::new().resolve(StyleTag::Narrator));
        assert!(VoiceProfile::neutral().instructions().contains("+0.0 semitones"));
    }
}
