//! Style classifier: one [`StyleTag`] per narration unit.
//!
//! Classification is a declarative rule table evaluated top to bottom; the
//! first rule whose pattern matches wins and no match means
//! [`StyleTag::Narrator`].  The classifier only ever sees the text of a single
//! unit, so the same sentence gets the same tag wherever it appears.

use std::{fmt, str::FromStr};

use fancy_regex::Regex;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Delivery style of a unit.  Closed set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StyleTag {
    #[default]
    Narrator,
    Excited,
    Gentle,
    Dramatic,
    Whisper,
    Joyful,
    Sad,
}

impl StyleTag {
    pub const ALL: [StyleTag; 7] = [
        StyleTag::Narrator,
        StyleTag::Excited,
        StyleTag::Gentle,
        StyleTag::Dramatic,
        StyleTag::Whisper,
        StyleTag::Joyful,
        StyleTag::Sad,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StyleTag::Narrator => "narrator",
            StyleTag::Excited => "excited",
            StyleTag::Gentle => "gentle",
            StyleTag::Dramatic => "dramatic",
            StyleTag::Whisper => "whisper",
            StyleTag::Joyful => "joyful",
            StyleTag::Sad => "sad",
        }
    }
}

impl fmt::Display for StyleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown style '{0}'")]
pub struct UnknownStyle(pub String);

impl FromStr for StyleTag {
    type Err = UnknownStyle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        StyleTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == lower)
            .ok_or_else(|| UnknownStyle(s.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rule table
// ─────────────────────────────────────────────────────────────────────────────

/// Default rules in priority order: `(name, style, pattern)`.
///
/// Joyful cues are skipped right after `not`/`never`, which needs look-behind.
/// Lexical cues outrank punctuation so that a whispered or sobbed exclamation
/// keeps its delivery; bare exclamations fall through to `excited`.
const RULE_TABLE: &[(&str, StyleTag, &str)] = &[
    (
        "whisper-lexicon",
        StyleTag::Whisper,
        r"(?i)\b(whisper(s|ed|ing)?|murmur(s|ed|ing)?|quietly|hush(ed)?|shh+|tiptoe(s|d|ing)?|under (his|her|their) breath)\b",
    ),
    (
        "sad-lexicon",
        StyleTag::Sad,
        r"(?i)\b(sad(ly|ness)?|cr(y|ies|ied|ying)|tears?|sobb?(s|ed|ing)?|wept|weep(s|ing)?|lonely|sorrow(ful)?|heartbroken|gloomy|sighed)\b",
    ),
    (
        "dramatic-lexicon",
        StyleTag::Dramatic,
        r"(?i)\b(sudden(ly)?|thunder(s|ed|ing)?|roar(s|ed|ing)?|scream(s|ed|ing)?|shout(s|ed|ing)?|gasp(s|ed)?|danger(ous)?|monsters?|terrifi(ed|ying)|crash(ed|ing)?|all at once)\b",
    ),
    (
        "joyful-lexicon",
        StyleTag::Joyful,
        r"(?i)(?<!not\s)(?<!never\s)\b(laugh(s|ed|ing)?|giggl(e|es|ed|ing)|chuckl(e|es|ed|ing)|smil(e|es|ed|ing)|grinn(ed|ing)|joy(ful|fully)?|delight(ed)?|cheer(s|ed|ful)?|happ(y|ily))\b",
    ),
    ("quoted-exclamation", StyleTag::Excited, r#""[^"]*!+[?]*""#),
    ("trailing-exclamation", StyleTag::Excited, r#"!+[?]*["')\]]*\s*$"#),
    (
        "excited-lexicon",
        StyleTag::Excited,
        r"(?i)\b(wow|hooray|hurrah|yay|amazing|incredible|fantastic)\b",
    ),
    (
        "gentle-lexicon",
        StyleTag::Gentle,
        r"(?i)\b(gentl(e|y)|softly|tender(ly)?|lullaby|cozy|snuggl(e|ed|ing)|hug(s|ged|ging)?|kind(ly)?|sleepy|dream(s|ed|y)?|warm(ly)?)\b",
    ),
];

/// One `pattern → style` row of the classifier table.
#[derive(Debug, Clone)]
pub struct StyleRule {
    pub name: String,
    pub style: StyleTag,
    pattern: Regex,
}

impl StyleRule {
    pub fn new(name: impl Into<String>, style: StyleTag, pattern: &str) -> Result<Self, fancy_regex::Error> {
        Ok(Self { name: name.into(), style, pattern: Regex::new(pattern)? })
    }

    /// A pattern that exhausts the backtracking limit counts as no match.
    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text).unwrap_or(false)
    }
}

static DEFAULT_RULES: Lazy<Vec<StyleRule>> = Lazy::new(|| {
    RULE_TABLE
        .iter()
        .map(|&(name, style, pattern)| StyleRule::new(name, style, pattern).unwrap())
        .collect()
});

// ─────────────────────────────────────────────────────────────────────────────
// Classifier
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StyleClassifier {
    rules: Vec<StyleRule>,
}

impl Default for StyleClassifier {
    fn default() -> Self {
        Self { rules: DEFAULT_RULES.clone() }
    }
}

impl StyleClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifier with a custom table, evaluated in the given order.
    pub fn with_rules(rules: Vec<StyleRule>) -> Self {
        Self { rules }
    }

    /// Insert a rule at `priority` (0 = checked first).
    pub fn insert_rule(&mut self, priority: usize, rule: StyleRule) {
        let at = priority.min(self.rules.len());
        self.rules.insert(at, rule);
    }

    pub fn rules(&self) -> &[StyleRule] {
        &self.rules
    }

    pub fn classify(&self, text: &str) -> StyleTag {
        self.explain(text).0
    }

    /// The tag plus the name of the rule that produced it (`None` = default).
    pub fn explain(&self, text: &str) -> (StyleTag, Option<&str>) {
        self.rules
            .iter()
            .find(|rule| rule.matches(text))
            .map_or((StyleTag::Narrator, None), |rule| (rule.style, Some(rule.name.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialogue_scenario() {
        let c = StyleClassifier::new();
        assert_eq!(c.classify("The fox ran fast!"), StyleTag::Excited);
        assert_eq!(c.classify("\"Wait for me,\" whispered the mouse."), StyleTag::Whisper);
    }

    #[test]
    fn test_default_is_narrator() {
        let c = StyleClassifier::new();
        assert_eq!(c.explain("The bear walked to the river."), (StyleTag::Narrator, None));
    }

    #[test]
    fn test_lexicon_rules() {
        let c = StyleClassifier::new();
        assert_eq!(c.classify("Tears rolled down her cheeks."), StyleTag::Sad);
        assert_eq!(c.classify("Suddenly the door slammed."), StyleTag::Dramatic);
        assert_eq!(c.classify("The little owl giggled."), StyleTag::Joyful);
        assert_eq!(c.classify("Mama sang a lullaby."), StyleTag::Gentle);
        assert_eq!(c.classify("Wow, look at that."), StyleTag::Excited);
    }

    #[test]
    fn test_priority_order() {
        let c = StyleClassifier::new();
        // whisper outranks the trailing exclamation
        assert_eq!(c.explain("\"Quick!\" she whispered!").1, Some("whisper-lexicon"));
        // quoted exclamation fires before the gentle lexicon
        assert_eq!(c.explain("\"Come here!\" Mama said warmly.").1, Some("quoted-exclamation"));
        assert_eq!(c.explain("\"Stop!\"").0, StyleTag::Excited);
    }

    #[test]
    fn test_negated_joy_is_not_joyful() {
        let c = StyleClassifier::new();
        assert_eq!(c.classify("The bear was not happy."), StyleTag::Narrator);
        assert_eq!(c.classify("Owl never laughed at night."), StyleTag::Narrator);
        assert_eq!(c.classify("The bear was happy."), StyleTag::Joyful);
    }

    #[test]
    fn test_word_boundaries() {
        // "cheerio" is not "cheer"; "crystal" is not "cry"
        assert_eq!(StyleClassifier::new().classify("Cheerio, said the crystal fairy."), StyleTag::Narrator);
    }

    #[test]
    fn test_position_independent() {
        let c = StyleClassifier::new();
        let s = "The dragon roared.";
        assert_eq!(c.classify(s), c.classify(s));
        assert_eq!(c.classify(s), StyleTag::Dramatic);
    }

    #[test]
    fn test_custom_rule() {
        let mut c = StyleClassifier::new();
        c.insert_rule(0, StyleRule::new("bedtime", StyleTag::Gentle, r"(?i)\bgoodnight\b").unwrap());
        assert_eq!(c.explain("Goodnight, moon!").1, Some("bedtime"));
    }

    #[test]
    fn test_style_tag_parse() {
        assert_eq!("Whisper".parse::<StyleTag>(), Ok(StyleTag::Whisper));
        assert_eq!("shouting".parse::<StyleTag>(), Err(UnknownStyle("shouting".into())));
        for tag in StyleTag::ALL {
            assert_eq!(tag.as_str().parse::<StyleTag>(), Ok(tag));
        }
    }
}
