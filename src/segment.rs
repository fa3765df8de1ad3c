//! Segmenter: story text → ordered [`NarrationUnit`]s.
//!
//! Pipeline per request:
//!
//! 1. **Pages**: the raw text is cut at the caller's page-break offsets
//!    (character offsets, not bytes).  No unit ever spans two pages.
//! 2. **Normalise**: each page goes through [`Normalizer`] independently,
//!    so offsets always refer to the text as it was submitted.
//! 3. **Paragraphs → sentences**: blank lines split paragraphs; sentences end
//!    at `.`, `!`, `?` (plus any closing quotes) followed by whitespace and a
//!    token that does not continue the sentence.
//! 4. **Length bound**: sentences longer than `max_unit_chars` are split at
//!    the last clause boundary (`,` `;` `:`) that fits, then at whitespace.
//!
//! The whole transform is a pure function of `(text, page_boundaries, config)`.

use serde::{Deserialize, Serialize};

use crate::{
    error::SegmentationError,
    normalize::{Normalizer, NormalizerConfig},
};

/// Abbreviations whose trailing period never ends a sentence.
const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "st", "mt", "prof", "sr", "jr", "vs", "etc", "e.g", "i.e",
];

/// Characters that may trail a terminal mark and still belong to the sentence.
const CLOSERS: &[char] = &['"', '\'', ')', ']'];

/// Verbs that mark the words after a closing quote as its dialogue tag
/// (`"Wait!" Mia whispered.`).
const SPEECH_VERBS: &[&str] = &[
    "said", "says", "asked", "whispered", "shouted", "cried", "called", "yelled",
    "replied", "answered", "murmured", "exclaimed", "laughed", "giggled", "sang",
    "squeaked", "roared", "sighed", "added", "muttered", "screamed", "growled",
];

/// One spoken chunk of the story; the atomic item of synthesis and assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NarrationUnit {
    /// 0-based, contiguous within a job.
    pub index: usize,
    /// Never empty.
    pub text: String,
    /// Page the unit came from; `None` without page boundaries and for framing units.
    pub source_page: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Sentences longer than this (in characters) are split at clause boundaries.
    pub max_unit_chars: usize,
    pub normalize: NormalizerConfig,
    pub framing: FramingConfig,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_unit_chars: 280,
            normalize: NormalizerConfig::default(),
            framing: FramingConfig::default(),
        }
    }
}

/// Spoken intro/outro wrapped around a titled story.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    /// `{title}` is replaced with the story title.
    pub intro_template: String,
    pub outro: String,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            intro_template: "Welcome to the story of {title}.".to_string(),
            outro: "The end. Sweet dreams, little one.".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pages
// ─────────────────────────────────────────────────────────────────────────────

/// Cut `text` at character offsets.  Offsets are sorted and de-duplicated;
/// offsets past the end are clamped.  Page numbers follow span order, so a
/// break at offset 0 yields an empty page 0 rather than renumbering the rest.
fn split_pages<'a>(text: &'a str, boundaries: &[usize]) -> Vec<(Option<usize>, &'a str)> {
    if boundaries.is_empty() {
        return vec![(None, text)];
    }
    let char_len = text.chars().count();
    let mut offsets: Vec<usize> = boundaries.iter().map(|&b| b.min(char_len)).collect();
    offsets.sort_unstable();
    offsets.dedup();

    let byte_at = |char_offset: usize| {
        text.char_indices().nth(char_offset).map(|(i, _)| i).unwrap_or(text.len())
    };

    let mut pages = Vec::with_capacity(offsets.len() + 1);
    let mut start = 0;
    for offset in offsets {
        let end = byte_at(offset);
        pages.push((Some(pages.len()), &text[start..end]));
        start = end;
    }
    pages.push((Some(pages.len()), &text[start..]));
    pages
}

// ─────────────────────────────────────────────────────────────────────────────
// Sentences
// ─────────────────────────────────────────────────────────────────────────────

fn is_abbreviation(before: &str) -> bool {
    let word = before
        .rsplit(|c: char| c.is_whitespace() || c == '"' || c == '(')
        .next()
        .unwrap_or("")
        .to_lowercase();
    ABBREVIATIONS.contains(&word.as_str())
}

/// The first two words of `rest` contain a speech verb.
fn is_dialogue_tag(rest: &str) -> bool {
    rest.split_whitespace()
        .take(2)
        .map(|w| w.trim_matches(|c: char| !c.is_alphabetic()).to_lowercase())
        .any(|w| SPEECH_VERBS.contains(&w.as_str()))
}

/// Split one paragraph into sentences.  Terminal marks inside an open double
/// quote only end the sentence together with the closing quote.
fn split_sentences(paragraph: &str) -> Vec<String> {
    let chars: Vec<(usize, char)> = paragraph.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut in_quote = false;
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        if c == '"' {
            in_quote = !in_quote;
        }
        if !matches!(c, '.' | '!' | '?') {
            i += 1;
            continue;
        }

        // Swallow the full terminal run plus trailing closers: `?!`, `..."`, `!')`.
        let single_period = c == '.' && chars.get(i + 1).map_or(true, |&(_, n)| !matches!(n, '.' | '!' | '?'));
        let mut closed_quote = false;
        let mut j = i + 1;
        while let Some(&(_, n)) = chars.get(j) {
            if matches!(n, '.' | '!' | '?') {
                j += 1;
            } else if CLOSERS.contains(&n) {
                if n == '"' {
                    in_quote = !in_quote;
                    closed_quote |= !in_quote;
                }
                j += 1;
            } else {
                break;
            }
        }
        let end = chars.get(j).map_or(paragraph.len(), |&(p, _)| p);

        let boundary = match chars.get(j) {
            None => true,
            Some(&(_, n)) if n.is_whitespace() => {
                let next_word = chars[j..].iter().map(|&(_, ch)| ch).find(|ch| !ch.is_whitespace());
                let continues = next_word.map_or(false, char::is_lowercase)
                    || (closed_quote && is_dialogue_tag(&paragraph[end..]));
                !in_quote && !continues && !(single_period && is_abbreviation(&paragraph[start..pos]))
            }
            Some(_) => false,
        };

        if boundary {
            let sentence = paragraph[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            start = end;
        }
        i = j;
    }

    let tail = paragraph[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

// ─────────────────────────────────────────────────────────────────────────────
// Length bound
// ─────────────────────────────────────────────────────────────────────────────

/// Byte offset just past the last clause mark in `rest[..window_end]` that is
/// followed by whitespace.
fn clause_cut(rest: &str, window_end: usize) -> Option<usize> {
    rest[..window_end]
        .char_indices()
        .filter(|&(_, c)| matches!(c, ',' | ';' | ':'))
        .map(|(i, c)| i + c.len_utf8())
        .filter(|&after| rest[after..].starts_with(char::is_whitespace))
        .last()
}

fn space_cut(rest: &str, window_end: usize) -> Option<usize> {
    rest[..window_end]
        .char_indices()
        .filter(|&(i, c)| i > 0 && c.is_whitespace())
        .map(|(i, _)| i)
        .last()
}

fn bound_length(sentence: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut pieces = Vec::new();
    let mut rest = sentence.trim();

    while rest.chars().count() > max_chars {
        let window_end = rest.char_indices().nth(max_chars).map_or(rest.len(), |(i, _)| i);
        let cut = clause_cut(rest, window_end)
            .or_else(|| space_cut(rest, window_end))
            .unwrap_or(window_end);
        let (head, tail) = rest.split_at(cut);
        let head = head.trim();
        if !head.is_empty() {
            pieces.push(head.to_string());
        }
        rest = tail.trim_start();
    }
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

// ─────────────────────────────────────────────────────────────────────────────
// Segmenter
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Segmenter {
    config: SegmenterConfig,
    normalizer: Normalizer,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        let normalizer = Normalizer::with_config(config.normalize.clone());
        Self { config, normalizer }
    }

    /// Segment `text`, cutting pages at `page_boundaries` (character offsets).
    pub fn segment(
        &self,
        text: &str,
        page_boundaries: &[usize],
    ) -> Result<Vec<NarrationUnit>, SegmentationError> {
        if text.trim().is_empty() {
            return Err(SegmentationError::EmptyInput);
        }

        let mut units = Vec::new();
        for (page, span) in split_pages(text, page_boundaries) {
            let clean = self.normalizer.process(span);
            for paragraph in clean.split("\n\n") {
                for sentence in split_sentences(paragraph) {
                    for piece in bound_length(&sentence, self.config.max_unit_chars) {
                        units.push(NarrationUnit { index: units.len(), text: piece, source_page: page });
                    }
                }
            }
        }

        if units.is_empty() {
            return Err(SegmentationError::NoSpeakableText);
        }
        Ok(units)
    }

    /// [`segment`](Self::segment), wrapped in the spoken intro and outro when a
    /// title is given.  Indices are contiguous over the framed sequence.
    pub fn segment_framed(
        &self,
        text: &str,
        page_boundaries: &[usize],
        title: Option<&str>,
    ) -> Result<Vec<NarrationUnit>, SegmentationError> {
        let story = self.segment(text, page_boundaries)?;
        let Some(title) = title.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(story);
        };

        let framing = &self.config.framing;
        let intro = framing.intro_template.replace("{title}", title);
        let spoken = |raw: &str| bound_length(&self.normalizer.process(raw), self.config.max_unit_chars);

        let texts = spoken(&intro)
            .into_iter()
            .map(|t| (t, None))
            .chain(story.into_iter().map(|u| (u.text, u.source_page)))
            .chain(spoken(&framing.outro).into_iter().map(|t| (t, None)));

        Ok(texts
            .enumerate()
            .map(|(index, (text, source_page))| NarrationUnit { index, text, source_page })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(units: &[NarrationUnit]) -> Vec<&str> {
        units.iter().map(|u| u.text.as_str()).collect()
    }

    #[test]
    fn test_dialogue_scenario() {
        let units = Segmenter::default()
            .segment("The fox ran fast! \"Wait for me,\" whispered the mouse.", &[])
            .unwrap();
        assert_eq!(texts(&units), vec!["The fox ran fast!", "\"Wait for me,\" whispered the mouse."]);
        assert_eq!(units[0].index, 0);
        assert_eq!(units[1].index, 1);
        assert!(units.iter().all(|u| u.source_page.is_none()));
    }

    #[test]
    fn test_single_sentence() {
        let units = Segmenter::default().segment("Once upon a time.", &[]).unwrap();
        assert_eq!(texts(&units), vec!["Once upon a time."]);
    }

    #[test]
    fn test_no_terminal_punctuation() {
        let units = Segmenter::default().segment("once upon a time there was a bear", &[]).unwrap();
        assert_eq!(units.len(), 1);
    }

    #[test]
    fn test_dialogue_tag_stays_with_quote() {
        let units = Segmenter::default()
            .segment("\"Run!\" she shouted. \"Stop. Come back,\" he said.", &[])
            .unwrap();
        assert_eq!(texts(&units), vec!["\"Run!\" she shouted.", "\"Stop. Come back,\" he said."]);

        let units = Segmenter::default().segment("\"Wait for me!\" Mia whispered.", &[]).unwrap();
        assert_eq!(texts(&units), vec!["\"Wait for me!\" Mia whispered."], "capitalised tag stays attached");

        let units = Segmenter::default()
            .segment("\"Stop!\" The dog ran away. \"Hello,\" said Grandma.", &[])
            .unwrap();
        assert_eq!(
            texts(&units),
            vec!["\"Stop!\"", "The dog ran away.", "\"Hello,\" said Grandma."],
            "a capitalised non-tag sentence still starts a new unit"
        );
    }

    #[test]
    fn test_abbreviations_and_ellipsis() {
        let units = Segmenter::default()
            .segment("Mr. Fox waited... and waited. Then he slept.", &[])
            .unwrap();
        assert_eq!(texts(&units), vec!["Mr. Fox waited... and waited.", "Then he slept."]);
    }

    #[test]
    fn test_paragraphs_and_whitespace() {
        let units = Segmenter::default().segment("  First.  \n\n   \n\nSecond\n\n", &[]).unwrap();
        assert_eq!(texts(&units), vec!["First.", "Second"]);
    }

    #[test]
    fn test_page_boundaries_never_merge() {
        // Break in the middle of a sentence: each side becomes its own unit.
        let text = "The owl hooted softly and the moon rose.";
        let units = Segmenter::default().segment(text, &[14]).unwrap();
        assert_eq!(texts(&units), vec!["The owl hooted", "softly and the moon rose."]);
        assert_eq!(units[0].source_page, Some(0));
        assert_eq!(units[1].source_page, Some(1));
    }

    #[test]
    fn test_page_offsets_are_characters() {
        let text = "Café time. Next page.";
        let units = Segmenter::default().segment(text, &[11, 999]).unwrap();
        assert_eq!(texts(&units), vec!["Café time.", "Next page."]);
        assert_eq!(units[1].source_page, Some(1));
    }

    #[test]
    fn test_long_sentence_split_at_clause() {
        let cfg = SegmenterConfig { max_unit_chars: 40, ..Default::default() };
        let text = "The rabbit hopped over the log, under the fence, and into the garden where carrots grew.";
        let units = Segmenter::new(cfg).segment(text, &[]).unwrap();
        assert!(units.len() > 1, "got: {:?}", units);
        assert_eq!(units[0].text, "The rabbit hopped over the log,");
        assert_eq!(units[1].text, "under the fence,");
        assert!(units.iter().all(|u| u.text.chars().count() <= 40), "got: {:?}", units);
        let rejoined = texts(&units).join(" ");
        assert_eq!(rejoined, text);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(Segmenter::default().segment("  \n\t ", &[]), Err(SegmentationError::EmptyInput));
        assert_eq!(
            Segmenter::default().segment("<br/> <p></p>", &[]),
            Err(SegmentationError::NoSpeakableText)
        );
    }

    #[test]
    fn test_deterministic() {
        let text = "A cat sat. It purred! Did it sleep? Yes.\n\nMorning came.";
        let seg = Segmenter::default();
        assert_eq!(seg.segment(text, &[12]).unwrap(), seg.segment(text, &[12]).unwrap());
    }

    #[test]
    fn test_framing_reindexes() {
        let units = Segmenter::default()
            .segment_framed("A bear woke up. He was hungry.", &[], Some("The Bear"))
            .unwrap();
        assert_eq!(
            texts(&units),
            vec![
                "Welcome to the story of The Bear.",
                "A bear woke up.",
                "He was hungry.",
                "The end. Sweet dreams, little one.",
            ]
        );
        let indices: Vec<usize> = units.iter().map(|u| u.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }
}
