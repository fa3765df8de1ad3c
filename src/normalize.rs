//! Story text normalisation: runs on each page span before segmentation.
//!
//! Generated stories arrive with markup the backends should never read aloud
//! (HTML tags, Markdown emphasis, headings) and with typographic quotes that
//! confuse the dialogue rules in [`crate::style`].  This module turns a raw
//! span into plain speakable prose while keeping paragraph breaks intact,
//! since the segmenter never merges across them.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Deserialize;

// ─────────────────────────────────────────────────────────────────────────────
// Number → words
// ─────────────────────────────────────────────────────────────────────────────

const ONES: &[&str] = &[
    "", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine",
    "ten", "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen",
    "seventeen", "eighteen", "nineteen",
];
const TENS: &[&str] = &["", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety"];
const SCALE: &[&str] = &["", "thousand", "million", "billion"];

fn below_thousand(n: u64) -> String {
    let mut parts = Vec::new();
    if n >= 100 {
        parts.push(format!("{} hundred", ONES[(n / 100) as usize]));
    }
    let rest = n % 100;
    if rest >= 20 {
        match ONES[(rest % 10) as usize] {
            "" => parts.push(TENS[(rest / 10) as usize].to_string()),
            ones => parts.push(format!("{}-{}", TENS[(rest / 10) as usize], ones)),
        }
    } else if rest > 0 {
        parts.push(ONES[rest as usize].to_string());
    }
    parts.join(" ")
}

/// Spell a non-negative integer in English words.
///
/// Numbers past the billions are returned as digits: a story that contains
/// them is better served by the backend's own reading.
pub fn number_to_words(n: u64) -> String {
    if n == 0 {
        return "zero".to_string();
    }
    if n >= 1_000_000_000_000 {
        return n.to_string();
    }
    let mut groups = Vec::new();
    let mut remaining = n;
    for scale in SCALE {
        let chunk = remaining % 1000;
        if chunk > 0 {
            let words = below_thousand(chunk);
            groups.push(if scale.is_empty() { words } else { format!("{} {}", words, scale) });
        }
        remaining /= 1000;
        if remaining == 0 {
            break;
        }
    }
    groups.reverse();
    groups.join(" ")
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiled regexes (lazily initialised once)
// ─────────────────────────────────────────────────────────────────────────────

static RE_HTML: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>\n]*>").unwrap());
static RE_MD_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]*#{1,6}[ \t]+").unwrap());
static RE_MD_EMPHASIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\*{1,3}|_{2,3})([^*_\n]+)(\*{1,3}|_{2,3})").unwrap());
static RE_MD_BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]*[-*+][ \t]+").unwrap());
static RE_CURRENCY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([$£€])(\d{1,3}(?:,\d{3})+|\d+)(?:\.(\d{1,2}))?\b").unwrap());
static RE_PERCENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d+(?:\.\d+)?)\s?%").unwrap());
static RE_ORDINAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(\d+)(st|nd|rd|th)\b").unwrap());
// Any digit run with inner separators; only plain, grouped and decimal forms are spelled.
static RE_NUMBER_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d[\d.,:/]*\d\b|\b\d\b").unwrap());
static RE_PLAIN_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3}(?:,\d{3})+|\d+)(?:\.(\d+))?$").unwrap());
static RE_HSPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{00A0}]+").unwrap());
static RE_LINE_EDGES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]*\n[ \t]*").unwrap());
static RE_PARAGRAPH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{2,}").unwrap());

// ─────────────────────────────────────────────────────────────────────────────
// Individual steps
// ─────────────────────────────────────────────────────────────────────────────

pub fn remove_html_tags(text: &str) -> String {
    RE_HTML.replace_all(text, " ").into_owned()
}

pub fn strip_markdown(text: &str) -> String {
    let text = RE_MD_HEADING.replace_all(text, "");
    let text = RE_MD_BULLET.replace_all(&text, "");
    RE_MD_EMPHASIS.replace_all(&text, "$2").into_owned()
}

/// Replace typographic quotes, apostrophes and ellipses with ASCII forms.
pub fn straighten_quotes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{00AB}' | '\u{00BB}' => out.push('"'),
            '\u{2018}' | '\u{2019}' | '\u{201A}' => out.push('\''),
            '\u{2026}' => out.push_str("..."),
            '\u{2013}' | '\u{2014}' => out.push_str(", "),
            _ => out.push(c),
        }
    }
    out
}

fn parse_grouped(digits: &str) -> Option<u64> {
    digits.replace(',', "").parse().ok()
}

/// `"3"`, `"1,200"` or `"3.5"` in words; decimals read digit by digit.
/// Anything else (times, versions, dates) is `None`.
fn number_token_words(token: &str) -> Option<String> {
    let caps = RE_PLAIN_NUMBER.captures(token)?;
    let int = number_to_words(parse_grouped(&caps[1])?);
    match caps.get(2) {
        None => Some(int),
        Some(frac) => {
            let digits: Vec<&str> = frac
                .as_str()
                .chars()
                .map(|c| match c.to_digit(10) {
                    Some(0) => "zero",
                    Some(d) => ONES[d as usize],
                    None => "",
                })
                .collect();
            Some(format!("{int} point {}", digits.join(" ")))
        }
    }
}

/// `21` → `twenty-first`.  Numbers too large to spell are returned as digits.
fn ordinal_words(n: u64) -> String {
    let cardinal = number_to_words(n);
    if cardinal.starts_with(|c: char| c.is_ascii_digit()) {
        return cardinal;
    }
    let split = cardinal.rfind(|c: char| c == ' ' || c == '-').map_or(0, |i| i + 1);
    let (head, last) = cardinal.split_at(split);
    let last = match last {
        "one" => "first".to_string(),
        "two" => "second".to_string(),
        "three" => "third".to_string(),
        "five" => "fifth".to_string(),
        "eight" => "eighth".to_string(),
        "nine" => "ninth".to_string(),
        "twelve" => "twelfth".to_string(),
        w if w.ends_with('y') => format!("{}ieth", &w[..w.len() - 1]),
        w => format!("{w}th"),
    };
    format!("{head}{last}")
}

fn currency_units(symbol: &str) -> (&'static str, &'static str, &'static str, &'static str) {
    match symbol {
        "£" => ("pound", "pounds", "penny", "pence"),
        "€" => ("euro", "euros", "cent", "cents"),
        _ => ("dollar", "dollars", "cent", "cents"),
    }
}

pub fn expand_currency(text: &str) -> String {
    RE_CURRENCY
        .replace_all(text, |caps: &Captures| {
            let Some(whole) = parse_grouped(&caps[2]) else { return caps[0].to_string() };
            let cents = caps.get(3).map_or(0, |m| {
                let s = m.as_str();
                let v: u64 = s.parse().unwrap_or(0);
                if s.len() == 1 { v * 10 } else { v }
            });
            let (one, many, sub_one, sub_many) = currency_units(&caps[1]);
            let main = format!("{} {}", number_to_words(whole), if whole == 1 { one } else { many });
            let sub = format!("{} {}", number_to_words(cents), if cents == 1 { sub_one } else { sub_many });
            match (whole, cents) {
                (_, 0) => main,
                (0, _) => sub,
                _ => format!("{main} and {sub}"),
            }
        })
        .into_owned()
}

pub fn expand_percentages(text: &str) -> String {
    RE_PERCENT
        .replace_all(text, |caps: &Captures| match number_token_words(&caps[1]) {
            Some(words) => format!("{words} percent"),
            None => caps[0].to_string(),
        })
        .into_owned()
}

pub fn expand_ordinals(text: &str) -> String {
    RE_ORDINAL
        .replace_all(text, |caps: &Captures| match caps[1].parse::<u64>() {
            Ok(n) => ordinal_words(n),
            Err(_) => caps[0].to_string(),
        })
        .into_owned()
}

/// Spell currency, percentages, ordinals, then plain and decimal numbers.
/// Other digit forms are left for the backend to read.
pub fn expand_numbers(text: &str) -> String {
    let text = expand_currency(text);
    let text = expand_percentages(&text);
    let text = expand_ordinals(&text);
    RE_NUMBER_TOKEN
        .replace_all(&text, |caps: &Captures| {
            number_token_words(&caps[0]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Collapse horizontal whitespace and single line breaks; keep blank-line
/// paragraph breaks as exactly `"\n\n"`.
pub fn collapse_whitespace(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = RE_HSPACE.replace_all(&text, " ");
    let text = RE_LINE_EDGES.replace_all(&text, "\n");
    let paragraphs: Vec<String> = RE_PARAGRAPH
        .split(&text)
        .map(|p| p.split('\n').map(str::trim).filter(|l| !l.is_empty()).collect::<Vec<_>>().join(" "))
        .filter(|p| !p.is_empty())
        .collect();
    paragraphs.join("\n\n")
}

// ─────────────────────────────────────────────────────────────────────────────
// Normalizer: full pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Toggles for each normalisation step. All on by default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    pub remove_html: bool,
    pub strip_markdown: bool,
    pub straighten_quotes: bool,
    pub expand_numbers: bool,
    pub collapse_whitespace: bool,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            remove_html: true,
            strip_markdown: true,
            straighten_quotes: true,
            expand_numbers: true,
            collapse_whitespace: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    pub config: NormalizerConfig,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn process(&self, text: &str) -> String {
        let cfg = &self.config;
        let mut text = text.to_string();

        if cfg.remove_html {
            text = remove_html_tags(&text);
        }
        if cfg.strip_markdown {
            text = strip_markdown(&text);
        }
        if cfg.straighten_quotes {
            text = straighten_quotes(&text);
        }
        if cfg.expand_numbers {
            text = expand_numbers(&text);
        }
        if cfg.collapse_whitespace {
            text = collapse_whitespace(&text);
        }

        text
    }
}
