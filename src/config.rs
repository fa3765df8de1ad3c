//! Configuration: process-wide [`NarratorConfig`] and per-request [`JobOptions`].
//!
//! `NarratorConfig` is read from a JSON file; every field has a default, so
//! `{}` is a valid config that talks to a local kittentts-server:
//!
//! ```json
//! {
//!   "worker_pool_size": 8,
//!   "primary":  { "name": "kittentts", "base_url": "http://127.0.0.1:8080" },
//!   "fallback": { "name": "openai", "base_url": "https://api.openai.com",
//!                 "api_key": "sk-…", "model": "tts-1", "default_voice": "alloy",
//!                 "supports_styles": false },
//!   "default_options": { "retry_ceiling": 4, "max_failed_unit_fraction": 0.25 }
//! }
//! ```

use std::{collections::BTreeMap, path::{Path, PathBuf}};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    assemble::AssemblerConfig,
    audio::SAMPLE_RATE,
    backend::BackendConfig,
    error::NarrationError,
    segment::SegmenterConfig,
    style::StyleTag,
};

// ─────────────────────────────────────────────────────────────────────────────
// Output format
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Wav,
    Mp3,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Wav => "wav",
            OutputFormat::Mp3 => "mp3",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Wav => "audio/wav",
            OutputFormat::Mp3 => "audio/mpeg",
        }
    }

    /// Whether this build can encode the format.
    pub fn is_available(self) -> bool {
        match self {
            OutputFormat::Wav => true,
            OutputFormat::Mp3 => cfg!(feature = "mp3"),
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Some(OutputFormat::Wav),
            "mp3" => Some(OutputFormat::Mp3),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-request options
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// In-flight synthesis calls for this job (the process-wide pool still applies).
    pub max_parallel_synthesis: usize,
    /// Upper bound on backend calls per unit, fallback attempt included.
    pub retry_ceiling: u32,
    /// Fraction of units allowed to end up as silent placeholders.
    pub max_failed_unit_fraction: f64,
    pub output_format: OutputFormat,
    /// Narrate every unit in this style instead of classifying.
    pub style_override: Option<StyleTag>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_parallel_synthesis: 4,
            retry_ceiling: 4,
            max_failed_unit_fraction: 0.25,
            output_format: OutputFormat::Wav,
            style_override: None,
        }
    }
}

impl JobOptions {
    pub fn validate(&self) -> Result<(), NarrationError> {
        let invalid = |msg: String| Err(NarrationError::InvalidOptions(msg));
        if self.max_parallel_synthesis == 0 {
            return invalid("max_parallel_synthesis must be at least 1".into());
        }
        if self.retry_ceiling == 0 {
            return invalid("retry_ceiling must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.max_failed_unit_fraction) {
            return invalid(format!(
                "max_failed_unit_fraction must be within [0, 1], got {}",
                self.max_failed_unit_fraction
            ));
        }
        if !self.output_format.is_available() {
            return invalid(format!(
                "output format '{}' is not compiled into this build",
                self.output_format.extension()
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process-wide config
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// First retry delay; doubles per retry.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Deadline for a single backend call.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { backoff_base_ms: 250, backoff_max_ms: 4_000, attempt_timeout_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NarratorConfig {
    /// Cap on in-flight backend calls across all jobs.
    pub worker_pool_size: usize,
    pub sample_rate: u32,
    pub primary: BackendConfig,
    pub fallback: Option<BackendConfig>,
    pub retry: RetryConfig,
    pub segmenter: SegmenterConfig,
    pub assembler: AssemblerConfig,
    /// Per-style voice identity overrides.
    pub voices: BTreeMap<StyleTag, String>,
    pub output_dir: PathBuf,
    /// Prefix joined with the artifact name to form `artifact_uri`.
    pub uri_prefix: String,
    pub retention_secs: u64,
    pub default_options: JobOptions,
}

impl Default for NarratorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 8,
            sample_rate: SAMPLE_RATE,
            primary: BackendConfig::default(),
            fallback: None,
            retry: RetryConfig::default(),
            segmenter: SegmenterConfig::default(),
            assembler: AssemblerConfig::default(),
            voices: BTreeMap::new(),
            output_dir: PathBuf::from("audio_outputs"),
            uri_prefix: "/api/v1/audio/".to_string(),
            retention_secs: 24 * 60 * 60,
            default_options: JobOptions::default(),
        }
    }
}

impl NarratorConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: NarratorConfig = serde_json::from_str(json).context("Failed to parse narrator config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config: {}", path.display()))?;
        Self::from_json_str(&bytes).with_context(|| format!("Invalid config: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be at least 1");
        }
        if self.sample_rate < 8_000 {
            anyhow::bail!("sample_rate {} is below 8000 Hz", self.sample_rate);
        }
        if self.segmenter.max_unit_chars < 16 {
            anyhow::bail!("segmenter.max_unit_chars must be at least 16");
        }
        self.default_options.validate()?;
        Ok(())
    }
}
