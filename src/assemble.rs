//! Audio assembler: per-unit buffers → one encoded artifact.
//!
//! A pure transform: it never decides where the bytes go.  Input is an
//! index-keyed map that must hold exactly `0..expected`; anything else is an
//! [`NarrationError::AssemblyIncomplete`] and no audio is produced.
//!
//! Steps:
//! 1. Resample every buffer to the output rate.
//! 2. Render placeholders as silence sized from the unit's text length.
//! 3. Join in index order with a silence gap or a linear crossfade.
//! 4. Scale to the target RMS, limited by the peak ceiling.
//! 5. Encode (WAV or MP3).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    audio::AudioBuffer,
    config::OutputFormat,
    encode,
    error::NarrationError,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Transition {
    /// Gap of silence between consecutive units.
    Silence { ms: u32 },
    /// Overlap of consecutive units with linear fades.
    Crossfade { ms: u32 },
}

impl Default for Transition {
    fn default() -> Self {
        Transition::Silence { ms: 350 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    pub transition: Transition,
    pub normalize_loudness: bool,
    pub target_rms_dbfs: f32,
    pub peak_ceiling_dbfs: f32,
    /// Speaking rate assumed when sizing a placeholder.
    pub placeholder_chars_per_second: f32,
    pub min_placeholder_ms: u32,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            transition: Transition::default(),
            normalize_loudness: true,
            target_rms_dbfs: -20.0,
            peak_ceiling_dbfs: -1.0,
            placeholder_chars_per_second: 14.0,
            min_placeholder_ms: 500,
        }
    }
}

impl AssemblerConfig {
    /// Estimated spoken duration of `chars` characters.
    pub fn placeholder_secs(&self, chars: usize) -> f32 {
        let cps = if self.placeholder_chars_per_second > 0.0 { self.placeholder_chars_per_second } else { 14.0 };
        (chars as f32 / cps).max(self.min_placeholder_ms as f32 / 1000.0)
    }
}

/// One unit's contribution to the narration.
#[derive(Debug, Clone)]
pub enum AssemblyPiece {
    Speech(AudioBuffer),
    /// Silent stand-in for a unit that could not be synthesised.
    Placeholder { chars: usize },
}

/// Where a unit sits in the assembled audio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UnitSpan {
    pub unit_index: usize,
    pub start_secs: f64,
    pub end_secs: f64,
}

#[derive(Debug, Clone)]
pub struct AssembledAudio {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub sample_rate: u32,
    pub duration_secs: f64,
    pub spans: Vec<UnitSpan>,
}

fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

#[derive(Debug, Clone)]
pub struct Assembler {
    config: AssemblerConfig,
    sample_rate: u32,
}

impl Assembler {
    pub fn new(config: AssemblerConfig, sample_rate: u32) -> Self {
        Self { config, sample_rate }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Fail unless `pieces` holds exactly the indices `0..expected`.
    pub fn check_complete(pieces: &BTreeMap<usize, AssemblyPiece>, expected: usize) -> Result<(), NarrationError> {
        let missing: Vec<usize> = (0..expected).filter(|i| !pieces.contains_key(i)).collect();
        let stray = pieces.keys().any(|&i| i >= expected);
        if expected == 0 || !missing.is_empty() || stray {
            return Err(NarrationError::AssemblyIncomplete { expected, missing });
        }
        Ok(())
    }

    /// Join the pieces into one mono buffer at the output rate.
    pub fn mix(
        &self,
        pieces: BTreeMap<usize, AssemblyPiece>,
        expected: usize,
    ) -> Result<(AudioBuffer, Vec<UnitSpan>), NarrationError> {
        Self::check_complete(&pieces, expected)?;

        let rate = self.sample_rate;
        let mut out: Vec<f32> = Vec::new();
        let mut bounds: Vec<(usize, usize, usize)> = Vec::with_capacity(expected);
        let mut speech_ranges: Vec<(usize, usize)> = Vec::new();

        for (index, piece) in pieces {
            let (samples, is_speech) = match piece {
                AssemblyPiece::Speech(buf) => (buf.resampled(rate).samples, true),
                AssemblyPiece::Placeholder { chars } => {
                    (AudioBuffer::silence(self.config.placeholder_secs(chars), rate).samples, false)
                }
            };

            // `skip` leading samples are already blended into `out`.
            let (start, skip) = match self.config.transition {
                _ if out.is_empty() => (0, 0),
                Transition::Silence { ms } => {
                    let gap = (ms as u64 * rate as u64 / 1000) as usize;
                    out.resize(out.len() + gap, 0.0);
                    (out.len(), 0)
                }
                Transition::Crossfade { ms } => {
                    let want = (ms as u64 * rate as u64 / 1000) as usize;
                    let overlap = want.min(out.len()).min(samples.len());
                    let start = out.len() - overlap;
                    for (i, &s) in samples[..overlap].iter().enumerate() {
                        let t = (i as f32 + 1.0) / (overlap as f32 + 1.0);
                        out[start + i] = out[start + i] * (1.0 - t) + s * t;
                    }
                    (start, overlap)
                }
            };

            out.extend_from_slice(&samples[skip..]);
            let end = out.len();
            bounds.push((index, start, end));
            if is_speech {
                speech_ranges.push((start, end));
            }
        }

        if self.config.normalize_loudness {
            self.normalize(&mut out, &speech_ranges);
        }

        let spans = bounds
            .into_iter()
            .map(|(unit_index, start, end)| UnitSpan {
                unit_index,
                start_secs: start as f64 / rate as f64,
                end_secs: end as f64 / rate as f64,
            })
            .collect();
        Ok((AudioBuffer::new(out, rate), spans))
    }

    /// Scale toward the target RMS measured over speech only.
    fn normalize(&self, out: &mut [f32], speech_ranges: &[(usize, usize)]) {
        let (mut sum, mut n) = (0f64, 0usize);
        for &(start, end) in speech_ranges {
            for &s in &out[start..end] {
                sum += (s as f64) * (s as f64);
                n += 1;
            }
        }
        if n == 0 || sum == 0.0 {
            return;
        }
        let rms = (sum / n as f64).sqrt() as f32;
        let peak = out.iter().fold(0f32, |m, s| m.max(s.abs()));
        let mut gain = db_to_linear(self.config.target_rms_dbfs) / rms;
        let ceiling = db_to_linear(self.config.peak_ceiling_dbfs);
        if peak * gain > ceiling {
            gain = ceiling / peak;
        }
        debug!(rms, peak, gain, "loudness normalisation");
        for s in out.iter_mut() {
            *s *= gain;
        }
    }

    /// Mix and encode.
    pub fn assemble(
        &self,
        pieces: BTreeMap<usize, AssemblyPiece>,
        expected: usize,
        format: OutputFormat,
    ) -> Result<AssembledAudio, NarrationError> {
        let (audio, spans) = self.mix(pieces, expected)?;
        let duration_secs = audio.duration_secs();
        let bytes = encode::encode(&audio, format)?;
        debug!(units = expected, duration_secs, bytes = bytes.len(), "assembled narration");
        Ok(AssembledAudio { bytes, format, sample_rate: self.sample_rate, duration_secs, spans })
    }
}
