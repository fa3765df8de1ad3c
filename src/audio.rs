//! Mono PCM buffers and the conversions the pipeline needs between backend
//! responses and the assembler.
//!
//! All pipeline audio is mono `f32` in `[-1.0, 1.0]`.  Backends may answer
//! with WAV (any bit depth, any channel count) or raw 16-bit little-endian
//! PCM; both are decoded here and down-mixed to mono.

use std::io::Cursor;

use crate::error::BackendError;

/// Default assembly/output sample rate (matches kittentts-server).
pub const SAMPLE_RATE: u32 = 24_000;

/// Samples with an absolute value at or below this count as silence.
const SILENCE_FLOOR: f32 = 1.0e-4;

#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn silence(duration_secs: f32, sample_rate: u32) -> Self {
        let len = (duration_secs.max(0.0) * sample_rate as f32).round() as usize;
        Self { samples: vec![0.0; len], sample_rate }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|s| s.abs() <= SILENCE_FLOOR)
    }

    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / self.samples.len() as f64).sqrt() as f32
    }

    /// Linear-interpolation resample.  A no-op when the rate already matches.
    pub fn resampled(self, target_rate: u32) -> Self {
        if self.samples.is_empty() || self.sample_rate == 0 {
            return Self { samples: self.samples, sample_rate: target_rate };
        }
        if self.sample_rate == target_rate {
            return self;
        }
        let ratio = self.sample_rate as f64 / target_rate as f64;
        let out_len = ((self.samples.len() as f64) / ratio).round().max(1.0) as usize;
        let last = self.samples.len() - 1;
        let samples = (0..out_len)
            .map(|i| {
                let pos = i as f64 * ratio;
                let idx = (pos.floor() as usize).min(last);
                let next = (idx + 1).min(last);
                let frac = (pos - idx as f64) as f32;
                self.samples[idx] + (self.samples[next] - self.samples[idx]) * frac
            })
            .collect();
        Self { samples, sample_rate: target_rate }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

fn downmix(interleaved: Vec<f32>, channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved;
    }
    let ch = channels as usize;
    interleaved
        .chunks(ch)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Decode a complete WAV file held in memory.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer, BackendError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| BackendError::Malformed(format!("WAV header: {e}")))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, _) => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| BackendError::Malformed(format!("WAV data: {e}")))?,
        (hound::SampleFormat::Int, bits) if (1..=32).contains(&bits) => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| BackendError::Malformed(format!("WAV data: {e}")))?
        }
        (_, bits) => return Err(BackendError::Malformed(format!("unsupported WAV bit depth {bits}"))),
    };

    Ok(AudioBuffer::new(downmix(interleaved, spec.channels), spec.sample_rate))
}

/// Decode headerless 16-bit little-endian mono PCM.
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32) -> Result<AudioBuffer, BackendError> {
    if bytes.len() % 2 != 0 {
        return Err(BackendError::Malformed(format!("odd PCM byte count {}", bytes.len())));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0)
        .collect();
    Ok(AudioBuffer::new(samples, sample_rate))
}
