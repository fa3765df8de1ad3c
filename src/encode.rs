//! Output encoders: mono `f32` samples → container bytes.
//!
//! WAV is always available.  MP3 needs the `mp3` feature (libmp3lame is
//! compiled from source by `mp3lame-encoder`).

use std::io::Cursor;

use crate::{audio::AudioBuffer, config::OutputFormat, error::NarrationError};

/// f32 `[-1.0, 1.0]` → i16 `[-32768, 32767]`.
fn to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Encode as 16-bit PCM WAV.
///
/// 16-bit PCM rather than 32-bit float: Android's `MediaPlayer` accepts float
/// WAV headers but plays silence.
pub fn encode_wav(audio: &AudioBuffer) -> Result<Vec<u8>, NarrationError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + audio.samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for s in to_i16(&audio.samples) {
            writer.write_sample(s)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

#[cfg(feature = "mp3")]
pub fn encode_mp3(audio: &AudioBuffer) -> Result<Vec<u8>, NarrationError> {
    use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, MonoPcm, Quality};

    let mp3_err = |stage: &str, e: &dyn std::fmt::Debug| NarrationError::Encode(format!("mp3 {stage}: {e:?}"));

    let mut builder = Builder::new().ok_or_else(|| NarrationError::Encode("cannot allocate LAME encoder".into()))?;
    builder.set_num_channels(1).map_err(|e| mp3_err("channels", &e))?;
    builder.set_sample_rate(audio.sample_rate).map_err(|e| mp3_err("sample rate", &e))?;
    builder.set_brate(Bitrate::Kbps64).map_err(|e| mp3_err("bitrate", &e))?;
    builder.set_quality(Quality::Best).map_err(|e| mp3_err("quality", &e))?;
    let mut encoder = builder.build().map_err(|e| mp3_err("init", &e))?;

    let pcm = to_i16(&audio.samples);
    let mut out: Vec<u8> = Vec::new();
    out.reserve(mp3lame_encoder::max_required_buffer_size(pcm.len()));

    let written = encoder
        .encode(MonoPcm(&pcm), out.spare_capacity_mut())
        .map_err(|e| mp3_err("encode", &e))?;
    // SAFETY: LAME initialised exactly `written` bytes of the spare capacity.
    unsafe { out.set_len(out.len().wrapping_add(written)) };

    let flushed = encoder
        .flush::<FlushNoGap>(out.spare_capacity_mut())
        .map_err(|e| mp3_err("flush", &e))?;
    // SAFETY: as above, for the flushed tail.
    unsafe { out.set_len(out.len().wrapping_add(flushed)) };

    Ok(out)
}

/// Encode `audio` in the requested container.
pub fn encode(audio: &AudioBuffer, format: OutputFormat) -> Result<Vec<u8>, NarrationError> {
    match format {
        OutputFormat::Wav => encode_wav(audio),
        #[cfg(feature = "mp3")]
        OutputFormat::Mp3 => encode_mp3(audio),
        #[cfg(not(feature = "mp3"))]
        OutputFormat::Mp3 => Err(NarrationError::Encode(
            "mp3 output requires the `mp3` feature".to_string(),
        )),
    }
}
