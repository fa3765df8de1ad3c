//! Speech backends.
//!
//! A backend turns `(text, voice profile or default)` into an
//! [`AudioBuffer`], or reports a [`BackendError`].  It must never hand back
//! silence as a success; the dispatcher double-checks this anyway.
//!
//! # Available backends
//!
//! - [`http::HttpSpeechBackend`]: any OpenAI-compatible `/v1/audio/speech`
//!   endpoint (kittentts-server, hosted APIs).
//!
//! Tests and embedders plug in their own engines by implementing
//! [`SpeechBackend`].

pub mod http;

use async_trait::async_trait;
use serde::Serialize;

use crate::{audio::AudioBuffer, error::BackendError, voice::VoiceProfile};

pub use http::{BackendConfig, HttpSpeechBackend, ResponseFormat};

/// Which of the two configured engines produced a unit's audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendRole {
    Primary,
    Fallback,
}

/// Common interface for text-to-speech engines.
///
/// Calls are independent, stateless requests: one handle is shared by every
/// job in the process and called concurrently.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether per-style parameters (voice, pace, pitch, emphasis) are honoured.
    fn supports_styles(&self) -> bool {
        true
    }

    /// Synthesise `text`.  `profile = None` asks for the backend's default voice.
    async fn synthesize(
        &self,
        text: &str,
        profile: Option<&VoiceProfile>,
    ) -> Result<AudioBuffer, BackendError>;
}
