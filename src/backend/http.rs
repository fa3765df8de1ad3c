//! OpenAI-compatible HTTP speech backend.
//!
//! Posts to `{base_url}/v1/audio/speech`:
//!
//! | Field             | Source                                           |
//! |-------------------|--------------------------------------------------|
//! | `model`           | [`BackendConfig::model`]                         |
//! | `input`           | unit text                                        |
//! | `voice`           | profile voice identity, else `default_voice`     |
//! | `speed`           | profile pace, else `1.0`                         |
//! | `response_format` | `wav` or `pcm`                                   |
//! | `instructions`    | style/pitch/emphasis hint (styled requests only) |

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::SpeechBackend;
use crate::{
    audio::{decode_pcm16, decode_wav, AudioBuffer, SAMPLE_RATE},
    error::BackendError,
    voice::{VoiceProfile, DEFAULT_VOICE},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Wav,
    /// Headerless 16-bit little-endian mono at `pcm_sample_rate`.
    Pcm,
}

/// Connection settings for one HTTP backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Voice used when no profile is supplied (fallback synthesis).
    pub default_voice: String,
    pub response_format: ResponseFormat,
    pub pcm_sample_rate: u32,
    /// `false` makes every request use the default voice and speed.
    pub supports_styles: bool,
    /// Transport-level timeout; the dispatcher applies its own per-attempt timeout too.
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: "kittentts".to_string(),
            base_url: "http://127.0.0.1:8080".to_string(),
            api_key: None,
            model: "kitten-tts-mini-0.8".to_string(),
            default_voice: DEFAULT_VOICE.to_string(),
            response_format: ResponseFormat::Wav,
            pcm_sample_rate: SAMPLE_RATE,
            supports_styles: true,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequestBody<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    speed: f32,
    response_format: ResponseFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
}

pub struct HttpSpeechBackend {
    config: BackendConfig,
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSpeechBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BackendError::Transport(format!("cannot build HTTP client: {e}")))?;
        let endpoint = format!("{}/v1/audio/speech", config.base_url.trim_end_matches('/'));
        Ok(Self { config, client, endpoint })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn build_http_request(&self, text: &str, profile: Option<&VoiceProfile>) -> reqwest::RequestBuilder {
        let profile = profile.filter(|_| self.config.supports_styles);
        let body = SpeechRequestBody {
            model: &self.config.model,
            input: text,
            voice: profile.map_or(self.config.default_voice.as_str(), |p| p.voice_identity.as_str()),
            speed: profile.map_or(1.0, |p| p.pace),
            response_format: self.config.response_format,
            instructions: profile.map(VoiceProfile::instructions),
        };

        let accept = match self.config.response_format {
            ResponseFormat::Wav => "audio/wav",
            ResponseFormat::Pcm => "audio/pcm",
        };
        let request = self.client.post(&self.endpoint).header("Accept", accept).json(&body);
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

fn classify_transport(e: reqwest::Error, timeout_secs: u64) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout { after_ms: timeout_secs * 1000 }
    } else {
        BackendError::Transport(e.to_string())
    }
}

#[async_trait]
impl SpeechBackend for HttpSpeechBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn supports_styles(&self) -> bool {
        self.config.supports_styles
    }

    async fn synthesize(
        &self,
        text: &str,
        profile: Option<&VoiceProfile>,
    ) -> Result<AudioBuffer, BackendError> {
        let timeout_secs = self.config.request_timeout_secs;
        let response = self
            .build_http_request(text, profile)
            .send()
            .await
            .map_err(|e| classify_transport(e, timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(BackendError::Rejected(format!("HTTP {status}: {snippet}")));
        }

        let bytes = response.bytes().await.map_err(|e| classify_transport(e, timeout_secs))?;
        debug!(backend = %self.config.name, bytes = bytes.len(), "speech response received");
        if bytes.is_empty() {
            return Err(BackendError::EmptyAudio);
        }

        match self.config.response_format {
            ResponseFormat::Wav => decode_wav(&bytes),
            ResponseFormat::Pcm => decode_pcm16(&bytes, self.config.pcm_sample_rate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{style::StyleTag, voice::VoiceTable};

    fn body_json(req: reqwest::RequestBuilder) -> (reqwest::Request, serde_json::Value) {
        let req = req.build().unwrap();
        let bytes = req.body().and_then(|b| b.as_bytes()).unwrap().to_vec();
        (req, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_styled_request() {
        let backend = HttpSpeechBackend::new(BackendConfig {
            base_url: "http://tts.local:8080/".into(),
            api_key: Some("secret".into()),
            ..Default::default()
        })
        .unwrap();
        let profile = VoiceTable::new().resolve(StyleTag::Excited);
        let (req, body) = body_json(backend.build_http_request("Hooray!", Some(&profile)));

        assert_eq!(req.url().as_str(), "http://tts.local:8080/v1/audio/speech");
        assert_eq!(req.headers()["authorization"], "Bearer secret");
        assert_eq!(body["input"], "Hooray!");
        assert_eq!(body["voice"], "Luna");
        assert_eq!(body["response_format"], "wav");
        assert!((body["speed"].as_f64().unwrap() - 1.12).abs() < 1e-6);
        assert!(body["instructions"].as_str().unwrap().contains("excited"));
    }

    #[test]
    fn test_default_voice_without_profile() {
        let backend = HttpSpeechBackend::new(BackendConfig::default()).unwrap();
        let (req, body) = body_json(backend.build_http_request("Hello.", None));
        assert!(req.headers().get("authorization").is_none());
        assert_eq!(body["voice"], "Jasper");
        assert_eq!(body["speed"], 1.0);
        assert!(body.get("instructions").is_none());
    }

    #[test]
    fn test_styleless_backend_ignores_profile() {
        let backend = HttpSpeechBackend::new(BackendConfig {
            supports_styles: false,
            response_format: ResponseFormat::Pcm,
            default_voice: "alloy".into(),
            ..Default::default()
        })
        .unwrap();
        let profile = VoiceTable::new().resolve(StyleTag::Sad);
        let (_, body) = body_json(backend.build_http_request("Goodbye.", Some(&profile)));
        assert_eq!(body["voice"], "alloy");
        assert_eq!(body["response_format"], "pcm");
        assert!(!backend.supports_styles());
    }
}
