//! # storynarrator
//!
//! Segmented expressive narration: story text in, one narrated audio file out.
//! Speech comes from any OpenAI-compatible `/v1/audio/speech` endpoint
//! ([kittentts-server](https://github.com/eugenehp/kittentts-rs) works out of
//! the box), with a second endpoint as fallback.
//!
//! ## Quick start
//!
//! ```no_run
//! use storynarrator::{NarrationRequest, Narrator, NarratorConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = NarratorConfig::from_json_file(std::path::Path::new("narrator.json"))?;
//! let narrator = Narrator::from_config(&config).await?;
//!
//! let request = NarrationRequest::new("The fox ran fast! \"Wait for me,\" whispered the mouse.")
//!     .with_title("The Fox and the Mouse");
//! match narrator.run(request, CancellationToken::new()).await {
//!     Ok(done) => println!("{:?} ({:.1} s)", done.artifact_uri, done.duration_seconds),
//!     Err(failed) => eprintln!("{failed}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipeline
//! 1. **Normalisation**: markup stripped, quotes straightened, numbers → words.
//! 2. **Segmentation**: pages → paragraphs → sentences; long sentences cut at
//!    the nearest comma/semicolon.
//! 3. **Style classification**: ordered rule table, first match wins,
//!    default `narrator`.
//! 4. **Voice resolution**: static `StyleTag → VoiceProfile` table.
//! 5. **Synthesis**: bounded parallel calls, retry with backoff, then one
//!    fallback call with the default voice.
//! 6. **Assembly**: index order, silence or crossfade between units,
//!    loudness normalisation, WAV/MP3 encoding.
//!
//! Units that fail on both backends become silent placeholders as long as the
//! failed fraction stays within `max_failed_unit_fraction`; above it the whole
//! job fails and nothing is written.

pub mod assemble;
pub mod audio;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod encode;
pub mod error;
pub mod job;
pub mod narrator;
pub mod normalize;
pub mod segment;
pub mod store;
pub mod style;
pub mod voice;

// ─── Re-exports for convenience ─────────────────────────────────────────────

pub use audio::{AudioBuffer, SAMPLE_RATE};
pub use backend::{BackendRole, SpeechBackend};
pub use config::{JobOptions, NarratorConfig, OutputFormat};
pub use error::{BackendError, ErrorKind, JobFailure, NarrationError};
pub use job::{JobOutcome, JobState, NarrationRequest, NarrationSuccess};
pub use narrator::{JobHandle, Narrator};
pub use segment::NarrationUnit;
pub use style::StyleTag;
pub use voice::VoiceProfile;
