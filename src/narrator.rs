//! Orchestration: one [`NarrationRequest`] → one artifact or one [`JobFailure`].
//!
//! A [`Narrator`] holds the process-wide pieces (backend handles, worker pool,
//! rule table, voice table, artifact store) and is passed in explicitly;
//! nothing here is global.  Each job runs its stages in order:
//!
//! 1. **Segmenting**: [`Segmenter::segment_framed`]
//! 2. **Classifying**: rule table (or the request's style override) + voice table
//! 3. **Synthesizing**: [`Dispatcher::dispatch`], then the failure threshold
//! 4. **Assembling**: [`Assembler::assemble`] on a blocking thread, then storage
//!
//! Cancellation is checked at every stage boundary and inside synthesis.
//! Nothing is written to the store unless assembly succeeded and the job was
//! not cancelled.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::{watch, Semaphore}, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::{
    assemble::{Assembler, AssemblyPiece},
    backend::{HttpSpeechBackend, SpeechBackend},
    config::{JobOptions, NarratorConfig},
    dispatch::{Dispatcher, StyledUnit, UnitOutcome},
    error::{ErrorKind, JobFailure, NarrationError},
    job::{Artifact, JobOutcome, JobState, NarrationJob, NarrationRequest, NarrationSuccess, TimelineEntry},
    segment::Segmenter,
    store::ArtifactStore,
    style::StyleClassifier,
    voice::{StyleDescription, VoiceTable},
};

pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Clone)]
pub struct Narrator {
    segmenter: Arc<Segmenter>,
    classifier: Arc<StyleClassifier>,
    voices: Arc<VoiceTable>,
    dispatcher: Dispatcher,
    assembler: Arc<Assembler>,
    store: Option<ArtifactStore>,
    default_options: JobOptions,
}

impl Narrator {
    /// HTTP backends and an on-disk store, all from `config`.
    pub async fn from_config(config: &NarratorConfig) -> anyhow::Result<Self> {
        let primary = HttpSpeechBackend::new(config.primary.clone())
            .with_context(|| format!("Cannot set up primary backend '{}'", config.primary.name))?;
        let fallback = match &config.fallback {
            Some(cfg) => {
                let backend = HttpSpeechBackend::new(cfg.clone())
                    .with_context(|| format!("Cannot set up fallback backend '{}'", cfg.name))?;
                Some(Arc::new(backend) as Arc<dyn SpeechBackend>)
            }
            None => None,
        };
        let store = ArtifactStore::open(
            &config.output_dir,
            &config.uri_prefix,
            Duration::from_secs(config.retention_secs),
        )
        .await
        .with_context(|| format!("Cannot open artifact store at {}", config.output_dir.display()))?;

        info!(
            primary = %config.primary.name,
            fallback = config.fallback.as_ref().map(|f| f.name.as_str()).unwrap_or("none"),
            workers = config.worker_pool_size,
            output_dir = %config.output_dir.display(),
            "narrator ready"
        );
        Ok(Self::with_backends(config, Arc::new(primary), fallback).with_store(store))
    }

    /// Narrator over caller-supplied backends.  Artifacts stay in memory until
    /// a store is attached with [`with_store`](Self::with_store).
    pub fn with_backends(
        config: &NarratorConfig,
        primary: Arc<dyn SpeechBackend>,
        fallback: Option<Arc<dyn SpeechBackend>>,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            segmenter: Arc::new(Segmenter::new(config.segmenter.clone())),
            classifier: Arc::new(StyleClassifier::new()),
            voices: Arc::new(VoiceTable::with_overrides(config.voices.clone())),
            dispatcher: Dispatcher::new(primary, fallback, pool, config.retry.clone()),
            assembler: Arc::new(Assembler::new(config.assembler.clone(), config.sample_rate)),
            store: None,
            default_options: config.default_options.clone(),
        }
    }

    pub fn with_store(mut self, store: ArtifactStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_classifier(mut self, classifier: StyleClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn store(&self) -> Option<&ArtifactStore> {
        self.store.as_ref()
    }

    /// The styles this narrator can speak in, with their voices.
    pub fn styles(&self) -> Vec<StyleDescription> {
        self.voices.describe()
    }

    pub fn default_options(&self) -> &JobOptions {
        &self.default_options
    }

    /// Run a job to completion on the current task.
    pub async fn run(&self, request: NarrationRequest, cancel: CancellationToken) -> JobOutcome {
        self.run_job(new_job_id(), request, cancel, None).await
    }

    /// Run a job on its own task and return a handle for status and cancellation.
    pub fn spawn(&self, request: NarrationRequest) -> JobHandle {
        let job_id = new_job_id();
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(JobState::Pending);
        let narrator = self.clone();
        let task = tokio::spawn({
            let job_id = job_id.clone();
            let cancel = cancel.clone();
            async move { narrator.run_job(job_id, request, cancel, Some(tx)).await }
        });
        JobHandle { job_id, state: rx, cancel, task }
    }

    async fn run_job(
        &self,
        job_id: String,
        request: NarrationRequest,
        cancel: CancellationToken,
        progress: Option<watch::Sender<JobState>>,
    ) -> JobOutcome {
        let mut job = NarrationJob::new(job_id, request.story_text.clone());
        let span = info_span!("narration", job_id = %job.job_id);
        async {
            info!(chars = request.story_text.chars().count(), pages = request.page_boundaries.len() + 1, "job accepted");
            match self.drive(&mut job, &request, &cancel, progress.as_ref()).await {
                Ok(success) => {
                    info!(
                        units = success.unit_count,
                        failed = success.failed_unit_count,
                        secs = success.duration_seconds,
                        artifact = %success.artifact_name,
                        "job complete"
                    );
                    Ok(success)
                }
                Err(e) => {
                    let failure = job.fail(&e);
                    if let Some(tx) = &progress {
                        tx.send_replace(JobState::Failed);
                    }
                    error!(furthest = %failure.furthest_state, kind = ?failure.error_kind, "job failed: {e}");
                    Err(failure)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn advance(
        &self,
        job: &mut NarrationJob,
        to: JobState,
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<JobState>>,
    ) -> Result<(), NarrationError> {
        if cancel.is_cancelled() {
            return Err(NarrationError::Cancelled);
        }
        job.transition(to)?;
        if let Some(tx) = progress {
            tx.send_replace(to);
        }
        debug!(state = %to, "job state");
        Ok(())
    }

    async fn drive(
        &self,
        job: &mut NarrationJob,
        request: &NarrationRequest,
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<JobState>>,
    ) -> Result<NarrationSuccess, NarrationError> {
        let options = request.job_options.clone().unwrap_or_else(|| self.default_options.clone());
        options.validate()?;

        // ── Segmenting ──────────────────────────────────────────────────────
        self.advance(job, JobState::Segmenting, cancel, progress)?;
        job.units = self.segmenter.segment_framed(
            &request.story_text,
            &request.page_boundaries,
            request.title.as_deref(),
        )?;
        info!(units = job.units.len(), "segmented");

        // ── Classifying ─────────────────────────────────────────────────────
        self.advance(job, JobState::Classifying, cancel, progress)?;
        let styled: Vec<StyledUnit> = job
            .units
            .iter()
            .map(|unit| {
                let style = options.style_override.unwrap_or_else(|| self.classifier.classify(&unit.text));
                StyledUnit { unit: unit.clone(), style, profile: self.voices.resolve(style) }
            })
            .collect();
        job.styles = styled.iter().map(|s| s.style).collect();

        // ── Synthesizing ────────────────────────────────────────────────────
        self.advance(job, JobState::Synthesizing, cancel, progress)?;
        let report = self
            .dispatcher
            .dispatch(styled, options.max_parallel_synthesis, options.retry_ceiling, cancel)
            .await?;
        job.unit_failures = report.failures();
        report.check_threshold(options.max_failed_unit_fraction)?;

        // Per-unit (backend, attempts) for the timeline; `None` backend = placeholder.
        let mut provenance = BTreeMap::new();
        for (index, outcome) in report.outcomes {
            match outcome {
                UnitOutcome::Synthesized(result) => {
                    provenance.insert(index, (Some(result.backend_used), result.attempt_count));
                    job.results.insert(index, result);
                }
                UnitOutcome::Failed(failure) => {
                    provenance.insert(index, (None, failure.attempts));
                }
            }
        }

        // ── Assembling ──────────────────────────────────────────────────────
        self.advance(job, JobState::Assembling, cancel, progress)?;
        let mut pieces = BTreeMap::new();
        for (index, result) in std::mem::take(&mut job.results) {
            pieces.insert(index, AssemblyPiece::Speech(result.audio));
        }
        for failure in &job.unit_failures {
            let chars = job.units.get(failure.unit_index).map_or(0, |u| u.text.chars().count());
            pieces.insert(failure.unit_index, AssemblyPiece::Placeholder { chars });
        }

        let assembler = Arc::clone(&self.assembler);
        let expected = job.units.len();
        let format = options.output_format;
        let assembled = tokio::task::spawn_blocking(move || assembler.assemble(pieces, expected, format))
            .await
            .map_err(|e| NarrationError::Encode(format!("assembly task failed: {e}")))??;

        if cancel.is_cancelled() {
            return Err(NarrationError::Cancelled);
        }

        let artifact = match &self.store {
            Some(store) => {
                let stored = store.put(&job.job_id, format, &assembled.bytes).await?;
                Artifact::Stored { name: stored.name, uri: stored.uri, path: stored.path }
            }
            None => Artifact::InMemory {
                name: format!("{}.{}", job.job_id, format.extension()),
                bytes: assembled.bytes,
            },
        };
        let name = artifact.name().to_string();
        job.artifact_uri = artifact.uri().map(str::to_string);

        job.transition(JobState::Complete)?;
        if let Some(tx) = progress {
            tx.send_replace(JobState::Complete);
        }

        let timeline = assembled
            .spans
            .iter()
            .map(|span| {
                let (backend_used, attempts) = provenance.get(&span.unit_index).copied().unwrap_or((None, 0));
                TimelineEntry {
                    unit_index: span.unit_index,
                    source_page: job.units.get(span.unit_index).and_then(|u| u.source_page),
                    style: job.styles.get(span.unit_index).copied().unwrap_or_default(),
                    backend_used,
                    placeholder: backend_used.is_none(),
                    attempts,
                    start_secs: span.start_secs,
                    end_secs: span.end_secs,
                }
            })
            .collect();

        Ok(NarrationSuccess {
            job_id: job.job_id.clone(),
            artifact_uri: job.artifact_uri.clone(),
            artifact_name: name,
            artifact,
            output_format: format,
            duration_seconds: assembled.duration_secs,
            unit_count: job.units.len(),
            failed_unit_count: job.unit_failures.len(),
            unit_failures: job.unit_failures.clone(),
            timeline,
        })
    }
}

/// Handle to a job started with [`Narrator::spawn`].
pub struct JobHandle {
    pub job_id: String,
    state: watch::Receiver<JobState>,
    cancel: CancellationToken,
    task: JoinHandle<JobOutcome>,
}

impl JobHandle {
    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.clone()
    }

    /// Ask the job to stop.  In-flight backend calls are abandoned.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> JobOutcome {
        let last = *self.state.borrow();
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(JobFailure {
                job_id: self.job_id,
                error_kind: ErrorKind::JobFailed,
                furthest_state: last,
                message: format!("narration task ended abnormally: {e}"),
                causes: vec![e.to_string()],
                unit_failures: Vec::new(),
            }),
        }
    }
}
