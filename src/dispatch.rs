//! Synthesis dispatcher: one [`SynthesisResult`] (or [`UnitFailure`]) per unit.
//!
//! ## Scheduling
//! Every unit becomes a task in a [`JoinSet`].  Two semaphores bound the work:
//!
//! | Semaphore | Scope        | Held for                       |
//! |-----------|--------------|--------------------------------|
//! | job       | one dispatch | the unit's whole retry loop    |
//! | pool      | process-wide | one backend call at a time     |
//!
//! Results land in a `BTreeMap` keyed by unit index, so completion order has
//! no influence on what the assembler reads.
//!
//! ## Per-unit loop
//! The loop carries an explicit [`UnitAttempt`] and asks the pure
//! [`next_action`] what to do after each failure:
//!
//! ```text
//! primary ──fail──► RetryPrimary (backoff) ──fail──► … ──► TryFallback ──fail──► GiveUp
//!    │                                                        │
//!    └──────────────────────── ok ───────────────────────────┴──► SynthesisResult
//! ```
//!
//! `retry_ceiling` counts every backend call for the unit, the fallback
//! attempt included, so `attempt_count` never exceeds it.

use std::{collections::{BTreeMap, HashMap}, sync::Arc, time::Duration};

use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    audio::AudioBuffer,
    backend::{BackendRole, SpeechBackend},
    config::RetryConfig,
    error::{BackendError, ErrorKind, NarrationError, UnitFailure},
    segment::NarrationUnit,
    style::StyleTag,
    voice::VoiceProfile,
};

// ─────────────────────────────────────────────────────────────────────────────
// Retry policy
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub retry_ceiling: u32,
    pub has_fallback: bool,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(retry: &RetryConfig, retry_ceiling: u32, has_fallback: bool) -> Self {
        Self {
            retry_ceiling: retry_ceiling.max(1),
            has_fallback,
            backoff_base: Duration::from_millis(retry.backoff_base_ms),
            backoff_max: Duration::from_millis(retry.backoff_max_ms),
            attempt_timeout: Duration::from_millis(retry.attempt_timeout_ms),
        }
    }

    /// A ceiling of 1 leaves no room for the fallback call.
    pub fn fallback_enabled(&self) -> bool {
        self.has_fallback && self.retry_ceiling > 1
    }

    /// A fallback exists but the ceiling leaves it no call.
    pub fn fallback_unreachable(&self) -> bool {
        self.has_fallback && !self.fallback_enabled()
    }

    /// Primary calls allowed before switching to the fallback.
    pub fn primary_attempts(&self) -> u32 {
        if self.fallback_enabled() {
            self.retry_ceiling - 1
        } else {
            self.retry_ceiling
        }
    }

    /// Delay before the retry that follows `failed` primary failures.
    pub fn backoff(&self, failed: u32) -> Duration {
        let exp = failed.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exp).min(self.backoff_max)
    }
}

/// State carried through one unit's retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitAttempt {
    /// Backend calls made so far, fallback included.
    pub attempt_count: u32,
    pub primary_attempts: u32,
    pub last_error: Option<BackendError>,
    pub backend_in_use: BackendRole,
}

impl Default for UnitAttempt {
    fn default() -> Self {
        Self { attempt_count: 0, primary_attempts: 0, last_error: None, backend_in_use: BackendRole::Primary }
    }
}

impl UnitAttempt {
    fn record_failure(&mut self, error: BackendError) {
        self.last_error = Some(error);
    }

    fn begin_call(&mut self) {
        self.attempt_count += 1;
        if self.backend_in_use == BackendRole::Primary {
            self.primary_attempts += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    RetryPrimary,
    TryFallback,
    GiveUp,
}

/// Decide what follows a failed call.  Pure: depends only on its arguments.
pub fn next_action(state: &UnitAttempt, policy: &RetryPolicy) -> NextAction {
    if state.attempt_count >= policy.retry_ceiling {
        return NextAction::GiveUp;
    }
    match state.backend_in_use {
        BackendRole::Fallback => NextAction::GiveUp,
        BackendRole::Primary if state.primary_attempts < policy.primary_attempts() => NextAction::RetryPrimary,
        BackendRole::Primary if policy.fallback_enabled() => NextAction::TryFallback,
        BackendRole::Primary => NextAction::GiveUp,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inputs and outputs
// ─────────────────────────────────────────────────────────────────────────────

/// A unit after classification and voice resolution.
#[derive(Debug, Clone)]
pub struct StyledUnit {
    pub unit: NarrationUnit,
    pub style: StyleTag,
    pub profile: VoiceProfile,
}

#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub unit_index: usize,
    pub audio: AudioBuffer,
    pub backend_used: BackendRole,
    pub attempt_count: u32,
}

#[derive(Debug, Clone)]
pub enum UnitOutcome {
    Synthesized(SynthesisResult),
    Failed(UnitFailure),
}

/// Everything one dispatch produced, keyed by unit index.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub outcomes: BTreeMap<usize, UnitOutcome>,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// Failed units in index order.
    pub fn failures(&self) -> Vec<UnitFailure> {
        self.outcomes
            .values()
            .filter_map(|o| match o {
                UnitOutcome::Failed(f) => Some(f.clone()),
                UnitOutcome::Synthesized(_) => None,
            })
            .collect()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.values().filter(|o| matches!(o, UnitOutcome::Failed(_))).count()
    }

    /// Error out when the failed fraction is strictly above `max_fraction`.
    pub fn check_threshold(&self, max_fraction: f64) -> Result<(), NarrationError> {
        let failed = self.failed_count();
        let total = self.total();
        if total == 0 || failed == 0 {
            return Ok(());
        }
        if failed as f64 / total as f64 > max_fraction {
            return Err(NarrationError::FailureThresholdExceeded { failed, total, max_fraction });
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Runs unit synthesis against shared backends.  Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    primary: Arc<dyn SpeechBackend>,
    fallback: Option<Arc<dyn SpeechBackend>>,
    pool: Arc<Semaphore>,
    retry: RetryConfig,
}

impl Dispatcher {
    pub fn new(
        primary: Arc<dyn SpeechBackend>,
        fallback: Option<Arc<dyn SpeechBackend>>,
        pool: Arc<Semaphore>,
        retry: RetryConfig,
    ) -> Self {
        Self { primary, fallback, pool, retry }
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Synthesise every unit.  Returns `Cancelled` as soon as `cancel` fires;
    /// in-flight calls are aborted and their results discarded.
    pub async fn dispatch(
        &self,
        units: Vec<StyledUnit>,
        max_parallel: usize,
        retry_ceiling: u32,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, NarrationError> {
        let policy = Arc::new(RetryPolicy::new(&self.retry, retry_ceiling, self.has_fallback()));
        let job_slots = Arc::new(Semaphore::new(max_parallel.max(1)));
        let mut tasks = JoinSet::new();
        let mut task_units = HashMap::new();

        info!(
            units = units.len(),
            max_parallel,
            retry_ceiling = policy.retry_ceiling,
            fallback = policy.fallback_enabled(),
            "dispatching synthesis"
        );
        if policy.fallback_unreachable() {
            warn!(
                retry_ceiling = policy.retry_ceiling,
                "fallback backend configured but retry_ceiling leaves no call for it"
            );
        }

        for styled in units {
            let index = styled.unit.index;
            let worker = UnitWorker {
                primary: Arc::clone(&self.primary),
                fallback: self.fallback.clone(),
                pool: Arc::clone(&self.pool),
                policy: Arc::clone(&policy),
                cancel: cancel.child_token(),
            };
            let slots = Arc::clone(&job_slots);
            let handle = tasks.spawn(async move {
                let _slot = slots.acquire_owned().await.ok()?;
                worker.run(styled).await
            });
            task_units.insert(handle.id(), index);
        }

        let mut report = DispatchReport::default();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    info!("synthesis cancelled");
                    return Err(NarrationError::Cancelled);
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Some((index, outcome)))) => {
                        report.outcomes.insert(index, outcome);
                    }
                    // Only produced when the worker saw cancellation first.
                    Some(Ok(None)) => {}
                    Some(Err(e)) => {
                        let Some(&index) = task_units.get(&e.id()) else { continue };
                        warn!(unit = index, error = %e, "synthesis task aborted");
                        report.outcomes.insert(index, UnitOutcome::Failed(UnitFailure {
                            unit_index: index,
                            attempts: 0,
                            error_kind: ErrorKind::UnitSynthesisFailed,
                            message: format!("synthesis task aborted: {e}"),
                        }));
                    }
                },
            }
        }

        if cancel.is_cancelled() {
            return Err(NarrationError::Cancelled);
        }
        info!(
            synthesized = report.total() - report.failed_count(),
            failed = report.failed_count(),
            "synthesis finished"
        );
        Ok(report)
    }
}

struct UnitWorker {
    primary: Arc<dyn SpeechBackend>,
    fallback: Option<Arc<dyn SpeechBackend>>,
    pool: Arc<Semaphore>,
    policy: Arc<RetryPolicy>,
    cancel: CancellationToken,
}

impl UnitWorker {
    /// `None` means the unit was abandoned because the job was cancelled.
    async fn run(self, styled: StyledUnit) -> Option<(usize, UnitOutcome)> {
        let StyledUnit { unit, profile, .. } = styled;
        let mut state = UnitAttempt::default();

        loop {
            let (backend, call_profile) = match (state.backend_in_use, &self.fallback) {
                (BackendRole::Fallback, Some(fallback)) => (fallback, None),
                _ => (&self.primary, Some(&profile).filter(|_| self.primary.supports_styles())),
            };

            state.begin_call();
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                r = self.call(backend.as_ref(), &unit.text, call_profile) => r,
            };

            match result {
                Ok(audio) => {
                    debug!(
                        unit = unit.index,
                        backend = backend.name(),
                        attempts = state.attempt_count,
                        secs = audio.duration_secs(),
                        "unit synthesised"
                    );
                    return Some((
                        unit.index,
                        UnitOutcome::Synthesized(SynthesisResult {
                            unit_index: unit.index,
                            audio,
                            backend_used: state.backend_in_use,
                            attempt_count: state.attempt_count,
                        }),
                    ));
                }
                Err(e) => {
                    warn!(
                        unit = unit.index,
                        backend = backend.name(),
                        attempt = state.attempt_count,
                        error = %e,
                        "synthesis attempt failed"
                    );
                    state.record_failure(e);
                }
            }

            match next_action(&state, &self.policy) {
                NextAction::RetryPrimary => {
                    let delay = self.policy.backoff(state.primary_attempts);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                NextAction::TryFallback => {
                    state.backend_in_use = BackendRole::Fallback;
                }
                NextAction::GiveUp => {
                    let error = state.last_error.unwrap_or(BackendError::EmptyAudio);
                    warn!(unit = unit.index, attempts = state.attempt_count, "unit gave up");
                    return Some((
                        unit.index,
                        UnitOutcome::Failed(UnitFailure {
                            unit_index: unit.index,
                            attempts: state.attempt_count,
                            error_kind: error.kind(),
                            message: error.to_string(),
                        }),
                    ));
                }
            }
        }
    }

    /// One bounded backend call, holding a process-wide pool slot.
    async fn call(
        &self,
        backend: &dyn SpeechBackend,
        text: &str,
        profile: Option<&VoiceProfile>,
    ) -> Result<AudioBuffer, BackendError> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| BackendError::Transport("worker pool closed".into()))?;
        let timeout = self.policy.attempt_timeout;
        match tokio::time::timeout(timeout, backend.synthesize(text, profile)).await {
            Err(_) => Err(BackendError::Timeout { after_ms: timeout.as_millis() as u64 }),
            Ok(Err(e)) => Err(e),
            Ok(Ok(audio)) if audio.samples.iter().any(|s| !s.is_finite()) => {
                Err(BackendError::Malformed("non-finite sample in audio".into()))
            }
            Ok(Ok(audio)) if audio.samples.is_empty() || audio.is_silent() => Err(BackendError::EmptyAudio),
            Ok(Ok(audio)) => Ok(audio),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{style::StyleTag, voice::VoiceTable};
    use async_trait::async_trait;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    type Script = dyn Fn(&str, usize) -> Result<AudioBuffer, BackendError> + Send + Sync;

    /// Backend driven by a closure of `(text, call_number)`.
    struct ScriptedBackend {
        name: &'static str,
        script: Box<Script>,
        delay: Duration,
        styles: bool,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        profiles: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedBackend {
        fn new(
            name: &'static str,
            script: impl Fn(&str, usize) -> Result<AudioBuffer, BackendError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                name,
                script: Box::new(script),
                delay: Duration::ZERO,
                styles: true,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                profiles: Mutex::new(Vec::new()),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn without_styles(mut self) -> Self {
            self.styles = false;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SpeechBackend for ScriptedBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn supports_styles(&self) -> bool {
            self.styles
        }

        async fn synthesize(&self, text: &str, profile: Option<&VoiceProfile>) -> Result<AudioBuffer, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.profiles.lock().unwrap().push(profile.map(|p| p.voice_identity.clone()));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            (self.script)(text, n)
        }
    }

    fn tone() -> AudioBuffer {
        AudioBuffer::new(vec![0.25; 240], 24_000)
    }

    fn styled(n: usize) -> Vec<StyledUnit> {
        let table = VoiceTable::new();
        (0..n)
            .map(|i| StyledUnit {
                unit: NarrationUnit { index: i, text: format!("Sentence {i}."), source_page: None },
                style: StyleTag::Excited,
                profile: table.resolve(StyleTag::Excited),
            })
            .collect()
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig { backoff_base_ms: 100, backoff_max_ms: 1_000, attempt_timeout_ms: 1_000 }
    }

    fn dispatcher(primary: Arc<ScriptedBackend>, fallback: Option<Arc<ScriptedBackend>>) -> Dispatcher {
        Dispatcher::new(
            primary,
            fallback.map(|f| f as Arc<dyn SpeechBackend>),
            Arc::new(Semaphore::new(8)),
            fast_retry(),
        )
    }

    fn policy(ceiling: u32, has_fallback: bool) -> RetryPolicy {
        RetryPolicy::new(&fast_retry(), ceiling, has_fallback)
    }

    // ── next_action ──────────────────────────────────────────────────────────

    #[test]
    fn test_next_action_sequence() {
        let p = policy(4, true);
        let mut s = UnitAttempt::default();
        let mut actions = Vec::new();
        loop {
            s.begin_call();
            let a = next_action(&s, &p);
            actions.push(a);
            match a {
                NextAction::RetryPrimary => {}
                NextAction::TryFallback => s.backend_in_use = BackendRole::Fallback,
                NextAction::GiveUp => break,
            }
        }
        assert_eq!(
            actions,
            vec![NextAction::RetryPrimary, NextAction::RetryPrimary, NextAction::TryFallback, NextAction::GiveUp]
        );
        assert_eq!(s.attempt_count, 4);
        assert_eq!(s.primary_attempts, 3);
    }

    #[test]
    fn test_next_action_without_fallback() {
        let p = policy(2, false);
        let mut s = UnitAttempt::default();
        s.begin_call();
        assert_eq!(next_action(&s, &p), NextAction::RetryPrimary);
        s.begin_call();
        assert_eq!(next_action(&s, &p), NextAction::GiveUp);
    }

    #[test]
    fn test_ceiling_of_one_skips_fallback() {
        let p = policy(1, true);
        assert!(!p.fallback_enabled());
        let mut s = UnitAttempt::default();
        s.begin_call();
        assert_eq!(next_action(&s, &p), NextAction::GiveUp);
    }

    #[test]
    fn test_ceiling_of_two_goes_straight_to_fallback() {
        let p = policy(2, true);
        let mut s = UnitAttempt::default();
        s.begin_call();
        assert_eq!(next_action(&s, &p), NextAction::TryFallback);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(10, false);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(5), Duration::from_millis(1_000));
        assert_eq!(p.backoff(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_threshold_is_strict() {
        let failed = |i| {
            UnitOutcome::Failed(UnitFailure {
                unit_index: i,
                attempts: 1,
                error_kind: ErrorKind::BackendRejected,
                message: String::new(),
            })
        };
        let ok = |i| {
            UnitOutcome::Synthesized(SynthesisResult {
                unit_index: i,
                audio: tone(),
                backend_used: BackendRole::Primary,
                attempt_count: 1,
            })
        };
        let mut report = DispatchReport::default();
        report.outcomes.insert(0, failed(0));
        for i in 1..4 {
            report.outcomes.insert(i, ok(i));
        }
        assert!(report.check_threshold(0.25).is_ok());
        assert!(matches!(
            report.check_threshold(0.2),
            Err(NarrationError::FailureThresholdExceeded { failed: 1, total: 4, .. })
        ));
    }

    // ── dispatch ─────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let primary = Arc::new(ScriptedBackend::new("primary", |_, n| {
            if n < 2 { Err(BackendError::Rejected("503".into())) } else { Ok(tone()) }
        }));
        let report = dispatcher(primary.clone(), None)
            .dispatch(styled(1), 1, 4, &CancellationToken::new())
            .await
            .unwrap();
        match &report.outcomes[&0] {
            UnitOutcome::Synthesized(r) => {
                assert_eq!(r.attempt_count, 3);
                assert_eq!(r.backend_used, BackendRole::Primary);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(primary.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_gets_default_voice() {
        let primary = Arc::new(ScriptedBackend::new("primary", |_, _| Err(BackendError::EmptyAudio)));
        let fallback = Arc::new(ScriptedBackend::new("fallback", |_, _| Ok(tone())));
        let report = dispatcher(primary.clone(), Some(fallback.clone()))
            .dispatch(styled(3), 2, 4, &CancellationToken::new())
            .await
            .unwrap();

        for outcome in report.outcomes.values() {
            let UnitOutcome::Synthesized(r) = outcome else { panic!("unit failed: {outcome:?}") };
            assert_eq!(r.backend_used, BackendRole::Fallback);
            assert_eq!(r.attempt_count, 4);
        }
        assert_eq!(primary.calls(), 9);
        assert_eq!(fallback.calls(), 3);
        assert!(fallback.profiles.lock().unwrap().iter().all(Option::is_none));
        assert!(primary.profiles.lock().unwrap().iter().all(|p| p.as_deref() == Some("Luna")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_backends_fail() {
        let primary = Arc::new(ScriptedBackend::new("primary", |_, _| Err(BackendError::Rejected("400".into()))));
        let fallback = Arc::new(ScriptedBackend::new("fallback", |_, _| Err(BackendError::Rejected("401".into()))));
        let report = dispatcher(primary, Some(fallback))
            .dispatch(styled(2), 2, 3, &CancellationToken::new())
            .await
            .unwrap();
        let failures = report.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].unit_index, 0);
        assert_eq!(failures[0].attempts, 3);
        assert_eq!(failures[0].error_kind, ErrorKind::BackendRejected);
        assert!(failures[0].message.contains("401"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_backend_times_out() {
        let primary = Arc::new(
            ScriptedBackend::new("primary", |_, _| Ok(tone())).with_delay(Duration::from_secs(3_600)),
        );
        let report = dispatcher(primary.clone(), None)
            .dispatch(styled(1), 1, 2, &CancellationToken::new())
            .await
            .unwrap();
        let failures = report.failures();
        assert_eq!(failures[0].error_kind, ErrorKind::BackendTimeout);
        assert_eq!(failures[0].attempts, 2);
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_audio_is_a_failure() {
        let primary = Arc::new(ScriptedBackend::new("primary", |_, n| {
            if n == 0 { Ok(AudioBuffer::silence(1.0, 24_000)) } else { Ok(tone()) }
        }));
        let report = dispatcher(primary, None)
            .dispatch(styled(1), 1, 2, &CancellationToken::new())
            .await
            .unwrap();
        let UnitOutcome::Synthesized(r) = &report.outcomes[&0] else { panic!("expected success") };
        assert_eq!(r.attempt_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_fallback_is_never_called() {
        assert!(policy(1, true).fallback_unreachable());
        assert!(!policy(2, true).fallback_unreachable());
        assert!(!policy(1, false).fallback_unreachable());

        let primary = Arc::new(ScriptedBackend::new("primary", |_, _| Err(BackendError::Rejected("503".into()))));
        let fallback = Arc::new(ScriptedBackend::new("fallback", |_, _| Ok(tone())));
        let report = dispatcher(primary.clone(), Some(fallback.clone()))
            .dispatch(styled(1), 1, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed_count(), 1);
        assert_eq!((primary.calls(), fallback.calls()), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_styleless_primary_gets_no_profile() {
        let primary = Arc::new(ScriptedBackend::new("primary", |_, _| Ok(tone())).without_styles());
        dispatcher(primary.clone(), None)
            .dispatch(styled(2), 2, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*primary.profiles.lock().unwrap(), vec![None, None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_finite_audio_falls_back() {
        let primary = Arc::new(ScriptedBackend::new("primary", |_, _| {
            let mut samples = vec![0.3; 2_400];
            samples[1_200] = f32::NAN;
            Ok(AudioBuffer::new(samples, 24_000))
        }));
        let fallback = Arc::new(ScriptedBackend::new("fallback", |_, _| Ok(tone())));
        let report = dispatcher(primary.clone(), Some(fallback.clone()))
            .dispatch(styled(1), 1, 3, &CancellationToken::new())
            .await
            .unwrap();
        let UnitOutcome::Synthesized(r) = &report.outcomes[&0] else { panic!("NaN audio must not pass as speech") };
        assert_eq!(r.backend_used, BackendRole::Fallback);
        assert!(r.audio.samples.iter().all(|s| s.is_finite()));
        assert_eq!(primary.calls(), 2, "NaN audio is retried on the primary first");
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_is_bounded() {
        let primary = Arc::new(
            ScriptedBackend::new("primary", |_, _| Ok(tone())).with_delay(Duration::from_millis(50)),
        );
        let report = dispatcher(primary.clone(), None)
            .dispatch(styled(10), 3, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.total(), 10);
        assert_eq!(report.outcomes.keys().copied().collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
        let peak = primary.max_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 3 && peak >= 2, "peak in flight {peak}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bounds_across_dispatches() {
        let primary = Arc::new(
            ScriptedBackend::new("primary", |_, _| Ok(tone())).with_delay(Duration::from_millis(50)),
        );
        let shared = Dispatcher::new(primary.clone(), None, Arc::new(Semaphore::new(2)), fast_retry());
        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(
            shared.dispatch(styled(4), 4, 1, &cancel),
            shared.dispatch(styled(4), 4, 1, &cancel),
        );
        assert_eq!(a.unwrap().total(), 4);
        assert_eq!(b.unwrap().total(), 4);
        assert!(primary.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_in_flight_calls() {
        let primary = Arc::new(
            ScriptedBackend::new("primary", |_, _| Ok(tone())).with_delay(Duration::from_secs(10)),
        );
        let d = dispatcher(primary, None);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = d.dispatch(styled(4), 4, 3, &cancel).await;
        assert!(matches!(result, Err(NarrationError::Cancelled)));
    }
}
