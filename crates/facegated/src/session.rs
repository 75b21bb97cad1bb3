//! Async scan session: ticks the scan worker, drives the state machine, and
//! reports to the caller through [`ScanObserver`] callbacks.
//!
//! The session never touches enrollment storage. Authentication delegates the
//! match decision to an injected [`Validator`]; registration accepts any
//! extracted descriptor.

use crate::engine::{EngineError, ScanWorker};
use facegate_core::{
    Descriptor, FaceAnalyzer, FailureReason, FrameObservation, LivenessSignal, Resolution, ScanConfig,
    ScanError, ScanEvent, ScanMachine, ScanSnapshot, ValidationOutcome,
};
use facegate_hw::{CameraError, FrameSource};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Register,
    Authenticate,
}

/// Parameters of one scan session.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub mode: ScanMode,
    pub max_attempts: u32,
    pub scan: ScanConfig,
    /// Minimum spacing of frame ticks.
    pub frame_interval: Duration,
    /// Pause between success and handing back the descriptor.
    pub success_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationKind {
    Matched,
    NotMatched,
    Error,
}

/// The caller's verdict on a captured descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub kind: ValidationKind,
    pub message: String,
}

impl Validation {
    pub fn matched(message: impl Into<String>) -> Self {
        Self {
            kind: ValidationKind::Matched,
            message: message.into(),
        }
    }

    pub fn not_matched(message: impl Into<String>) -> Self {
        Self {
            kind: ValidationKind::NotMatched,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ValidationKind::Error,
            message: message.into(),
        }
    }

    fn into_outcome(self) -> ValidationOutcome {
        match self.kind {
            ValidationKind::Matched => ValidationOutcome::Accepted,
            ValidationKind::NotMatched if self.message.is_empty() => {
                ValidationOutcome::Rejected(FailureReason::MatchRejected("Face not recognized".into()))
            }
            ValidationKind::NotMatched | ValidationKind::Error => {
                ValidationOutcome::Rejected(FailureReason::MatchRejected(self.message))
            }
        }
    }
}

/// Decides whether a captured descriptor authenticates.
pub trait Validator: Send + Sync {
    fn validate(&self, descriptor: &Descriptor) -> impl Future<Output = Validation> + Send;
}

/// Validator for sessions that never consult one (registration).
pub struct NoValidation;

impl Validator for NoValidation {
    async fn validate(&self, _descriptor: &Descriptor) -> Validation {
        Validation::matched("")
    }
}

/// UI-facing callbacks. All default to no-ops.
pub trait ScanObserver: Send {
    fn on_snapshot(&mut self, _snapshot: &ScanSnapshot) {}
    fn on_step_complete(&mut self) {}
    fn on_success(&mut self, _descriptor: &Descriptor) {}
    fn on_error(&mut self, _error: &ScanError) {}
    fn on_cancel(&mut self) {}
}

impl ScanObserver for () {}

/// Requests cancellation of a running session.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

/// Session side of a [`CancelHandle`].
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(Arc::new(tx)), CancelToken(rx))
}

impl CancelHandle {
    /// Returns false when the session was already cancelled.
    pub fn cancel(&self) -> bool {
        !self.0.send_replace(true)
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancelled; never resolves if the handle is dropped uncancelled.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|&c| c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Captured(Descriptor),
    Cancelled,
}

/// Runs scan sessions against one shared analyzer.
pub struct Scanner<A> {
    analyzer: Arc<Mutex<A>>,
    liveness: LivenessSignal,
    /// Last observed initialization state, for readers that cannot wait.
    ready: Arc<AtomicBool>,
}

impl<A> Clone for Scanner<A> {
    fn clone(&self) -> Self {
        Self {
            analyzer: self.analyzer.clone(),
            liveness: self.liveness,
            ready: self.ready.clone(),
        }
    }
}

impl<A: FaceAnalyzer + 'static> Scanner<A> {
    pub fn new(analyzer: A, liveness: LivenessSignal) -> Self {
        let ready = Arc::new(AtomicBool::new(analyzer.is_initialized()));
        Self {
            analyzer: Arc::new(Mutex::new(analyzer)),
            liveness,
            ready,
        }
    }

    /// Whether the face models are loaded. Never blocks: while a worker holds
    /// the analyzer, the last observed state is returned.
    pub fn analyzer_ready(&self) -> bool {
        match self.analyzer.try_lock() {
            Ok(analyzer) => {
                let ready = analyzer.is_initialized();
                self.ready.store(ready, Ordering::Relaxed);
                ready
            }
            Err(TryLockError::WouldBlock) => self.ready.load(Ordering::Relaxed),
            Err(TryLockError::Poisoned(_)) => false,
        }
    }

    /// Run one session to completion.
    ///
    /// The camera is acquired after the models are ready and released on
    /// every exit path before any terminal callback fires.
    pub async fn run<S, F, V, O>(
        &self,
        open_source: F,
        request: &ScanRequest,
        validator: &V,
        observer: &mut O,
        mut cancel: CancelToken,
    ) -> Result<ScanOutcome, ScanError>
    where
        S: FrameSource + 'static,
        F: FnOnce() -> Result<S, CameraError> + Send + 'static,
        V: Validator,
        O: ScanObserver,
    {
        if cancel.is_cancelled() {
            observer.on_cancel();
            return Ok(ScanOutcome::Cancelled);
        }
        let mut machine = ScanMachine::new(request.scan, request.max_attempts);
        tracing::info!(mode = ?request.mode, max_attempts = request.max_attempts, "scan session starting");

        let started = match ScanWorker::spawn(open_source, self.analyzer.clone(), self.liveness) {
            Ok(mut worker) => {
                let ready = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    ready = worker.ready() => Some(ready),
                };
                match ready {
                    None => {
                        // The worker skips the camera once it sees the handle gone.
                        worker.shutdown().await;
                        tracing::info!("scan cancelled before camera acquisition");
                        observer.on_cancel();
                        return Ok(ScanOutcome::Cancelled);
                    }
                    Some(Ok(())) => Ok(worker),
                    Some(Err(e)) => {
                        worker.shutdown().await;
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        };
        let worker = match started {
            Ok(worker) => worker,
            Err(e) => {
                let error = terminal_error(e);
                machine.fail_terminal(error.to_string());
                observer.on_snapshot(&machine.snapshot());
                tracing::warn!(error = %error, "scan session could not start");
                observer.on_error(&error);
                return Err(error);
            }
        };
        self.ready.store(true, Ordering::Relaxed);
        observer.on_snapshot(&machine.snapshot());

        let result = drive(&worker, &mut machine, request, validator, observer, &mut cancel).await;
        worker.shutdown().await;

        match &result {
            Ok(ScanOutcome::Captured(descriptor)) => {
                tracing::info!(attempts = machine.limiter().failures(), "scan session succeeded");
                tokio::time::sleep(request.success_delay).await;
                observer.on_success(descriptor);
            }
            Ok(ScanOutcome::Cancelled) => {
                tracing::info!(phase = ?machine.phase(), "scan session cancelled");
                observer.on_cancel();
            }
            Err(error) => {
                if !machine.phase().is_terminal() {
                    machine.fail_terminal(error.to_string());
                    observer.on_snapshot(&machine.snapshot());
                }
                tracing::warn!(error = %error, "scan session failed");
                observer.on_error(error);
            }
        }
        result
    }
}

/// The per-frame loop. Returns with the worker still running; the caller
/// shuts it down.
async fn drive<V: Validator, O: ScanObserver>(
    worker: &ScanWorker,
    machine: &mut ScanMachine,
    request: &ScanRequest,
    validator: &V,
    observer: &mut O,
    cancel: &mut CancelToken,
) -> Result<ScanOutcome, ScanError> {
    let mut ticker = tokio::time::interval(request.frame_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let observation = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ScanOutcome::Cancelled),
            observation = next_observation(&mut ticker, worker) => observation,
        };
        let event = machine.observe(observation.map_err(terminal_error)?);
        if event == Some(ScanEvent::StepComplete) {
            observer.on_step_complete();
        }
        observer.on_snapshot(&machine.snapshot());
        if event != Some(ScanEvent::CaptureReady) {
            continue;
        }

        let validated = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(ScanOutcome::Cancelled),
            validated = validate(worker, request.mode, validator) => validated?,
        };
        let (outcome, descriptor) = validated;

        match machine.resolve(outcome) {
            Resolution::Succeeded => {
                observer.on_snapshot(&machine.snapshot());
                if let Some(descriptor) = descriptor {
                    return Ok(ScanOutcome::Captured(descriptor));
                }
                return Err(ScanError::WorkerGone);
            }
            Resolution::Retry { reason, remaining } => {
                tracing::info!(%reason, remaining, "capture rejected; retrying");
                observer.on_snapshot(&machine.snapshot());
                ticker.reset();
            }
            Resolution::Exhausted { reason, attempts } => {
                observer.on_snapshot(&machine.snapshot());
                return Err(ScanError::AttemptsExhausted {
                    attempts,
                    last_reason: reason.to_string(),
                });
            }
            Resolution::Ignored => {}
        }
    }
}

async fn next_observation(
    ticker: &mut tokio::time::Interval,
    worker: &ScanWorker,
) -> Result<FrameObservation, EngineError> {
    ticker.tick().await;
    worker.observe().await
}

/// Extract a descriptor and decide on it. Extraction failures are ordinary
/// rejections; only a vanished worker is terminal.
async fn validate<V: Validator>(
    worker: &ScanWorker,
    mode: ScanMode,
    validator: &V,
) -> Result<(ValidationOutcome, Option<Descriptor>), ScanError> {
    let descriptor = match worker.extract().await {
        Ok(descriptor) => descriptor,
        Err(EngineError::ChannelClosed) => return Err(ScanError::WorkerGone),
        Err(e) => {
            tracing::warn!(error = %e, "descriptor extraction failed");
            let reason = FailureReason::ExtractionFailed(e.to_string());
            return Ok((ValidationOutcome::Rejected(reason), None));
        }
    };

    let outcome = match mode {
        ScanMode::Register => ValidationOutcome::Accepted,
        ScanMode::Authenticate => {
            let verdict = validator.validate(&descriptor).await;
            tracing::debug!(kind = ?verdict.kind, message = %verdict.message, "validation verdict");
            verdict.into_outcome()
        }
    };
    Ok((outcome, Some(descriptor)))
}

fn terminal_error(e: EngineError) -> ScanError {
    match e {
        EngineError::Camera(e) => ScanError::CameraUnavailable(e.to_string()),
        EngineError::ModelUnavailable(msg) => ScanError::ModelUnavailable(msg),
        EngineError::ChannelClosed | EngineError::Spawn(_) => ScanError::WorkerGone,
        EngineError::Analysis(_) | EngineError::NothingToExtract => ScanError::WorkerGone,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_source, FakeAnalyzer, FakeSource, SourceTracker};
    use facegate_core::Phase;
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;

    /// Records every callback.
    #[derive(Default)]
    struct Recorder {
        snapshots: Vec<ScanSnapshot>,
        steps: usize,
        success: Option<Descriptor>,
        error: Option<ScanError>,
        cancelled: bool,
        /// Camera state observed when `on_success` fired.
        released_at_success: Option<bool>,
        tracker: Option<SourceTracker>,
        cancel_after: Option<(usize, CancelHandle)>,
    }

    impl ScanObserver for Recorder {
        fn on_snapshot(&mut self, snapshot: &ScanSnapshot) {
            self.snapshots.push(snapshot.clone());
            if let Some((n, handle)) = &self.cancel_after {
                if self.snapshots.len() >= *n {
                    handle.cancel();
                }
            }
        }
        fn on_step_complete(&mut self) {
            self.steps += 1;
        }
        fn on_success(&mut self, descriptor: &Descriptor) {
            self.released_at_success = self.tracker.as_ref().map(|p| p.released.load(Ordering::SeqCst));
            self.success = Some(descriptor.clone());
        }
        fn on_error(&mut self, error: &ScanError) {
            self.error = Some(error.clone());
        }
        fn on_cancel(&mut self) {
            self.cancelled = true;
        }
    }

    impl Recorder {
        fn phases(&self) -> Vec<Phase> {
            self.snapshots.iter().map(|s| s.phase).collect()
        }
    }

    struct ScriptedValidator {
        verdicts: Mutex<VecDeque<ValidationKind>>,
        calls: Mutex<usize>,
    }

    impl ScriptedValidator {
        fn new(verdicts: impl IntoIterator<Item = ValidationKind>) -> Self {
            Self {
                verdicts: Mutex::new(verdicts.into_iter().collect()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl Validator for ScriptedValidator {
        async fn validate(&self, _descriptor: &Descriptor) -> Validation {
            *self.calls.lock().unwrap() += 1;
            let kind = self.verdicts.lock().unwrap().pop_front().unwrap_or(ValidationKind::NotMatched);
            match kind {
                ValidationKind::Matched => Validation::matched("welcome"),
                ValidationKind::NotMatched => Validation::not_matched("Face not recognized"),
                ValidationKind::Error => Validation::error("gallery unavailable"),
            }
        }
    }

    fn request(mode: ScanMode) -> ScanRequest {
        ScanRequest {
            mode,
            max_attempts: facegate_core::attempts::DEFAULT_MAX_ATTEMPTS,
            scan: ScanConfig::default(),
            frame_interval: Duration::from_millis(1),
            success_delay: Duration::ZERO,
        }
    }

    fn source() -> (impl FnOnce() -> Result<FakeSource, CameraError> + Send + 'static, SourceTracker) {
        let (source, tracker) = fake_source();
        (move || Ok(source), tracker)
    }

    #[tokio::test]
    async fn test_registration_success() {
        let scanner = Scanner::new(FakeAnalyzer::open_eyes(21), LivenessSignal::default());
        let (open, tracker) = source();
        let mut rec = Recorder {
            tracker: Some(tracker.clone()),
            ..Default::default()
        };
        let (_handle, token) = cancel_pair();

        let outcome = scanner
            .run(open, &request(ScanMode::Register), &NoValidation, &mut rec, token)
            .await
            .unwrap();

        let ScanOutcome::Captured(descriptor) = outcome else {
            panic!("expected a descriptor");
        };
        assert_eq!(descriptor.values, FakeAnalyzer::DESCRIPTOR.to_vec());
        assert_eq!(rec.success, Some(descriptor));
        assert_eq!(rec.steps, 1);
        assert_eq!(tracker.grabs.load(Ordering::SeqCst), 21);
        assert_eq!(rec.released_at_success, Some(true));

        let phases = rec.phases();
        // initial snapshot + one per frame + the resolution
        assert_eq!(phases.len(), 23);
        assert_eq!(phases[15], Phase::Capturing);
        assert_eq!(phases[14], Phase::Detecting);
        assert_eq!(phases[21], Phase::Validating);
        assert_eq!(*phases.last().unwrap(), Phase::Success);
        assert_eq!(rec.snapshots.last().unwrap().progress, 100);
    }

    #[tokio::test]
    async fn test_authentication_rejection_then_success() {
        let scanner = Scanner::new(FakeAnalyzer::open_eyes(42), LivenessSignal::default());
        let validator = ScriptedValidator::new([ValidationKind::NotMatched, ValidationKind::Matched]);
        let (open, tracker) = source();
        let mut rec = Recorder::default();
        let (_handle, token) = cancel_pair();

        let outcome = scanner
            .run(open, &request(ScanMode::Authenticate), &validator, &mut rec, token)
            .await
            .unwrap();

        assert!(matches!(outcome, ScanOutcome::Captured(_)));
        assert_eq!(validator.calls(), 2);
        assert_eq!(tracker.grabs.load(Ordering::SeqCst), 42);

        let retry = rec
            .snapshots
            .iter()
            .find(|s| s.attempts == 1)
            .expect("a retry snapshot");
        assert_eq!(retry.phase, Phase::Detecting);
        assert_eq!(retry.remaining_attempts, 2);
        assert_eq!(retry.last_failure.as_deref(), Some("Face not recognized"));
        assert_eq!(rec.snapshots.last().unwrap().phase, Phase::Success);
        assert!(rec.error.is_none());
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        // More open-eye frames than three cycles need.
        let scanner = Scanner::new(FakeAnalyzer::open_eyes(100), LivenessSignal::default());
        let validator = ScriptedValidator::new([]);
        let (open, tracker) = source();
        let mut rec = Recorder::default();
        let (_handle, token) = cancel_pair();

        let err = scanner
            .run(open, &request(ScanMode::Authenticate), &validator, &mut rec, token)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ScanError::AttemptsExhausted {
                attempts: 3,
                last_reason: "Face not recognized".into()
            }
        );
        assert_eq!(rec.error, Some(err));
        assert_eq!(validator.calls(), 3);
        assert!(tracker.released.load(Ordering::SeqCst));
        // no frames after the third rejection
        assert_eq!(tracker.grabs.load(Ordering::SeqCst), 63);
        assert_eq!(rec.snapshots.last().unwrap().phase, Phase::Error);
        assert!(rec.success.is_none());
    }

    #[tokio::test]
    async fn test_camera_denied() {
        let scanner = Scanner::new(FakeAnalyzer::open_eyes(21), LivenessSignal::default());
        let mut rec = Recorder::default();
        let (_handle, token) = cancel_pair();

        let err = scanner
            .run(
                || Err::<FakeSource, _>(CameraError::PermissionDenied("/dev/video0".into())),
                &request(ScanMode::Register),
                &NoValidation,
                &mut rec,
                token,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::CameraUnavailable(_)));
        assert_eq!(rec.error, Some(err));
        assert!(!rec.phases().contains(&Phase::Detecting));
        assert_eq!(rec.phases(), vec![Phase::Error]);
    }

    #[tokio::test]
    async fn test_model_failure_is_terminal() {
        let scanner = Scanner::new(FakeAnalyzer::open_eyes(21).failing_init(), LivenessSignal::default());
        let (open, tracker) = source();
        let mut rec = Recorder::default();
        let (_handle, token) = cancel_pair();

        let err = scanner
            .run(open, &request(ScanMode::Register), &NoValidation, &mut rec, token)
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::ModelUnavailable(_)));
        assert_eq!(tracker.grabs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_extraction_failure_counts_as_attempt() {
        let scanner = Scanner::new(FakeAnalyzer::open_eyes(63).failing_extract(), LivenessSignal::default());
        let (open, _tracker) = source();
        let mut rec = Recorder::default();
        let (_handle, token) = cancel_pair();

        let err = scanner
            .run(open, &request(ScanMode::Register), &NoValidation, &mut rec, token)
            .await
            .unwrap_err();

        let ScanError::AttemptsExhausted { attempts, last_reason } = err else {
            panic!("expected exhaustion, got {err:?}");
        };
        assert_eq!(attempts, 3);
        assert!(last_reason.starts_with("could not read your face"), "{last_reason}");
    }

    #[tokio::test]
    async fn test_validator_error_is_retryable() {
        let scanner = Scanner::new(FakeAnalyzer::open_eyes(42), LivenessSignal::default());
        let validator = ScriptedValidator::new([ValidationKind::Error, ValidationKind::Matched]);
        let (open, _tracker) = source();
        let mut rec = Recorder::default();
        let (_handle, token) = cancel_pair();

        let outcome = scanner
            .run(open, &request(ScanMode::Authenticate), &validator, &mut rec, token)
            .await
            .unwrap();
        assert!(matches!(outcome, ScanOutcome::Captured(_)));
        assert!(rec.snapshots.iter().any(|s| s.last_failure.as_deref() == Some("gallery unavailable")));
    }

    #[tokio::test]
    async fn test_cancel_mid_scan_releases_camera() {
        let scanner = Scanner::new(FakeAnalyzer::open_eyes(100), LivenessSignal::default());
        let (open, tracker) = source();
        let (handle, token) = cancel_pair();
        let mut rec = Recorder {
            cancel_after: Some((5, handle.clone())),
            ..Default::default()
        };

        let outcome = scanner
            .run(open, &request(ScanMode::Register), &NoValidation, &mut rec, token)
            .await
            .unwrap();

        assert_eq!(outcome, ScanOutcome::Cancelled);
        assert!(rec.cancelled);
        assert!(rec.success.is_none() && rec.error.is_none());
        assert!(tracker.released.load(Ordering::SeqCst));
        assert_eq!(tracker.grabs.load(Ordering::SeqCst), 4);
        assert!(!handle.cancel());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let scanner = Scanner::new(FakeAnalyzer::open_eyes(21), LivenessSignal::default());
        let (open, tracker) = source();
        let (handle, token) = cancel_pair();
        assert!(handle.cancel());
        let mut rec = Recorder::default();

        let outcome = scanner
            .run(open, &request(ScanMode::Register), &NoValidation, &mut rec, token)
            .await
            .unwrap();

        assert_eq!(outcome, ScanOutcome::Cancelled);
        assert!(rec.cancelled);
        assert!(rec.snapshots.is_empty());
        assert_eq!(tracker.grabs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_models_load_never_opens_camera() {
        let scanner = Scanner::new(
            FakeAnalyzer::open_eyes(21).slow_init(Duration::from_millis(300)),
            LivenessSignal::default(),
        );
        let (source, tracker) = fake_source();
        let opened = tracker.opened.clone();
        let open = move || {
            opened.store(true, Ordering::SeqCst);
            Ok(source)
        };
        let (handle, token) = cancel_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });
        let mut rec = Recorder::default();

        let outcome = scanner
            .run(open, &request(ScanMode::Register), &NoValidation, &mut rec, token)
            .await
            .unwrap();

        assert_eq!(outcome, ScanOutcome::Cancelled);
        assert!(rec.cancelled);
        assert!(!tracker.opened.load(Ordering::SeqCst));
        assert_eq!(tracker.grabs.load(Ordering::SeqCst), 0);
        assert!(scanner.analyzer_ready());
    }

    #[tokio::test]
    async fn test_transient_capture_failure_is_tolerated() {
        let scanner = Scanner::new(FakeAnalyzer::open_eyes(21), LivenessSignal::default());
        let (source, tracker) = fake_source();
        let source = source.failing_once_at(5);
        let mut rec = Recorder::default();
        let (_handle, token) = cancel_pair();

        let outcome = scanner
            .run(move || Ok(source), &request(ScanMode::Register), &NoValidation, &mut rec, token)
            .await
            .unwrap();

        assert!(matches!(outcome, ScanOutcome::Captured(_)));
        assert!(rec.error.is_none());
        assert_eq!(tracker.grabs.load(Ordering::SeqCst), 22);
        assert!(tracker.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_persistent_capture_failure_ends_scan() {
        let scanner = Scanner::new(FakeAnalyzer::open_eyes(100), LivenessSignal::default());
        let (source, tracker) = fake_source();
        let source = source.failing_after(3);
        let mut rec = Recorder::default();
        let (_handle, token) = cancel_pair();

        let err = scanner
            .run(move || Ok(source), &request(ScanMode::Register), &NoValidation, &mut rec, token)
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::CameraUnavailable(_)), "{err:?}");
        assert_eq!(rec.error, Some(err));
        let expected = 3 + crate::engine::MAX_CAPTURE_FAILURES as usize + 1;
        assert_eq!(tracker.grabs.load(Ordering::SeqCst), expected);
        assert!(tracker.released.load(Ordering::SeqCst));
        let last = rec.snapshots.last().unwrap();
        assert_eq!(last.phase, Phase::Error);
        assert_eq!(last.attempts, 0);
    }

    #[tokio::test]
    async fn test_analyzer_ready_does_not_wait_for_busy_analyzer() {
        let scanner = Scanner::new(FakeAnalyzer::open_eyes(21), LivenessSignal::default());
        assert!(!scanner.analyzer_ready());

        let (open, _tracker) = source();
        let (_handle, token) = cancel_pair();
        scanner
            .run(open, &request(ScanMode::Register), &NoValidation, &mut (), token)
            .await
            .unwrap();

        let held = scanner.analyzer.lock().unwrap();
        assert!(scanner.analyzer_ready());
        drop(held);
        assert!(scanner.analyzer_ready());
    }

    #[tokio::test]
    async fn test_analyzer_shared_across_sessions() {
        let scanner = Scanner::new(FakeAnalyzer::open_eyes(42), LivenessSignal::default());
        for _ in 0..2 {
            let (open, _tracker) = source();
            let (_handle, token) = cancel_pair();
            scanner
                .run(open, &request(ScanMode::Register), &NoValidation, &mut (), token)
                .await
                .unwrap();
        }
        let analyzer = scanner.analyzer.lock().unwrap();
        assert!(analyzer.is_initialized());
        assert_eq!(analyzer.init_calls, 2);
        assert_eq!(analyzer.remaining(), 0);
    }

    #[test]
    fn test_validation_mapping() {
        assert_eq!(Validation::matched("ok").into_outcome(), ValidationOutcome::Accepted);
        assert_eq!(
            Validation::not_matched("").into_outcome(),
            ValidationOutcome::Rejected(FailureReason::MatchRejected("Face not recognized".into()))
        );
        assert_eq!(
            Validation::error("db down").into_outcome(),
            ValidationOutcome::Rejected(FailureReason::MatchRejected("db down".into()))
        );
    }
}
