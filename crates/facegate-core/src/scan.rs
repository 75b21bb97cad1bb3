//! Liveness-gated scan state machine.
//!
//! A scan moves through `Detecting -> Capturing -> Validating` and ends in
//! `Success` or `Error`. The per-frame transition is the pure
//! [`ScanState::advance`]; [`ScanMachine`] wraps it with the attempt limiter,
//! the validation verdict, and the status text a UI shows.
//!
//! Counters:
//! - `stable_frames` climbs on open-eye frames while detecting and decays by
//!   `blink_decay` on closed-eye frames, so a blink costs a little progress
//!   instead of all of it.
//! - `hold_frames` climbs while capturing; any closed-eye frame sends the scan
//!   back to the start.
//! - `missed_frames` counts consecutive frames without a face. Progress is
//!   kept until it exceeds `face_loss_tolerance`.

use crate::attempts::{AttemptLimiter, AttemptVerdict, DEFAULT_MAX_ATTEMPTS};
use crate::liveness::LivenessReading;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Open-eye frames needed to leave `Detecting` (about half a second at 30 fps).
pub const DEFAULT_STABLE_FRAMES: u32 = 15;
/// Open-eye frames the hold must exceed before capture.
pub const DEFAULT_HOLD_FRAMES: u32 = 5;
/// Stable-counter penalty for one closed-eye frame while detecting.
pub const DEFAULT_BLINK_DECAY: u32 = 2;
/// Consecutive face-less frames absorbed before progress is discarded.
pub const DEFAULT_FACE_LOSS_TOLERANCE: u32 = 5;
/// Progress shown when the detecting phase completes.
pub const DETECT_PROGRESS_CEILING: u8 = 66;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Detecting,
    Capturing,
    Validating,
    Success,
    Error,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Success | Phase::Error)
    }

    /// Only the two frame-driven phases react to observations.
    pub fn accepts_frames(self) -> bool {
        matches!(self, Phase::Detecting | Phase::Capturing)
    }
}

/// Tunable thresholds. All counts are in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub stable_frames: u32,
    pub hold_frames: u32,
    pub blink_decay: u32,
    pub face_loss_tolerance: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            stable_frames: DEFAULT_STABLE_FRAMES,
            hold_frames: DEFAULT_HOLD_FRAMES,
            blink_decay: DEFAULT_BLINK_DECAY,
            face_loss_tolerance: DEFAULT_FACE_LOSS_TOLERANCE,
        }
    }
}

/// What the detector and liveness signal saw in one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameObservation {
    NoFace,
    Face(LivenessReading),
}

/// Side effects of a single transition that a caller must act on or surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEvent {
    /// Detecting finished; the scan is now holding.
    StepComplete,
    /// Hold finished; extract a descriptor from the current frame.
    CaptureReady,
    /// Eyes closed during the hold; back to detecting.
    HoldBroken,
    /// The face was missing past the tolerance; progress discarded.
    FaceLost,
}

/// Snapshot of the frame-driven counters. Cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanState {
    pub phase: Phase,
    pub stable_frames: u32,
    pub hold_frames: u32,
    pub missed_frames: u32,
    /// 0-100.
    pub progress: u8,
    pub face_present: bool,
    pub eyes_open: bool,
    pub ear: f32,
}

impl Default for ScanState {
    fn default() -> Self {
        Self::initial()
    }
}

impl ScanState {
    pub const fn initial() -> Self {
        Self {
            phase: Phase::Detecting,
            stable_frames: 0,
            hold_frames: 0,
            missed_frames: 0,
            progress: 0,
            face_present: false,
            eyes_open: false,
            ear: 0.0,
        }
    }

    /// Apply one frame observation. Frames are ignored outside the
    /// `Detecting` and `Capturing` phases.
    pub fn advance(self, config: &ScanConfig, observation: FrameObservation) -> (Self, Option<ScanEvent>) {
        if !self.phase.accepts_frames() {
            return (self, None);
        }

        let reading = match observation {
            FrameObservation::NoFace => return self.face_missing(config),
            FrameObservation::Face(reading) => reading,
        };

        let next = Self {
            missed_frames: 0,
            face_present: true,
            eyes_open: reading.eyes_open,
            ear: reading.ear,
            ..self
        };

        match self.phase {
            Phase::Detecting => next.detecting(config),
            _ => next.capturing(config),
        }
    }

    fn face_missing(self, config: &ScanConfig) -> (Self, Option<ScanEvent>) {
        let missed_frames = self.missed_frames.saturating_add(1);
        let has_progress =
            self.phase == Phase::Capturing || self.stable_frames > 0 || self.hold_frames > 0;

        if missed_frames > config.face_loss_tolerance && has_progress {
            let reset = Self {
                missed_frames,
                ..Self::initial()
            };
            return (reset, Some(ScanEvent::FaceLost));
        }

        let next = Self {
            missed_frames,
            face_present: false,
            eyes_open: false,
            ear: 0.0,
            ..self
        };
        (next, None)
    }

    fn detecting(mut self, config: &ScanConfig) -> (Self, Option<ScanEvent>) {
        let target = config.stable_frames.max(1);

        if self.eyes_open {
            self.stable_frames = (self.stable_frames + 1).min(target);
            if self.stable_frames >= target {
                self.phase = Phase::Capturing;
                self.stable_frames = 0;
                self.hold_frames = 0;
                self.progress = DETECT_PROGRESS_CEILING;
                return (self, Some(ScanEvent::StepComplete));
            }
        } else {
            self.stable_frames = self.stable_frames.saturating_sub(config.blink_decay);
        }

        self.progress = scaled(self.stable_frames, target, 0, DETECT_PROGRESS_CEILING);
        (self, None)
    }

    fn capturing(mut self, config: &ScanConfig) -> (Self, Option<ScanEvent>) {
        if !self.eyes_open {
            let reset = Self {
                face_present: true,
                ear: self.ear,
                ..Self::initial()
            };
            return (reset, Some(ScanEvent::HoldBroken));
        }

        self.hold_frames = self.hold_frames.saturating_add(1);
        if self.hold_frames > config.hold_frames {
            self.phase = Phase::Validating;
            self.progress = 100;
            return (self, Some(ScanEvent::CaptureReady));
        }

        self.progress = scaled(
            self.hold_frames,
            config.hold_frames.saturating_add(1),
            DETECT_PROGRESS_CEILING,
            100,
        );
        (self, None)
    }
}

/// Linear map of `count / total` onto `[floor, ceiling]`, clamped.
fn scaled(count: u32, total: u32, floor: u8, ceiling: u8) -> u8 {
    let span = u64::from(ceiling - floor);
    let step = (u64::from(count.min(total)) * span) / u64::from(total.max(1));
    floor + step as u8
}

/// Why a capture cycle failed. Both kinds are retryable and counted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error("could not read your face: {0}")]
    ExtractionFailed(String),
    #[error("{0}")]
    MatchRejected(String),
}

/// Terminal failures of a scan session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("face models unavailable: {0}")]
    ModelUnavailable(String),
    #[error("too many failed attempts ({attempts}): {last_reason}")]
    AttemptsExhausted { attempts: u32, last_reason: String },
    #[error("scan worker stopped unexpectedly")]
    WorkerGone,
}

/// Verdict of the validating phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Accepted,
    Rejected(FailureReason),
}

/// Result of resolving the validating phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Succeeded,
    Retry { reason: FailureReason, remaining: u32 },
    Exhausted { reason: FailureReason, attempts: u32 },
    /// The machine was not validating; nothing changed.
    Ignored,
}

/// UI-observable signals of a scan session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSnapshot {
    pub phase: Phase,
    pub progress: u8,
    pub face_detected: bool,
    pub is_live: bool,
    pub ear: f32,
    pub message: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub remaining_attempts: u32,
    pub last_failure: Option<String>,
}

/// One scan session's state: counters, attempt bookkeeping, and status text.
#[derive(Debug, Clone)]
pub struct ScanMachine {
    config: ScanConfig,
    state: ScanState,
    limiter: AttemptLimiter,
    message: String,
    last_failure: Option<String>,
}

impl Default for ScanMachine {
    fn default() -> Self {
        Self::new(ScanConfig::default(), DEFAULT_MAX_ATTEMPTS)
    }
}

impl ScanMachine {
    pub fn new(config: ScanConfig, max_attempts: u32) -> Self {
        let state = ScanState::initial();
        Self {
            config,
            message: status_message(&state, None).to_string(),
            state,
            limiter: AttemptLimiter::new(max_attempts),
            last_failure: None,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn limiter(&self) -> &AttemptLimiter {
        &self.limiter
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Feed one frame observation.
    pub fn observe(&mut self, observation: FrameObservation) -> Option<ScanEvent> {
        if !self.state.phase.accepts_frames() {
            return None;
        }

        let from = self.state.phase;
        let (next, event) = self.state.advance(&self.config, observation);
        self.state = next;
        self.message = status_message(&self.state, event).to_string();

        if let Some(event) = event {
            tracing::debug!(
                ?event,
                ?from,
                to = ?self.state.phase,
                progress = self.state.progress,
                "scan transition"
            );
        }
        event
    }

    /// Settle the validating phase.
    pub fn resolve(&mut self, outcome: ValidationOutcome) -> Resolution {
        if self.state.phase != Phase::Validating {
            tracing::warn!(phase = ?self.state.phase, "validation result outside validating phase");
            return Resolution::Ignored;
        }

        let reason = match outcome {
            ValidationOutcome::Accepted => {
                self.state.phase = Phase::Success;
                self.state.progress = 100;
                self.message = "Face verified".to_string();
                return Resolution::Succeeded;
            }
            ValidationOutcome::Rejected(reason) => reason,
        };

        self.last_failure = Some(reason.to_string());
        match self.limiter.record_failure() {
            AttemptVerdict::Retry { remaining } => {
                self.state = ScanState::initial();
                self.message = format!("{reason}. {remaining} attempt(s) remaining");
                Resolution::Retry { reason, remaining }
            }
            AttemptVerdict::Exhausted => {
                self.state.phase = Phase::Error;
                self.message = "Too many failed attempts".to_string();
                Resolution::Exhausted {
                    attempts: self.limiter.failures(),
                    reason,
                }
            }
        }
    }

    /// Force the terminal error phase (camera or model failure, worker loss).
    pub fn fail_terminal(&mut self, reason: impl Into<String>) {
        self.state.phase = Phase::Error;
        self.message = reason.into();
    }

    pub fn snapshot(&self) -> ScanSnapshot {
        ScanSnapshot {
            phase: self.state.phase,
            progress: self.state.progress.min(100),
            face_detected: self.state.face_present,
            is_live: self.state.eyes_open,
            ear: self.state.ear,
            message: self.message.clone(),
            attempts: self.limiter.failures(),
            max_attempts: self.limiter.max(),
            remaining_attempts: self.limiter.remaining(),
            last_failure: self.last_failure.clone(),
        }
    }
}

fn status_message(state: &ScanState, event: Option<ScanEvent>) -> &'static str {
    match event {
        Some(ScanEvent::FaceLost) => return "Face lost, starting over",
        Some(ScanEvent::HoldBroken) => return "Eyes closed, starting over",
        Some(ScanEvent::StepComplete) => return "Good, hold still",
        Some(ScanEvent::CaptureReady) => return "Verifying",
        None => {}
    }
    match state.phase {
        Phase::Detecting if !state.face_present => "Position your face in the frame",
        Phase::Detecting if !state.eyes_open => "Open your eyes and look at the camera",
        Phase::Detecting => "Keep your eyes open",
        Phase::Capturing if !state.face_present => "Face not detected",
        Phase::Capturing => "Hold still",
        Phase::Validating => "Verifying",
        Phase::Success => "Face verified",
        Phase::Error => "Scan failed",
    }
}
