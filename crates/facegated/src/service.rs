//! Daemon operations behind the D-Bus interface: one scan session at a
//! time, registration into the store, and gallery-backed authentication.

use crate::config::Config;
use crate::session::{
    cancel_pair, CancelHandle, CancelToken, NoValidation, ScanMode, ScanObserver, ScanOutcome, ScanRequest, Scanner,
    Validation, Validator,
};
use crate::store::{EnrollmentInfo, Store, StoreError};
use facegate_core::{
    Descriptor, EuclideanMatcher, FaceAnalyzer, MatchResult, Matcher, ScanError, ScanSnapshot,
};
use facegate_hw::{CameraError, FrameSource};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("scan already in progress")]
    Busy,
    #[error("scan cancelled")]
    Cancelled,
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("authentication succeeded without a match record")]
    MissingMatch,
}

/// Opens a fresh frame source for each session.
pub type SourceOpener<S> = Arc<dyn Fn() -> Result<S, CameraError> + Send + Sync>;

/// Result of a successful authentication.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Authenticated {
    pub user: String,
    pub enrollment_id: String,
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub version: &'static str,
    pub camera_device: String,
    pub models_initialized: bool,
    pub enrollments: u64,
    pub scan_active: bool,
    pub match_threshold: f32,
}

/// Shared daemon state. Cheap to clone.
pub struct Service<A, S> {
    scanner: Scanner<A>,
    store: Store,
    config: Arc<Config>,
    open_source: SourceOpener<S>,
    active: Arc<Mutex<Option<CancelHandle>>>,
    latest: Arc<Mutex<Option<ScanSnapshot>>>,
}

impl<A, S> Clone for Service<A, S> {
    fn clone(&self) -> Self {
        Self {
            scanner: self.scanner.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            open_source: self.open_source.clone(),
            active: self.active.clone(),
            latest: self.latest.clone(),
        }
    }
}

impl<A, S> Service<A, S>
where
    A: FaceAnalyzer + 'static,
    S: FrameSource + 'static,
{
    pub fn new(scanner: Scanner<A>, store: Store, config: Config, open_source: SourceOpener<S>) -> Self {
        Self {
            scanner,
            store,
            config: Arc::new(config),
            open_source,
            active: Arc::new(Mutex::new(None)),
            latest: Arc::new(Mutex::new(None)),
        }
    }

    /// Scan and store a descriptor for `user`. Returns the enrollment id.
    pub async fn register(&self, user: &str) -> Result<String, ServiceError> {
        let descriptor = self.scan(ScanMode::Register, &NoValidation).await?;
        let replaced = self.store.get(user).await?.is_some();
        let id = self.store.upsert(user, &descriptor).await?;
        tracing::info!(user, id = %id, replaced, "enrollment stored");
        Ok(id)
    }

    /// Scan and match against every usable enrollment.
    pub async fn authenticate(&self) -> Result<Authenticated, ServiceError> {
        let validator = GalleryValidator {
            store: self.store.clone(),
            matcher: EuclideanMatcher::new(self.config.match_threshold),
            matched: Mutex::new(None),
        };
        self.scan(ScanMode::Authenticate, &validator).await?;

        let result = lock(&validator.matched).take().ok_or(ServiceError::MissingMatch)?;
        match (result.user, result.enrollment_id) {
            (Some(user), Some(enrollment_id)) => Ok(Authenticated {
                user,
                enrollment_id,
                distance: result.distance,
            }),
            _ => Err(ServiceError::MissingMatch),
        }
    }

    /// Cancel the running session, if any.
    pub fn cancel(&self) -> bool {
        match lock(&self.active).as_ref() {
            Some(handle) => handle.cancel(),
            None => false,
        }
    }

    /// Latest snapshot of the current or most recent session.
    pub fn progress(&self) -> Option<ScanSnapshot> {
        lock(&self.latest).clone()
    }

    pub async fn status(&self) -> Result<Status, ServiceError> {
        let enrollments = self.store.count().await?;
        Ok(Status {
            version: env!("CARGO_PKG_VERSION"),
            camera_device: self.config.camera_device.clone(),
            models_initialized: self.scanner.analyzer_ready(),
            enrollments,
            scan_active: lock(&self.active).is_some(),
            match_threshold: self.config.match_threshold,
        })
    }

    pub async fn list(&self) -> Result<Vec<EnrollmentInfo>, ServiceError> {
        Ok(self.store.list().await?)
    }

    pub async fn remove(&self, user: &str) -> Result<bool, ServiceError> {
        let removed = self.store.remove(user).await?;
        tracing::info!(user, removed, "enrollment removal");
        Ok(removed)
    }

    pub async fn set_active(&self, user: &str, active: bool) -> Result<bool, ServiceError> {
        Ok(self.store.set_active(user, active).await?)
    }

    fn request(&self, mode: ScanMode) -> ScanRequest {
        ScanRequest {
            mode,
            max_attempts: self.config.max_attempts,
            scan: self.config.scan_config(),
            frame_interval: self.config.frame_interval(),
            success_delay: self.config.success_delay(),
        }
    }

    async fn scan<V: Validator>(&self, mode: ScanMode, validator: &V) -> Result<Descriptor, ServiceError> {
        let (_guard, token) = self.begin()?;
        let open = self.open_source.clone();
        let mut observer = SnapshotRecorder {
            latest: self.latest.clone(),
        };

        let outcome = self
            .scanner
            .run(move || open(), &self.request(mode), validator, &mut observer, token)
            .await?;
        match outcome {
            ScanOutcome::Captured(descriptor) => Ok(descriptor),
            ScanOutcome::Cancelled => Err(ServiceError::Cancelled),
        }
    }

    /// Claim the camera for one session.
    fn begin(&self) -> Result<(SessionGuard, CancelToken), ServiceError> {
        let mut active = lock(&self.active);
        if active.is_some() {
            return Err(ServiceError::Busy);
        }
        let (handle, token) = cancel_pair();
        *active = Some(handle);
        *lock(&self.latest) = None;
        Ok((
            SessionGuard {
                active: self.active.clone(),
            },
            token,
        ))
    }
}

/// Releases the session slot on drop, including when the caller goes away.
struct SessionGuard {
    active: Arc<Mutex<Option<CancelHandle>>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.active).take() {
            handle.cancel();
        }
    }
}

struct SnapshotRecorder {
    latest: Arc<Mutex<Option<ScanSnapshot>>>,
}

impl ScanObserver for SnapshotRecorder {
    fn on_snapshot(&mut self, snapshot: &ScanSnapshot) {
        *lock(&self.latest) = Some(snapshot.clone());
    }

    fn on_step_complete(&mut self) {
        tracing::debug!("liveness step complete");
    }

    fn on_error(&mut self, error: &ScanError) {
        tracing::info!(error = %error, "scan ended with error");
    }
}

struct GalleryValidator {
    store: Store,
    matcher: EuclideanMatcher,
    matched: Mutex<Option<MatchResult>>,
}

impl Validator for GalleryValidator {
    async fn validate(&self, descriptor: &Descriptor) -> Validation {
        let gallery = match self.store.usable_gallery().await {
            Ok(gallery) => gallery,
            Err(e) => {
                tracing::warn!(error = %e, "could not load enrollments");
                return Validation::error("Enrollment store unavailable");
            }
        };
        if gallery.is_empty() {
            return Validation::not_matched("No enrolled faces");
        }

        let result = self.matcher.compare(descriptor, &gallery);
        tracing::info!(matched = result.matched, distance = result.distance, "gallery comparison");
        let (true, Some(id), Some(user)) = (result.matched, &result.enrollment_id, &result.user) else {
            return Validation::not_matched("Face not recognized");
        };

        if let Err(e) = self.store.touch_last_login(id).await {
            tracing::warn!(error = %e, id = %id, "could not record login time");
        }
        let message = format!("Welcome, {user}");
        *lock(&self.matched) = Some(result);
        Validation::matched(message)
    }
}

/// Poisoning only follows a panic elsewhere; the guarded data stays valid.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_source, FakeAnalyzer, FakeSource};
    use facegate_core::{LivenessSignal, Phase};
    use std::path::Path;

    async fn service(analyzer: FakeAnalyzer) -> Service<FakeAnalyzer, FakeSource> {
        let config = Config {
            frame_rate: 120,
            success_delay_ms: 0,
            ..Config::default()
        };
        let store = Store::open(Path::new(":memory:")).await.unwrap();
        let opener: SourceOpener<FakeSource> = Arc::new(|| Ok(fake_source().0));
        Service::new(Scanner::new(analyzer, LivenessSignal::default()), store, config, opener)
    }

    #[tokio::test]
    async fn test_register_then_authenticate() {
        let service = service(FakeAnalyzer::open_eyes(42)).await;

        let id = service.register("alice").await.unwrap();
        let progress = service.progress().unwrap();
        assert_eq!(progress.phase, Phase::Success);

        let auth = service.authenticate().await.unwrap();
        assert_eq!(auth.user, "alice");
        assert_eq!(auth.enrollment_id, id);
        assert!(auth.distance < 1e-6);

        let info = service.list().await.unwrap();
        assert!(info[0].last_login_at.is_some());
        assert!(!service.status().await.unwrap().scan_active);
    }

    #[tokio::test]
    async fn test_authenticate_without_enrollments_exhausts() {
        let service = service(FakeAnalyzer::open_eyes(63)).await;
        let err = service.authenticate().await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Scan(ScanError::AttemptsExhausted { attempts: 3, .. })
        ));
        assert_eq!(service.progress().unwrap().phase, Phase::Error);
    }

    #[tokio::test]
    async fn test_inactive_user_cannot_authenticate() {
        let service = service(FakeAnalyzer::open_eyes(21 + 63)).await;
        service.register("alice").await.unwrap();
        assert!(service.set_active("alice", false).await.unwrap());
        assert!(service.authenticate().await.is_err());
    }

    #[tokio::test]
    async fn test_single_session_at_a_time() {
        let service = service(FakeAnalyzer::open_eyes(0)).await;
        let (guard, _token) = service.begin().unwrap();
        assert!(matches!(service.begin(), Err(ServiceError::Busy)));
        assert!(service.status().await.unwrap().scan_active);
        assert!(service.cancel());
        drop(guard);
        assert!(!service.cancel());
        assert!(service.begin().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_reports_cancelled() {
        // No face ever appears, so the session only ends by cancellation.
        let service = service(FakeAnalyzer::open_eyes(0)).await;
        let running = service.clone();
        let task = tokio::spawn(async move { running.register("alice").await });

        while !service.cancel() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled));
        assert_eq!(service.store.count().await.unwrap(), 0);
    }
}
