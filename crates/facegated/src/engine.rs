//! Scan worker: one OS thread per scan session that owns the camera.
//!
//! Camera access and model inference are blocking, so they live on a
//! dedicated thread. The async session talks to it over a bounded channel
//! with one `oneshot` reply per request, so at most one frame is in flight.

use facegate_core::{Descriptor, FaceAnalyzer, FaceObservation, FrameObservation, LivenessSignal};
use facegate_hw::{CameraError, Frame, FrameSource};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera unavailable: {0}")]
    Camera(#[from] CameraError),
    #[error("face models unavailable: {0}")]
    ModelUnavailable(String),
    #[error("{0}")]
    Analysis(String),
    #[error("no face captured to extract from")]
    NothingToExtract,
    #[error("scan worker exited")]
    ChannelClosed,
    #[error("failed to spawn scan worker: {0}")]
    Spawn(String),
}

enum WorkerRequest {
    Observe {
        reply: oneshot::Sender<Result<FrameObservation, EngineError>>,
    },
    Extract {
        reply: oneshot::Sender<Result<Descriptor, EngineError>>,
    },
}

/// Consecutive mid-stream capture failures tolerated before the camera is
/// treated as gone.
pub const MAX_CAPTURE_FAILURES: u32 = 10;

/// Handle to a scan worker thread. Dropping it stops the worker; prefer
/// [`ScanWorker::shutdown`] to also wait for the camera to be released.
pub struct ScanWorker {
    tx: mpsc::Sender<WorkerRequest>,
    ready: Option<oneshot::Receiver<Result<(), EngineError>>>,
    released: oneshot::Receiver<()>,
}

impl ScanWorker {
    /// Spawn the worker thread. It initializes the analyzer, then opens the
    /// frame source, unless the handle was shut down while models loaded.
    /// The source is opened on the worker thread so it never crosses threads.
    pub fn spawn<S, F, A>(open_source: F, analyzer: Arc<Mutex<A>>, liveness: LivenessSignal) -> Result<Self, EngineError>
    where
        S: FrameSource + 'static,
        F: FnOnce() -> Result<S, CameraError> + Send + 'static,
        A: FaceAnalyzer + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<WorkerRequest>(1);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), EngineError>>();
        let (released_tx, released_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("facegate-scan".into())
            .spawn(move || {
                let init = analyzer
                    .lock()
                    .map_err(|_| EngineError::ModelUnavailable("analyzer lock poisoned".into()))
                    .and_then(|mut a| {
                        a.ensure_initialized()
                            .map_err(|e| EngineError::ModelUnavailable(e.to_string()))
                    });
                if let Err(e) = init {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
                if ready_tx.is_closed() {
                    tracing::debug!("scan abandoned during model initialization; camera not opened");
                    return;
                }

                let source = match open_source() {
                    Ok(source) => source,
                    Err(e) => {
                        let _ = ready_tx.send(Err(EngineError::Camera(e)));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    drop(source);
                    let _ = released_tx.send(());
                    return;
                }

                let mut worker = Worker {
                    source,
                    analyzer,
                    liveness,
                    last: None,
                    capture_failures: 0,
                };
                tracing::debug!("scan worker started");
                while let Some(req) = rx.blocking_recv() {
                    match req {
                        WorkerRequest::Observe { reply } => {
                            let _ = reply.send(worker.observe());
                        }
                        WorkerRequest::Extract { reply } => {
                            let _ = reply.send(worker.extract());
                        }
                    }
                }

                drop(worker);
                let _ = released_tx.send(());
            })
            .map_err(|e| EngineError::Spawn(e.to_string()))?;

        Ok(Self {
            tx,
            ready: Some(ready_rx),
            released: released_rx,
        })
    }

    /// Resolves once the camera is streaming, or with the first failure.
    pub async fn ready(&mut self) -> Result<(), EngineError> {
        let ready = self.ready.take().ok_or(EngineError::ChannelClosed)?;
        ready.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Grab and classify one frame.
    pub async fn observe(&self) -> Result<FrameObservation, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(WorkerRequest::Observe { reply }, rx).await
    }

    /// Descriptor of the face seen in the latest observed frame.
    pub async fn extract(&self) -> Result<Descriptor, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(WorkerRequest::Extract { reply }, rx).await
    }

    async fn request<T>(
        &self,
        req: WorkerRequest,
        rx: oneshot::Receiver<Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        self.tx.send(req).await.map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Stop the worker and wait until the frame source has been dropped.
    /// Waits out an in-progress model initialization.
    pub async fn shutdown(self) {
        drop(self.ready);
        drop(self.tx);
        let _ = self.released.await;
    }
}

/// State owned by the worker thread.
struct Worker<S: FrameSource, A: FaceAnalyzer> {
    source: S,
    analyzer: Arc<Mutex<A>>,
    liveness: LivenessSignal,
    /// Latest frame that contained a face, kept for extraction.
    last: Option<(Frame, FaceObservation)>,
    capture_failures: u32,
}

impl<S: FrameSource, A: FaceAnalyzer> Worker<S, A> {
    fn observe(&mut self) -> Result<FrameObservation, EngineError> {
        self.last = None;
        let frame = match self.source.grab() {
            Ok(frame) => {
                self.capture_failures = 0;
                frame
            }
            Err(e) if !e.is_unavailable() && self.capture_failures < MAX_CAPTURE_FAILURES => {
                self.capture_failures += 1;
                tracing::warn!(error = %e, failures = self.capture_failures, "frame capture failed; treating as no face");
                return Ok(FrameObservation::NoFace);
            }
            Err(e) => return Err(e.into()),
        };

        if frame.is_dark {
            tracing::trace!(seq = frame.sequence, "dark frame");
            return Ok(FrameObservation::NoFace);
        }

        let analyzed = {
            let mut analyzer = self.analyzer.lock().map_err(|_| EngineError::Analysis("analyzer lock poisoned".into()))?;
            analyzer.analyze(&frame.data, frame.width, frame.height)
        };

        match analyzed {
            Ok(Some(face)) => {
                let reading = self.liveness.classify(&face.landmarks);
                tracing::trace!(seq = frame.sequence, ear = reading.ear, open = reading.eyes_open, "face");
                self.last = Some((frame, face));
                Ok(FrameObservation::Face(reading))
            }
            Ok(None) => Ok(FrameObservation::NoFace),
            Err(e) => {
                tracing::warn!(error = %e, seq = frame.sequence, "frame analysis failed; treating as no face");
                Ok(FrameObservation::NoFace)
            }
        }
    }

    fn extract(&mut self) -> Result<Descriptor, EngineError> {
        let (frame, face) = self.last.take().ok_or(EngineError::NothingToExtract)?;
        let mut analyzer = self.analyzer.lock().map_err(|_| EngineError::Analysis("analyzer lock poisoned".into()))?;
        analyzer
            .extract(&frame.data, frame.width, frame.height, &face)
            .map_err(|e| EngineError::Analysis(e.to_string()))
    }
}
