use knowyou_core::reference::PhotoLoader;
use knowyou_core::{build_reference_set, AnalyzerError, Dataset, DetectedFace, FaceAnalyzer, ReferenceBuild};
use knowyou_hw::{CameraError, Frame, FrameSource};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// One captured frame and the faces found in it.
pub struct Detection {
    pub frame: Frame,
    pub faces: Vec<DetectedFace>,
}

/// Messages sent from async tasks to the engine thread.
enum EngineRequest {
    Detect {
        reply: oneshot::Sender<Result<Detection, EngineError>>,
    },
    BuildReferences {
        dataset: Dataset,
        loader: Box<dyn PhotoLoader>,
        reply: oneshot::Sender<ReferenceBuild>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Capture a frame and detect every face in it.
    pub async fn detect(&self) -> Result<Detection, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Detect { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Describe every dataset photo with the engine's analyzer.
    pub async fn build_references(
        &self,
        dataset: Dataset,
        loader: Box<dyn PhotoLoader>,
    ) -> Result<ReferenceBuild, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::BuildReferences {
                dataset,
                loader,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// The engine thread: sole owner of the frame source and the analyzer.
///
/// The thread exits once every [`EngineHandle`] is gone, dropping the
/// source and with it the camera.
pub struct Engine {
    handle: EngineHandle,
    thread: std::thread::JoinHandle<()>,
    resolution: (u32, u32),
}

impl Engine {
    /// Discard warmup frames, then start the request loop on a dedicated
    /// OS thread. Blocks until warmup is over; a capture failure during
    /// warmup means the stream never started and is returned.
    pub fn spawn(
        mut source: Box<dyn FrameSource>,
        mut analyzer: Box<dyn FaceAnalyzer>,
        warmup_frames: usize,
    ) -> Result<Self, EngineError> {
        if warmup_frames > 0 {
            tracing::info!(count = warmup_frames, "discarding warmup frames");
            for _ in 0..warmup_frames {
                source.next_frame()?;
            }
        }
        let resolution = source.resolution();

        let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

        let thread = std::thread::Builder::new()
            .name("knowyou-engine".into())
            .spawn(move || {
                tracing::info!("engine thread started");
                while let Some(req) = rx.blocking_recv() {
                    match req {
                        EngineRequest::Detect { reply } => {
                            // The caller timed out or was cancelled while queued.
                            if reply.is_closed() {
                                tracing::debug!("skipping abandoned detect request");
                                continue;
                            }
                            let _ = reply.send(run_detect(source.as_mut(), analyzer.as_mut()));
                        }
                        EngineRequest::BuildReferences {
                            dataset,
                            loader,
                            reply,
                        } => {
                            let build = build_reference_set(&dataset, analyzer.as_mut(), loader.as_ref());
                            let _ = reply.send(build);
                        }
                    }
                }
                tracing::info!("engine thread exiting");
            })
            .map_err(EngineError::Spawn)?;

        Ok(Self {
            handle: EngineHandle { tx },
            thread,
            resolution,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// (width, height) of frames from the source.
    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    /// Drop this handle and wait for the thread to exit. Returns once all
    /// other handles are gone too.
    pub async fn shutdown(self) {
        let Engine { handle, thread, .. } = self;
        drop(handle);
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => tracing::info!("engine stopped"),
            Ok(Err(_)) => tracing::error!("engine thread panicked"),
            Err(e) => tracing::error!(error = %e, "failed to join engine thread"),
        }
    }
}

fn run_detect(source: &mut dyn FrameSource, analyzer: &mut dyn FaceAnalyzer) -> Result<Detection, EngineError> {
    let frame = source.next_frame()?;
    if frame.is_dark {
        tracing::debug!(seq = frame.sequence, "dark frame, skipping detection");
        return Ok(Detection {
            frame,
            faces: Vec::new(),
        });
    }
    let faces = analyzer.detect_all(&frame.image)?;
    tracing::debug!(seq = frame.sequence, faces = faces.len(), "frame analyzed");
    Ok(Detection { frame, faces })
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use image::RgbImage;
    use knowyou_core::reference::{PhotoError, PhotoSource};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct BlankLoader;

    impl PhotoLoader for BlankLoader {
        fn load(&self, _source: &PhotoSource) -> Result<RgbImage, PhotoError> {
            Ok(RgbImage::new(2, 2))
        }
    }

    #[tokio::test]
    async fn test_warmup_frames_are_discarded() {
        let source = FakeSource::new(64, 48);
        let produced = source.produced.clone();
        let engine = Engine::spawn(Box::new(source), Box::new(ScriptedAnalyzer::new(vec![])), 3).unwrap();
        assert_eq!(produced.load(Ordering::SeqCst), 3);
        assert_eq!(engine.resolution(), (64, 48));

        let detection = engine.handle().detect().await.unwrap();
        assert_eq!(detection.frame.sequence, 3);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_warmup_failure_is_fatal() {
        let mut source = FakeSource::new(8, 8);
        source.fail_after = Some(1);
        let result = Engine::spawn(Box::new(source), Box::new(ScriptedAnalyzer::new(vec![])), 4);
        assert!(matches!(result, Err(EngineError::Camera(_))));
    }

    #[tokio::test]
    async fn test_detect_returns_analyzer_faces() {
        let analyzer = ScriptedAnalyzer::new(vec![(bbox(1.0, 2.0, 3.0, 4.0), vec![1.0, 0.0])]);
        let engine = Engine::spawn(Box::new(FakeSource::new(16, 16)), Box::new(analyzer), 0).unwrap();

        let detection = engine.handle().detect().await.unwrap();
        assert_eq!(detection.faces.len(), 1);
        assert_eq!(detection.faces[0].descriptor.values, vec![1.0, 0.0]);
        assert_eq!(detection.frame.width(), 16);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_dark_frame_skips_analysis() {
        let mut source = FakeSource::new(16, 16);
        source.dark = true;
        let analyzer = ScriptedAnalyzer::new(vec![(bbox(0.0, 0.0, 1.0, 1.0), vec![1.0])]);
        let calls = analyzer.calls.clone();
        let engine = Engine::spawn(Box::new(source), Box::new(analyzer), 0).unwrap();

        let detection = engine.handle().detect().await.unwrap();
        assert!(detection.faces.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_capture_error_is_reported() {
        let mut source = FakeSource::new(8, 8);
        source.fail_after = Some(0);
        let engine = Engine::spawn(Box::new(source), Box::new(ScriptedAnalyzer::new(vec![])), 0).unwrap();
        assert!(matches!(engine.handle().detect().await, Err(EngineError::Camera(_))));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_build_references_on_engine_thread() {
        let analyzer = ScriptedAnalyzer::new(vec![(bbox(0.0, 0.0, 1.0, 1.0), vec![0.5, 0.5])]);
        let engine = Engine::spawn(Box::new(FakeSource::new(8, 8)), Box::new(analyzer), 0).unwrap();
        let dataset = Dataset::from_json(
            r#"[{"name": "Alice", "photos": ["a.jpg", "b.jpg"]}]"#,
            PathBuf::from("/data"),
        )
        .unwrap();

        let build = engine.handle().build_references(dataset, Box::new(BlankLoader)).await.unwrap();
        assert_eq!(build.entries[0].descriptors.len(), 2);
        assert!(build.failures.is_empty());
        engine.shutdown().await;
    }

    /// Blocks inside its first call until released.
    struct GatedAnalyzer {
        entered: tokio::sync::mpsc::UnboundedSender<()>,
        gate: Option<std::sync::mpsc::Receiver<()>>,
        calls: Arc<AtomicUsize>,
    }

    impl FaceAnalyzer for GatedAnalyzer {
        fn detect_all(&mut self, _image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.entered.send(());
            if let Some(gate) = self.gate.take() {
                let _ = gate.recv();
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_abandoned_detect_requests_are_skipped() {
        let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let analyzer = GatedAnalyzer {
            entered: entered_tx,
            gate: Some(release_rx),
            calls: calls.clone(),
        };
        let engine = Engine::spawn(Box::new(FakeSource::new(8, 8)), Box::new(analyzer), 0).unwrap();
        let handle = engine.handle();

        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.detect().await }
        });
        entered_rx.recv().await.unwrap();

        // Both callers give up while the engine is stuck on the first frame.
        for _ in 0..2 {
            let late = tokio::time::timeout(Duration::from_millis(5), handle.detect()).await;
            assert!(late.is_err());
        }

        release_tx.send(()).unwrap();
        assert!(first.await.unwrap().is_ok());
        assert!(handle.detect().await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2, "queued requests of timed-out callers never reach the analyzer");

        drop(handle);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_outstanding_handles() {
        let engine = Engine::spawn(Box::new(FakeSource::new(8, 8)), Box::new(ScriptedAnalyzer::new(vec![])), 0).unwrap();
        let stale = engine.handle();
        // The outstanding handle keeps the thread alive until it is dropped too.
        let shutdown = tokio::spawn(engine.shutdown());
        assert!(stale.detect().await.is_ok());
        drop(stale);
        shutdown.await.unwrap();
    }
}
