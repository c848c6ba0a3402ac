//! Recognition session: bootstrap, polling and teardown.
//!
//! A [`Session`] owns everything a running overlay needs. Dropping the
//! polling task and the engine thread happens in [`Session::shutdown`].

use crate::config::Config;
use crate::engine::{Engine, EngineHandle};
use crate::poll::{poll_until_cancelled, PollStats};
use anyhow::{Context, Result};
use knowyou_core::{
    render_detections, Annotation, Canvas, Dataset, DefaultPhotoLoader, FaceMatcher, OnnxFaceAnalyzer, RasterCanvas,
};
use knowyou_hw::{Camera, Frame};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of one polling cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub frame_sequence: u32,
    pub annotations: Vec<Annotation>,
}

/// Called with the canvas and the source frame after every render.
pub type RenderSink<C> = Box<dyn Fn(&C, &Frame) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub poll_interval: Duration,
    pub cycle_timeout: Option<Duration>,
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            cycle_timeout: config.cycle_timeout(),
        }
    }
}

pub struct Session<C> {
    engine: Engine,
    canvas: Arc<Mutex<C>>,
    token: CancellationToken,
    task: JoinHandle<PollStats>,
    reports: watch::Receiver<CycleReport>,
}

impl Session<RasterCanvas> {
    /// Prepare the overlay, load models, open the camera, wait for the
    /// stream, describe the dataset and start polling. Stages run in that
    /// order and the first failure aborts the bootstrap.
    pub async fn bootstrap(config: &Config) -> Result<Self> {
        let canvas = raster_canvas(config)?;

        let paths = config.model_paths();
        let confidence = config.detection_confidence;
        let analyzer = tokio::task::spawn_blocking(move || OnnxFaceAnalyzer::load(&paths, confidence))
            .await?
            .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?;
        tracing::info!(dir = %config.model_dir.display(), "models loaded");

        let device = config.camera_device.clone();
        let (width, height) = (config.width, config.height);
        let camera = tokio::task::spawn_blocking(move || Camera::open(&device, width, height))
            .await?
            .with_context(|| format!("failed to open camera {}", config.camera_device))?;
        tracing::info!(device = %config.camera_device, "camera opened");

        let warmup = config.warmup_frames;
        let engine = tokio::task::spawn_blocking(move || Engine::spawn(Box::new(camera), Box::new(analyzer), warmup))
            .await?
            .context("camera stream did not start")?;
        let (frame_width, frame_height) = engine.resolution();
        tracing::info!(width = frame_width, height = frame_height, "camera stream playing");

        let dataset = Dataset::load(&config.dataset_path)?;
        tracing::info!(
            path = %config.dataset_path.display(),
            people = dataset.entries.len(),
            photos = dataset.photo_count(),
            "dataset loaded"
        );

        let build = engine
            .handle()
            .build_references(dataset, Box::new(DefaultPhotoLoader::new()))
            .await?;
        tracing::info!(
            people = build.entries.len(),
            descriptors = build.descriptor_count(),
            failed = build.failures.len(),
            "reference set built"
        );

        let matcher = FaceMatcher::new(build.entries, config.distance_threshold, config.metric)
            .context("failed to build face matcher")?;
        tracing::info!(threshold = matcher.threshold(), metric = ?matcher.metric(), "matcher ready");

        let sink = config.overlay_output.clone().map(composite_writer);

        Ok(Self::start(engine, matcher, canvas, SessionOptions::from(config), sink))
    }
}

impl<C: Canvas + Send + 'static> Session<C> {
    /// Start polling `engine` with an already-built matcher.
    pub fn start(
        engine: Engine,
        matcher: FaceMatcher,
        canvas: C,
        options: SessionOptions,
        sink: Option<RenderSink<C>>,
    ) -> Self {
        let canvas = Arc::new(Mutex::new(canvas));
        let matcher = Arc::new(matcher);
        let token = CancellationToken::new();
        let (reports_tx, reports) = watch::channel(CycleReport::default());

        let cycle = {
            let handle = engine.handle();
            let canvas = canvas.clone();
            let matcher = matcher.clone();
            let sink = sink.map(Arc::new);
            let reports_tx = Arc::new(reports_tx);
            move |n: u64| {
                let handle = handle.clone();
                let canvas = canvas.clone();
                let matcher = matcher.clone();
                let sink = sink.clone();
                let reports_tx = reports_tx.clone();
                async move {
                    if let Some(report) = run_cycle(n, &handle, &canvas, &matcher, sink.as_deref()).await {
                        reports_tx.send_replace(report);
                    }
                }
            }
        };

        tracing::info!(
            interval_ms = options.poll_interval.as_millis() as u64,
            timeout_ms = options.cycle_timeout.map(|d| d.as_millis() as u64),
            "polling started"
        );
        let task = tokio::spawn(poll_until_cancelled(
            options.poll_interval,
            options.cycle_timeout,
            token.clone(),
            cycle,
        ));

        Self {
            engine,
            canvas,
            token,
            task,
            reports,
        }
    }

    /// Receiver that sees the latest cycle report.
    pub fn subscribe(&self) -> watch::Receiver<CycleReport> {
        self.reports.clone()
    }

    pub fn canvas(&self) -> Arc<Mutex<C>> {
        self.canvas.clone()
    }

    /// Stop polling, wait for the in-flight cycle to be dropped, then stop
    /// the engine and release the camera.
    pub async fn shutdown(self) -> PollStats {
        self.token.cancel();
        let stats = match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!(error = %e, "poll task failed");
                PollStats::default()
            }
        };
        self.engine.shutdown().await;
        tracing::info!(completed = stats.completed, timed_out = stats.timed_out, "session stopped");
        stats
    }
}

async fn run_cycle<C: Canvas + 'static>(
    n: u64,
    engine: &EngineHandle,
    canvas: &Mutex<C>,
    matcher: &FaceMatcher,
    sink: Option<&RenderSink<C>>,
) -> Option<CycleReport> {
    let detection = match engine.detect().await {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(cycle = n, error = %e, "detection failed");
            return None;
        }
    };

    let frame_size = (detection.frame.width(), detection.frame.height());
    let annotations = {
        let mut canvas = canvas.lock().unwrap_or_else(PoisonError::into_inner);
        let annotations = render_detections(&mut *canvas, matcher, &detection.faces, frame_size);
        if let Some(sink) = sink {
            if let Err(e) = sink(&*canvas, &detection.frame) {
                tracing::warn!(cycle = n, error = %e, "failed to write overlay");
            }
        }
        annotations
    };

    for a in &annotations {
        tracing::debug!(cycle = n, label = %a.label, distance = a.distance, "face labeled");
    }
    tracing::info!(cycle = n, seq = detection.frame.sequence, faces = annotations.len(), "cycle rendered");

    Some(CycleReport {
        cycle: n,
        frame_sequence: detection.frame.sequence,
        annotations,
    })
}

/// Overlay canvas at the display size, with label text when a font is set.
pub fn raster_canvas(config: &Config) -> Result<RasterCanvas> {
    let canvas = RasterCanvas::new(config.width, config.height);
    match &config.font_path {
        Some(path) => Ok(canvas.with_font(RasterCanvas::load_font(path)?)),
        None => {
            tracing::warn!("no font configured, labels are drawn without text");
            Ok(canvas)
        }
    }
}

fn composite_writer(path: PathBuf) -> RenderSink<RasterCanvas> {
    Box::new(move |canvas: &RasterCanvas, frame: &Frame| {
        canvas.save_composite(&frame.image, &path)?;
        Ok(())
    })
}
