//! Detection plus descriptor extraction behind one trait.

use crate::detector::{FaceDetector, DetectorError, DEFAULT_NMS_THRESHOLD};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::DetectedFace;
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("model loader thread panicked")]
    LoaderPanicked,
}

/// Finds faces in an image and describes each one.
pub trait FaceAnalyzer: Send {
    /// Every face in the image with its descriptor, most confident first.
    fn detect_all(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError>;

    /// The single most confident face, if any.
    fn detect_single(&mut self, image: &RgbImage) -> Result<Option<DetectedFace>, AnalyzerError> {
        Ok(self
            .detect_all(image)?
            .into_iter()
            .max_by(|a, b| a.bbox.confidence.total_cmp(&b.bbox.confidence)))
    }
}

/// Locations of the two ONNX models.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
}

impl ModelPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR_MODEL_FILE),
            recognizer: dir.join(RECOGNIZER_MODEL_FILE),
        }
    }
}

/// Model directory used when none is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

/// SCRFD detector and ArcFace recognizer run back to back.
pub struct OnnxFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceAnalyzer {
    /// Load both models concurrently. Nothing is returned unless both load.
    pub fn load(paths: &ModelPaths, confidence_threshold: f32) -> Result<Self, AnalyzerError> {
        tracing::info!(
            detector = %paths.detector.display(),
            recognizer = %paths.recognizer.display(),
            "loading models"
        );

        let (detector, recognizer) = std::thread::scope(|s| {
            let det = s.spawn(|| FaceDetector::load(&paths.detector));
            let rec = s.spawn(|| FaceRecognizer::load(&paths.recognizer));
            (det.join(), rec.join())
        });

        let detector = detector
            .map_err(|_| AnalyzerError::LoaderPanicked)??
            .with_thresholds(confidence_threshold, DEFAULT_NMS_THRESHOLD);
        let recognizer = recognizer.map_err(|_| AnalyzerError::LoaderPanicked)??;

        tracing::debug!("detector and recognizer ready");
        Ok(Self { detector, recognizer })
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn detect_all(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
        let boxes = self.detector.detect(image)?;
        let mut faces = Vec::with_capacity(boxes.len());

        for bbox in boxes {
            if bbox.landmarks.is_none() {
                tracing::debug!(confidence = bbox.confidence, "skipping face without landmarks");
                continue;
            }
            let descriptor = self.recognizer.extract(image, &bbox)?;
            faces.push(DetectedFace { bbox, descriptor });
        }

        Ok(faces)
    }

    fn detect_single(&mut self, image: &RgbImage) -> Result<Option<DetectedFace>, AnalyzerError> {
        let boxes = self.detector.detect(image)?;
        if boxes.len() > 1 {
            tracing::debug!(faces = boxes.len(), "several faces found, keeping the most confident");
        }
        // Detector output is sorted by confidence.
        let Some(bbox) = boxes.into_iter().find(|b| b.landmarks.is_some()) else {
            return Ok(None);
        };
        let descriptor = self.recognizer.extract(image, &bbox)?;
        Ok(Some(DetectedFace { bbox, descriptor }))
    }
}
