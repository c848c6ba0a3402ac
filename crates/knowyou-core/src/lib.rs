//! knowyou-core: Face detection, description, matching and overlay rendering.
//!
//! Uses SCRFD for face detection and ArcFace for face descriptors, both
//! running via ONNX Runtime, and a nearest-reference matcher over a small
//! named dataset.

pub mod alignment;
pub mod analyzer;
pub mod detector;
pub mod matcher;
pub mod overlay;
pub mod recognizer;
pub mod reference;
pub mod types;

pub use analyzer::{default_model_dir, AnalyzerError, FaceAnalyzer, ModelPaths, OnnxFaceAnalyzer};
pub use matcher::{DistanceMetric, FaceMatcher, Matcher, MatcherError, DEFAULT_DISTANCE_THRESHOLD};
pub use overlay::{render_detections, Annotation, Canvas, RasterCanvas, RecordingCanvas};
pub use reference::{build_reference_set, Dataset, DefaultPhotoLoader, PhotoLoader, ReferenceBuild};
pub use types::{BoundingBox, Descriptor, DetectedFace, FaceMatch, ReferenceEntry};
