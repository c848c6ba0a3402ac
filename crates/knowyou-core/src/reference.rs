//! Reference dataset loading and reference-set building.
//!
//! The dataset is a JSON array of `{ "name": ..., "photos": [...] }`
//! records. Each photo is loaded and analyzed to completion before the set
//! is returned; per-photo failures are collected next to the successes
//! instead of being dropped.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::types::{Descriptor, ReferenceEntry};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("failed to read dataset {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid dataset {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum PhotoError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("failed to fetch image: {0}")]
    Fetch(#[from] reqwest::Error),
}

/// One named person and the photos that show them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub name: String,
    pub photos: Vec<String>,
}

/// The reference dataset as read from disk.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub entries: Vec<DatasetEntry>,
    /// Directory relative photo paths are resolved against.
    pub base_dir: PathBuf,
}

impl Dataset {
    /// Read and parse a dataset file.
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let raw = std::fs::read_to_string(path).map_err(|source| DatasetError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_json(&raw, base_dir).map_err(|source| DatasetError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(raw: &str, base_dir: PathBuf) -> Result<Self, serde_json::Error> {
        let entries: Vec<DatasetEntry> = serde_json::from_str(raw)?;
        Ok(Self { entries, base_dir })
    }

    pub fn photo_count(&self) -> usize {
        self.entries.iter().map(|e| e.photos.len()).sum()
    }
}

/// Where a photo comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhotoSource {
    Url(String),
    Path(PathBuf),
}

impl PhotoSource {
    /// `http://` and `https://` are fetched; anything else is a file path,
    /// relative ones resolved against `base_dir`.
    pub fn parse(raw: &str, base_dir: &Path) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Self::Url(raw.to_string())
        } else {
            Self::Path(base_dir.join(raw))
        }
    }
}

impl fmt::Display for PhotoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Loads reference photos into RGB images.
pub trait PhotoLoader: Send {
    fn load(&self, source: &PhotoSource) -> Result<RgbImage, PhotoError>;
}

/// Reads files with `image` and fetches URLs with a blocking HTTP client.
///
/// The client is built on first use so the loader can be created inside an
/// async context and moved to the thread that actually blocks.
pub struct DefaultPhotoLoader {
    client: OnceLock<reqwest::blocking::Client>,
}

impl DefaultPhotoLoader {
    pub fn new() -> Self {
        Self {
            client: OnceLock::new(),
        }
    }
}

impl Default for DefaultPhotoLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl PhotoLoader for DefaultPhotoLoader {
    fn load(&self, source: &PhotoSource) -> Result<RgbImage, PhotoError> {
        let image = match source {
            PhotoSource::Path(path) => image::open(path)?,
            PhotoSource::Url(url) => {
                let client = self.client.get_or_init(reqwest::blocking::Client::new);
                let bytes = client.get(url).send()?.error_for_status()?.bytes()?;
                image::load_from_memory(&bytes)?
            }
        };
        Ok(image.to_rgb8())
    }
}

/// Why a photo contributed no descriptor.
#[derive(Error, Debug)]
pub enum PhotoFailureReason {
    #[error("{0}")]
    Load(#[from] PhotoError),
    #[error("{0}")]
    Analyze(#[from] AnalyzerError),
    #[error("no face found")]
    NoFace,
}

#[derive(Debug)]
pub struct PhotoFailure {
    pub name: String,
    pub photo: PhotoSource,
    pub reason: PhotoFailureReason,
}

/// Result of building the reference set: every entry (possibly with fewer
/// descriptors than photos) plus the photos that failed.
#[derive(Debug, Default)]
pub struct ReferenceBuild {
    pub entries: Vec<ReferenceEntry>,
    pub failures: Vec<PhotoFailure>,
}

impl ReferenceBuild {
    pub fn descriptor_count(&self) -> usize {
        self.entries.iter().map(|e| e.descriptors.len()).sum()
    }
}

/// Build one reference entry per dataset entry, one descriptor per photo
/// in which a face was found.
pub fn build_reference_set(
    dataset: &Dataset,
    analyzer: &mut dyn FaceAnalyzer,
    loader: &dyn PhotoLoader,
) -> ReferenceBuild {
    let mut build = ReferenceBuild::default();

    for entry in &dataset.entries {
        let mut descriptors = Vec::with_capacity(entry.photos.len());

        for raw in &entry.photos {
            let photo = PhotoSource::parse(raw, &dataset.base_dir);
            match describe_photo(&photo, analyzer, loader) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(reason) => {
                    tracing::warn!(name = %entry.name, %photo, error = %reason, "reference photo skipped");
                    build.failures.push(PhotoFailure {
                        name: entry.name.clone(),
                        photo,
                        reason,
                    });
                }
            }
        }

        tracing::debug!(
            name = %entry.name,
            photos = entry.photos.len(),
            descriptors = descriptors.len(),
            "reference entry built"
        );
        build.entries.push(ReferenceEntry {
            name: entry.name.clone(),
            descriptors,
        });
    }

    tracing::info!(
        entries = build.entries.len(),
        descriptors = build.descriptor_count(),
        failures = build.failures.len(),
        "reference set built"
    );
    build
}

fn describe_photo(
    photo: &PhotoSource,
    analyzer: &mut dyn FaceAnalyzer,
    loader: &dyn PhotoLoader,
) -> Result<Descriptor, PhotoFailureReason> {
    let image = loader.load(photo)?;
    let face = analyzer.detect_single(&image)?.ok_or(PhotoFailureReason::NoFace)?;
    Ok(face.descriptor)
}
