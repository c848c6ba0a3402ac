//! Nearest-reference matching of face descriptors.

use crate::types::{Descriptor, FaceMatch, ReferenceEntry};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Default distance below which a descriptor is accepted as a known person.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("reference set has no descriptors: every photo failed or the dataset is empty")]
    NoDescriptors,
    #[error("descriptor for {name} has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// How two descriptors are compared. Smaller is closer for both.
///
/// Cosine is the default: ArcFace descriptors are unit length, and a
/// cosine distance of 0.6 is a similarity of 0.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Euclidean,
    /// `1 - cosine similarity`.
    #[default]
    Cosine,
}

impl DistanceMetric {
    pub fn distance(self, a: &Descriptor, b: &Descriptor) -> f32 {
        match self {
            Self::Euclidean => a.euclidean_distance(b),
            Self::Cosine => 1.0 - a.similarity(b),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" => Ok(Self::Euclidean),
            "cosine" => Ok(Self::Cosine),
            other => Err(format!("unknown distance metric: {other} (expected euclidean or cosine)")),
        }
    }
}

/// Strategy for labeling a query descriptor.
pub trait Matcher {
    fn find_best_match(&self, query: &Descriptor) -> FaceMatch;
}

/// Nearest-neighbour matcher over a fixed reference set.
///
/// Each reference entry is scored by the mean distance from the query to
/// all of its descriptors; the lowest score wins if it is strictly below
/// the threshold.
#[derive(Debug, Clone)]
pub struct FaceMatcher {
    entries: Vec<ReferenceEntry>,
    threshold: f32,
    metric: DistanceMetric,
    dimensions: usize,
}

impl FaceMatcher {
    pub fn new(
        entries: Vec<ReferenceEntry>,
        threshold: f32,
        metric: DistanceMetric,
    ) -> Result<Self, MatcherError> {
        let dimensions = entries
            .iter()
            .flat_map(|e| e.descriptors.first())
            .map(Descriptor::len)
            .next()
            .ok_or(MatcherError::NoDescriptors)?;

        for entry in &entries {
            if let Some(d) = entry.descriptors.iter().find(|d| d.len() != dimensions) {
                return Err(MatcherError::DimensionMismatch {
                    name: entry.name.clone(),
                    expected: dimensions,
                    actual: d.len(),
                });
            }
        }

        for entry in entries.iter().filter(|e| e.descriptors.is_empty()) {
            tracing::warn!(name = %entry.name, "reference entry has no descriptors and can never match");
        }

        Ok(Self {
            entries,
            threshold,
            metric,
            dimensions,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn entries(&self) -> &[ReferenceEntry] {
        &self.entries
    }

    fn mean_distance(&self, query: &Descriptor, descriptors: &[Descriptor]) -> f32 {
        descriptors
            .iter()
            .map(|d| self.metric.distance(query, d))
            .sum::<f32>()
            / descriptors.len() as f32
    }
}

impl Matcher for FaceMatcher {
    fn find_best_match(&self, query: &Descriptor) -> FaceMatch {
        if query.len() != self.dimensions {
            tracing::warn!(
                expected = self.dimensions,
                actual = query.len(),
                "query descriptor has wrong dimensionality"
            );
            return FaceMatch::unknown(f32::INFINITY);
        }

        let best = self
            .entries
            .iter()
            .filter(|e| !e.descriptors.is_empty())
            .map(|e| (e, self.mean_distance(query, &e.descriptors)))
            .min_by(|(_, a), (_, b)| a.total_cmp(b));

        match best {
            Some((entry, distance)) if distance < self.threshold => FaceMatch {
                name: Some(entry.name.clone()),
                distance,
            },
            Some((_, distance)) => FaceMatch::unknown(distance),
            None => FaceMatch::unknown(f32::INFINITY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, descriptors: &[&[f32]]) -> ReferenceEntry {
        ReferenceEntry {
            name: name.into(),
            descriptors: descriptors.iter().map(|v| Descriptor::new(v.to_vec())).collect(),
        }
    }

    fn matcher(entries: Vec<ReferenceEntry>) -> FaceMatcher {
        FaceMatcher::new(entries, DEFAULT_DISTANCE_THRESHOLD, DistanceMetric::Euclidean).unwrap()
    }

    #[test]
    fn test_identical_descriptor_matches() {
        let m = matcher(vec![
            entry("Alice", &[&[1.0, 0.0, 0.0]]),
            entry("Bob", &[&[0.0, 1.0, 0.0]]),
        ]);
        let result = m.find_best_match(&Descriptor::new(vec![1.0, 0.0, 0.0]));
        assert_eq!(result.name.as_deref(), Some("Alice"));
        assert!(result.distance.abs() < 1e-6);
    }

    #[test]
    fn test_smallest_distance_wins() {
        // Best match is the last entry; every entry must be scored.
        let m = matcher(vec![
            entry("decoy1", &[&[0.0, 1.0, 0.0]]),
            entry("decoy2", &[&[0.0, 0.0, 1.0]]),
            entry("match", &[&[0.9, 0.1, 0.0]]),
        ]);
        let result = m.find_best_match(&Descriptor::new(vec![1.0, 0.0, 0.0]));
        assert_eq!(result.label(), "match");
    }

    #[test]
    fn test_far_descriptor_is_unknown() {
        let m = matcher(vec![entry("Alice", &[&[1.0, 0.0]])]);
        let result = m.find_best_match(&Descriptor::new(vec![-1.0, 0.0]));
        assert!(result.is_unknown());
        assert_eq!(result.label(), "unknown");
        assert!((result.distance - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let m = FaceMatcher::new(vec![entry("Alice", &[&[0.0, 0.0]])], 0.5, DistanceMetric::Euclidean)
            .unwrap();
        let at = m.find_best_match(&Descriptor::new(vec![0.5, 0.0]));
        assert!(at.is_unknown(), "distance equal to the threshold is not a match");
        let below = m.find_best_match(&Descriptor::new(vec![0.49, 0.0]));
        assert_eq!(below.label(), "Alice");
    }

    #[test]
    fn test_mean_distance_over_entry_descriptors() {
        // Alice: distances 0.0 and 1.0 → mean 0.5. Bob: single 0.4 → Bob wins.
        let m = FaceMatcher::new(
            vec![
                entry("Alice", &[&[0.0, 0.0], &[1.0, 0.0]]),
                entry("Bob", &[&[0.0, 0.4]]),
            ],
            1.0,
            DistanceMetric::Euclidean,
        )
        .unwrap();
        let result = m.find_best_match(&Descriptor::new(vec![0.0, 0.0]));
        assert_eq!(result.label(), "Bob");
        assert!((result.distance - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_entry_without_descriptors_never_matches() {
        let m = matcher(vec![entry("Ghost", &[]), entry("Alice", &[&[1.0, 0.0]])]);
        let result = m.find_best_match(&Descriptor::new(vec![0.0, 1.0]));
        assert!(result.is_unknown());
    }

    #[test]
    fn test_empty_reference_set_rejected() {
        let err = FaceMatcher::new(vec![entry("Ghost", &[])], 0.6, DistanceMetric::Euclidean)
            .unwrap_err();
        assert!(matches!(err, MatcherError::NoDescriptors));
        assert!(matches!(
            FaceMatcher::new(vec![], 0.6, DistanceMetric::Euclidean),
            Err(MatcherError::NoDescriptors)
        ));
    }

    #[test]
    fn test_mixed_dimensions_rejected() {
        let err = FaceMatcher::new(
            vec![entry("Alice", &[&[1.0, 0.0]]), entry("Bob", &[&[1.0, 0.0, 0.0]])],
            0.6,
            DistanceMetric::Euclidean,
        )
        .unwrap_err();
        assert!(matches!(err, MatcherError::DimensionMismatch { expected: 2, actual: 3, .. }));
    }

    #[test]
    fn test_wrong_query_dimension_is_unknown() {
        let m = matcher(vec![entry("Alice", &[&[1.0, 0.0]])]);
        let result = m.find_best_match(&Descriptor::new(vec![1.0, 0.0, 0.0]));
        assert!(result.is_unknown());
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_cosine_metric() {
        let m = FaceMatcher::new(
            vec![entry("Alice", &[&[2.0, 0.0]])],
            0.1,
            DistanceMetric::Cosine,
        )
        .unwrap();
        // Same direction, different magnitude: cosine distance 0.
        assert_eq!(m.find_best_match(&Descriptor::new(vec![5.0, 0.0])).label(), "Alice");
        assert!(m.find_best_match(&Descriptor::new(vec![0.0, 1.0])).is_unknown());
    }

    #[test]
    fn test_default_calibration_accepts_same_person_pair() {
        // Unit descriptors with cosine similarity 0.55, typical for two
        // photos of one person.
        let reference = [1.0f32, 0.0];
        let query = Descriptor::new(vec![0.55, (1.0f32 - 0.55 * 0.55).sqrt()]);

        let m = FaceMatcher::new(
            vec![entry("Alice", &[&reference[..]])],
            DEFAULT_DISTANCE_THRESHOLD,
            DistanceMetric::default(),
        )
        .unwrap();
        let result = m.find_best_match(&query);
        assert_eq!(result.label(), "Alice");
        assert!((result.distance - 0.45).abs() < 1e-5);

        // The same pair is about 0.95 apart in Euclidean terms.
        let euclidean = FaceMatcher::new(
            vec![entry("Alice", &[&reference[..]])],
            DEFAULT_DISTANCE_THRESHOLD,
            DistanceMetric::Euclidean,
        )
        .unwrap();
        assert!(euclidean.find_best_match(&query).is_unknown());
    }

    #[test]
    fn test_metric_from_str() {
        assert_eq!("Cosine".parse::<DistanceMetric>().unwrap(), DistanceMetric::Cosine);
        assert_eq!("euclidean".parse::<DistanceMetric>().unwrap(), DistanceMetric::Euclidean);
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }
}
